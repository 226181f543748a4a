//! RT-safe reclamation of published snapshots
//!
//! Published session states live in `basedrop::Shared` allocations. When the
//! audio thread drops the last reference to an outdated snapshot, the memory
//! is not freed there: the pointer is queued and a background collector
//! thread frees it later.
//!
//! ```ignore
//! let snapshot = Shared::new(&gc_handle()?, published);
//! cell.set(snapshot); // old value is reclaimed by the collector
//! ```

use crate::error::{LinkError, LinkResult};
use basedrop::{Collector, Handle};
use std::sync::{mpsc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

/// Global collector handle, created on first use
static GC_HANDLE: Mutex<Option<Handle>> = Mutex::new(None);

/// How often the collector thread reclaims queued drops
const COLLECT_INTERVAL: Duration = Duration::from_millis(100);

fn spawn_collector() -> LinkResult<Handle> {
    let (tx, rx) = mpsc::channel();

    thread::Builder::new()
        .name("pulselink-gc".to_string())
        .spawn(move || {
            // Collector is !Sync, so it lives on this thread only
            let mut collector = Collector::new();
            if tx.send(collector.handle()).is_err() {
                return;
            }
            log::info!("Snapshot GC thread started");
            loop {
                collector.collect();
                thread::sleep(COLLECT_INTERVAL);
            }
        })
        .map_err(|source| LinkError::Spawn { name: "pulselink-gc", source })?;

    rx.recv().map_err(|_| LinkError::Spawn {
        name: "pulselink-gc",
        source: std::io::Error::other("collector thread exited before handing out its handle"),
    })
}

/// Handle for creating `Shared<T>` allocations
///
/// Spawns the collector thread on first call. Never call this from the
/// audio thread.
pub fn gc_handle() -> LinkResult<Handle> {
    let mut slot = GC_HANDLE.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(handle) = slot.as_ref() {
        return Ok(handle.clone());
    }
    let handle = spawn_collector()?;
    *slot = Some(handle.clone());
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use basedrop::Shared;

    #[test]
    fn test_gc_handle_is_reused() {
        let a = gc_handle().unwrap();
        let b = gc_handle().unwrap();
        let x = Shared::new(&a, 1u32);
        let y = Shared::new(&b, 2u32);
        assert_eq!(*x + *y, 3);
    }
}
