//! Host clock sources
//!
//! The engine never reads the clock itself; the controller thread and the
//! `Link` façade pass `now` in explicitly. This keeps the merge and resolver
//! logic deterministic under test with a [`ManualClock`].

use crate::types::HostTime;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// A monotonic host clock
pub trait Clock: Send + Sync {
    /// Current host time
    fn now(&self) -> HostTime;
}

/// Process-wide epoch shared by every `SystemClock`
static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic clock backed by `std::time::Instant`
///
/// All instances in a process share one epoch, so host times from different
/// `Link` instances in the same process are directly comparable.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        // Pin the epoch at construction so early readings are small and positive
        EPOCH.get_or_init(Instant::now);
        Self
    }
}

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> HostTime {
        let epoch = *EPOCH.get_or_init(Instant::now);
        let elapsed = epoch.elapsed().as_nanos();
        HostTime(i64::try_from(elapsed).unwrap_or(i64::MAX))
    }
}

/// Manually advanced clock for simulations and tests
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicI64,
}

impl ManualClock {
    pub fn new(start: HostTime) -> Self {
        Self {
            nanos: AtomicI64::new(start.nanos()),
        }
    }

    /// Jump to an absolute time
    pub fn set(&self, time: HostTime) {
        self.nanos.store(time.nanos(), Ordering::Release);
    }

    /// Advance by a number of nanoseconds and return the new time
    pub fn advance(&self, nanos: i64) -> HostTime {
        HostTime(self.nanos.fetch_add(nanos, Ordering::AcqRel) + nanos)
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now(&self) -> HostTime {
        HostTime(self.nanos.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
        assert!(a.nanos() >= 0);
    }

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(HostTime(100));
        assert_eq!(clock.advance(50), HostTime(150));
        assert_eq!(clock.now(), HostTime(150));
        clock.set(HostTime(10));
        assert_eq!(clock.now(), HostTime(10));
    }
}
