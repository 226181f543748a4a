//! Dual-thread state exchange
//!
//! The current session state is published as an immutable value in a
//! `basedrop::SharedCell`. Publishing swaps in a fresh allocation and is done
//! only on non-real-time threads; reading takes a reference and copies the
//! value out, which never blocks, allocates or frees.
//!
//! The audio thread never writes the cell. Its commits travel through a
//! pre-allocated `rtrb` ring buffer to the controller thread, which applies
//! them to the engine and publishes the result.
//!
//! ```text
//!  audio thread                controller thread             app thread
//!  ────────────                ─────────────────             ──────────
//!  capture() ◄──── SharedCell ◄──── publish() ────────────► capture (lock)
//!  commit()  ────► rtrb ring  ────► engine.commit_local()    commit  (lock)
//! ```

use crate::session_state::{Changes, SessionState};
use basedrop::{Handle, Shared, SharedCell};
use rtrb::{Consumer, Producer, PushError, RingBuffer};
use std::sync::Arc;

/// Value stored in the published cell
#[derive(Debug, Clone, Copy)]
pub(crate) struct Published {
    pub state: SessionState,
    /// Id of the last real-time commit folded into `state`
    pub rt_applied: u64,
}

/// A real-time commit in flight to the controller
#[derive(Debug, Clone, Copy)]
pub(crate) struct RtCommit {
    pub state: SessionState,
    pub id: u64,
}

/// Writer side of the published cell
pub(crate) struct StatePublisher {
    cell: Arc<SharedCell<Published>>,
    handle: Handle,
}

impl StatePublisher {
    pub fn new(handle: Handle, initial: SessionState) -> Self {
        let published = Published {
            state: initial,
            rt_applied: 0,
        };
        Self {
            cell: Arc::new(SharedCell::new(Shared::new(&handle, published))),
            handle,
        }
    }

    /// Replace the published state (allocates; never call on the audio thread)
    pub fn publish(&self, state: SessionState, rt_applied: u64) {
        self.cell.set(Shared::new(&self.handle, Published { state, rt_applied }));
    }

    pub fn load(&self) -> Published {
        *self.cell.get()
    }

    /// Create the real-time handle and the controller's end of its queue
    pub fn realtime_channel(&self, capacity: usize) -> (RealtimeHandle, RealtimeCommits) {
        let (producer, consumer) = RingBuffer::new(capacity.max(1));
        let handle = RealtimeHandle {
            published: self.cell.clone(),
            producer,
            next_id: 0,
            pending: None,
            overflow: None,
        };
        (handle, RealtimeCommits { consumer })
    }
}

/// Controller side of the real-time commit queue
pub(crate) struct RealtimeCommits {
    consumer: Consumer<RtCommit>,
}

impl RealtimeCommits {
    pub fn pop(&mut self) -> Option<RtCommit> {
        self.consumer.pop().ok()
    }
}

/// Capture/commit surface for the audio thread
///
/// `capture` and `commit` never block, lock or allocate. There is one handle
/// per `Link`; it can be moved to the audio thread but not shared.
///
/// A commit becomes visible to this handle's next `capture` immediately, and
/// to the control path once the controller thread has applied it (within a
/// millisecond or so).
pub struct RealtimeHandle {
    published: Arc<SharedCell<Published>>,
    producer: Producer<RtCommit>,
    next_id: u64,
    /// Last commit, shadowing the published state until it is applied
    pending: Option<RtCommit>,
    /// Commit that did not fit in the ring buffer
    overflow: Option<RtCommit>,
}

impl RealtimeHandle {
    /// Snapshot of the current session state
    pub fn capture(&mut self) -> SessionState {
        self.flush_overflow();
        let current = *self.published.get();
        match self.pending {
            Some(commit) if current.rt_applied < commit.id => commit
                .state
                .with_changes(Changes::NONE)
                .with_num_peers(current.state.num_peers()),
            _ => {
                self.pending = None;
                current.state
            }
        }
    }

    /// Commit a modified snapshot; untouched snapshots are ignored
    pub fn commit(&mut self, state: SessionState) {
        if state.changes().is_empty() {
            return;
        }
        self.next_id += 1;
        let commit = RtCommit {
            state,
            id: self.next_id,
        };
        self.pending = Some(commit);

        self.flush_overflow();
        if let Some(held) = self.overflow.as_mut() {
            // Still full: the newer state already contains the held one
            let changes = held.state.changes().union(state.changes());
            *held = RtCommit {
                state: state.with_changes(changes),
                id: commit.id,
            };
            return;
        }
        if let Err(PushError::Full(rejected)) = self.producer.push(commit) {
            self.overflow = Some(rejected);
        }
    }

    fn flush_overflow(&mut self) {
        if let Some(held) = self.overflow.take() {
            if let Err(PushError::Full(rejected)) = self.producer.push(held) {
                self.overflow = Some(rejected);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::gc_handle;
    use crate::start_stop::StartStopState;
    use crate::timeline::Timeline;
    use crate::types::HostTime;

    fn initial() -> SessionState {
        let tl = Timeline::new(120.0, 0.0, HostTime(0)).unwrap();
        SessionState::new(tl, StartStopState::default(), 0)
    }

    fn publisher() -> StatePublisher {
        StatePublisher::new(gc_handle().unwrap(), initial())
    }

    #[test]
    fn test_capture_sees_published_state() {
        let publisher = publisher();
        let (mut rt, _commits) = publisher.realtime_channel(4);
        assert_eq!(rt.capture().tempo(), 120.0);

        let mut next = initial();
        next.set_tempo(99.0, HostTime(0)).unwrap();
        publisher.publish(next.with_changes(Changes::NONE), 0);
        assert_eq!(rt.capture().tempo(), 99.0);
    }

    #[test]
    fn test_own_commit_visible_before_applied() {
        let publisher = publisher();
        let (mut rt, mut commits) = publisher.realtime_channel(4);
        let mut state = rt.capture();
        state.set_tempo(140.0, HostTime(0)).unwrap();
        rt.commit(state);

        let seen = rt.capture();
        assert_eq!(seen.tempo(), 140.0);
        assert!(seen.changes().is_empty());

        // Controller applies it, then the published state takes over
        let commit = commits.pop().unwrap();
        assert_eq!(commit.id, 1);
        assert!(commit.state.changes().contains(Changes::TIMELINE));
        let mut merged = commit.state.with_changes(Changes::NONE);
        merged.set_tempo(141.0, HostTime(0)).unwrap();
        publisher.publish(merged.with_changes(Changes::NONE), commit.id);
        assert_eq!(rt.capture().tempo(), 141.0);
    }

    #[test]
    fn test_untouched_commit_is_ignored() {
        let publisher = publisher();
        let (mut rt, mut commits) = publisher.realtime_channel(4);
        let state = rt.capture();
        rt.commit(state);
        assert!(commits.pop().is_none());
    }

    #[test]
    fn test_full_ring_keeps_newest_commit() {
        let publisher = publisher();
        let (mut rt, mut commits) = publisher.realtime_channel(1);

        let mut first = rt.capture();
        first.set_tempo(100.0, HostTime(0)).unwrap();
        rt.commit(first);

        let mut second = rt.capture();
        second.set_is_playing(true, HostTime(10));
        rt.commit(second);

        let mut third = rt.capture();
        third.set_tempo(110.0, HostTime(0)).unwrap();
        rt.commit(third);

        assert_eq!(commits.pop().unwrap().id, 1);
        // Ring drained; the held commit goes out on the next call
        let _ = rt.capture();
        let held = commits.pop().unwrap();
        assert_eq!(held.id, 3);
        assert_eq!(held.state.tempo(), 110.0);
        assert!(held.state.is_playing());
        assert!(held.state.changes().contains(Changes::START_STOP.union(Changes::TIMELINE)));
        assert!(commits.pop().is_none());
    }
}
