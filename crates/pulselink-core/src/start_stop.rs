//! Transport start/stop intent and its precedence rule
//!
//! Start/stop states converge by a total order: the state whose transition
//! time is latest wins, and equal times go to the lower peer id. Taking the
//! maximum of a total order is idempotent and commutative, so every peer
//! ends up with the same winner whatever order the messages arrive in.

use crate::types::{GhostTime, HostTime, PeerId};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;

/// Start/stop intent as seen by local callers (host time axis)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartStopState {
    pub is_playing: bool,
    /// Host time at which the transition becomes effective
    pub time: HostTime,
}

impl StartStopState {
    pub fn new(is_playing: bool, time: HostTime) -> Self {
        Self { is_playing, time }
    }
}

/// Start/stop intent on the session axis, tagged with the peer that made it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStartStop {
    pub is_playing: bool,
    pub time: GhostTime,
    pub author: PeerId,
}

/// Ordering key for start/stop precedence
pub type StartStopKey = (GhostTime, Reverse<PeerId>);

impl SessionStartStop {
    #[inline]
    pub fn key(&self) -> StartStopKey {
        (self.time, Reverse(self.author))
    }

    /// Whether `self` takes precedence over `other`
    #[inline]
    pub fn supersedes(&self, other: &SessionStartStop) -> bool {
        self.key() > other.key()
    }
}

/// Outcome of folding one start/stop update into the current state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartStopMerge {
    /// The update won and replaced the current state
    Adopted,
    /// The update is identical to the current state
    Unchanged,
    /// The update lost on precedence and was discarded
    Stale,
}

/// Fold `incoming` into `current` by precedence
pub fn merge_start_stop(current: &mut SessionStartStop, incoming: SessionStartStop) -> StartStopMerge {
    if incoming == *current {
        StartStopMerge::Unchanged
    } else if incoming.supersedes(current) {
        *current = incoming;
        StartStopMerge::Adopted
    } else {
        StartStopMerge::Stale
    }
}
