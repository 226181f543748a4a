//! Common types for pulselink
//!
//! Time values are opaque nanosecond counts. `HostTime` is only meaningful on
//! the device that produced it; `GhostTime` is the session-wide axis that
//! peers agree on through clock measurement.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Nanoseconds per minute, the scale factor between tempo and host time
pub const NANOS_PER_MINUTE: f64 = 60e9;

/// Nanoseconds per millisecond
pub const NANOS_PER_MILLI: i64 = 1_000_000;

/// Monotonic device-local time in nanoseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HostTime(pub i64);

impl HostTime {
    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    #[inline]
    pub const fn nanos(self) -> i64 {
        self.0
    }

    /// Shift by a signed number of nanoseconds (saturating)
    #[inline]
    pub const fn offset(self, nanos: i64) -> Self {
        Self(self.0.saturating_add(nanos))
    }

    /// Shift forward by a duration (saturating)
    #[inline]
    pub fn after(self, duration: std::time::Duration) -> Self {
        self.offset(duration_nanos(duration))
    }

    /// Signed nanoseconds from `earlier` to `self`
    #[inline]
    pub const fn since(self, earlier: HostTime) -> i64 {
        self.0.saturating_sub(earlier.0)
    }
}

/// Time on the session-wide virtual axis, in nanoseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GhostTime(pub i64);

impl GhostTime {
    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    #[inline]
    pub const fn nanos(self) -> i64 {
        self.0
    }

    /// Signed nanoseconds from `earlier` to `self`
    #[inline]
    pub const fn since(self, earlier: GhostTime) -> i64 {
        self.0.saturating_sub(earlier.0)
    }
}

/// Identity of one `Link` instance on the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl PeerId {
    /// Generate a random, non-zero peer id
    pub fn random() -> Self {
        loop {
            let id: u64 = rand::random();
            if id != 0 {
                return Self(id);
            }
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Identity of a session: the id of the peer that founded it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub PeerId);

impl SessionId {
    /// The founder of this session
    pub fn founder(&self) -> PeerId {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Convert a `Duration` to signed nanoseconds, saturating at `i64::MAX`
#[inline]
pub fn duration_nanos(duration: std::time::Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}
