//! Precedence keys for timelines and sessions
//!
//! Both keys are total orders computed identically on every peer, so two
//! peers holding the same information always pick the same winner.

use crate::types::{PeerId, SessionId};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;

/// Lamport stamp of a timeline change
///
/// `seq` is one more than the largest sequence the author had seen when it
/// made the change. Equal sequences go to the lower author id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub seq: u64,
    pub author: PeerId,
}

impl Stamp {
    /// Largest sequence a peer will accept or produce
    pub const MAX_SEQ: u64 = 1 << 53;

    pub fn new(seq: u64, author: PeerId) -> Self {
        Self { seq, author }
    }

    #[inline]
    pub fn key(&self) -> (u64, Reverse<PeerId>) {
        (self.seq, Reverse(self.author))
    }

    #[inline]
    pub fn supersedes(&self, other: &Stamp) -> bool {
        self.key() > other.key()
    }
}

/// Ordering key used when two sessions meet
///
/// The session with more members wins; equal sizes go to the lower session
/// id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SessionKey {
    members: usize,
    id: Reverse<SessionId>,
}

impl SessionKey {
    pub fn new(members: usize, id: SessionId) -> Self {
        Self {
            members,
            id: Reverse(id),
        }
    }

    pub fn members(&self) -> usize {
        self.members
    }

    pub fn session(&self) -> SessionId {
        self.id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: u64) -> SessionId {
        SessionId(PeerId(id))
    }

    #[test]
    fn test_larger_session_wins() {
        assert!(SessionKey::new(3, session(9)) > SessionKey::new(2, session(1)));
    }

    #[test]
    fn test_equal_size_goes_to_lower_id() {
        let a = SessionKey::new(1, session(0x10));
        let b = SessionKey::new(1, session(0x20));
        assert!(a > b);
        assert_eq!(a.max(b).session(), session(0x10));
        assert_eq!(b.max(a).session(), session(0x10));
    }

    #[test]
    fn test_stamp_order() {
        let older = Stamp::new(4, PeerId(1));
        let newer = Stamp::new(5, PeerId(9));
        assert!(newer.supersedes(&older));
        assert!(!older.supersedes(&newer));
        assert!(!newer.supersedes(&newer));
        // Concurrent changes: lower author wins
        assert!(Stamp::new(5, PeerId(2)).supersedes(&newer));
    }
}
