//! Last-known state of every peer

use super::membership::{SessionKey, Stamp};
use crate::ghost::SessionTimeline;
use crate::start_stop::SessionStartStop;
use crate::types::{HostTime, PeerId, SessionId};
use std::collections::HashMap;

/// What this device believes about one remote peer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeerSessionView {
    pub session: SessionId,
    /// Members the peer reported for its session
    pub members: usize,
    pub timeline: SessionTimeline,
    pub stamp: Stamp,
    pub start_stop: Option<SessionStartStop>,
    /// Local host time of the last message from this peer
    pub last_seen: HostTime,
}

/// Table of live peers keyed by id
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<PeerId, PeerSessionView>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a peer; returns true if the peer is new
    pub fn upsert(&mut self, id: PeerId, view: PeerSessionView) -> bool {
        self.peers.insert(id, view).is_none()
    }

    /// Refresh the liveness of a known peer
    pub fn touch(&mut self, id: PeerId, now: HostTime) {
        if let Some(view) = self.peers.get_mut(&id) {
            view.last_seen = now;
        }
    }

    pub fn remove(&mut self, id: PeerId) -> Option<PeerSessionView> {
        self.peers.remove(&id)
    }

    pub fn get(&self, id: PeerId) -> Option<&PeerSessionView> {
        self.peers.get(&id)
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (PeerId, &PeerSessionView)> {
        self.peers.iter().map(|(id, view)| (*id, view))
    }

    /// Drop peers not heard from within `ttl_nanos`; returns the removed ids
    pub fn prune(&mut self, now: HostTime, ttl_nanos: i64) -> Vec<PeerId> {
        let expired: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, view)| now.since(view.last_seen) > ttl_nanos)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.peers.remove(id);
        }
        expired
    }

    /// Peers currently in `session`
    pub fn in_session(&self, session: SessionId) -> impl Iterator<Item = (PeerId, &PeerSessionView)> {
        self.iter().filter(move |(_, view)| view.session == session)
    }

    pub fn count_in_session(&self, session: SessionId) -> usize {
        self.in_session(session).count()
    }

    /// Precedence key of a foreign session as seen through its members
    ///
    /// The member count is the largest count any of its peers reported, and
    /// never less than the number of its peers visible here.
    pub fn session_key(&self, session: SessionId) -> Option<SessionKey> {
        let mut visible = 0;
        let mut reported = 0;
        for (_, view) in self.in_session(session) {
            visible += 1;
            reported = reported.max(view.members);
        }
        (visible > 0).then(|| SessionKey::new(reported.max(visible), session))
    }

    /// Most recent timeline of `session` among its visible members
    pub fn best_timeline(&self, session: SessionId) -> Option<(SessionTimeline, Stamp)> {
        self.in_session(session)
            .map(|(_, view)| (view.timeline, view.stamp))
            .reduce(|best, next| if next.1.supersedes(&best.1) { next } else { best })
    }

    /// Largest Lamport sequence seen from any peer
    pub fn max_seq(&self) -> u64 {
        self.peers.values().map(|view| view.stamp.seq).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GhostTime;

    fn view(session: u64, members: usize, seq: u64, last_seen: i64) -> PeerSessionView {
        PeerSessionView {
            session: SessionId(PeerId(session)),
            members,
            timeline: SessionTimeline {
                tempo: 100.0 + seq as f64,
                beat_origin: 0.0,
                time_origin: GhostTime(0),
            },
            stamp: Stamp::new(seq, PeerId(session)),
            start_stop: None,
            last_seen: HostTime(last_seen),
        }
    }

    #[test]
    fn test_prune_expires_silent_peers() {
        let mut table = PeerTable::new();
        table.upsert(PeerId(1), view(1, 1, 0, 0));
        table.upsert(PeerId(2), view(2, 1, 0, 4_000));
        let removed = table.prune(HostTime(6_000), 5_000);
        assert_eq!(removed, vec![PeerId(1)]);
        assert!(table.contains(PeerId(2)));
        table.touch(PeerId(2), HostTime(20_000));
        assert!(table.prune(HostTime(24_000), 5_000).is_empty());
    }

    #[test]
    fn test_session_key_uses_largest_report() {
        let mut table = PeerTable::new();
        table.upsert(PeerId(10), view(5, 3, 0, 0));
        table.upsert(PeerId(11), view(5, 2, 0, 0));
        table.upsert(PeerId(12), view(6, 1, 0, 0));
        let key = table.session_key(SessionId(PeerId(5))).unwrap();
        assert_eq!(key.members(), 3);
        assert!(table.session_key(SessionId(PeerId(99))).is_none());
        assert_eq!(table.count_in_session(SessionId(PeerId(5))), 2);
    }

    #[test]
    fn test_best_timeline_has_greatest_stamp() {
        let mut table = PeerTable::new();
        table.upsert(PeerId(10), view(5, 1, 3, 0));
        table.upsert(PeerId(11), view(5, 1, 8, 0));
        table.upsert(PeerId(12), view(6, 1, 20, 0));
        let (timeline, stamp) = table.best_timeline(SessionId(PeerId(5))).unwrap();
        assert_eq!(stamp.seq, 8);
        assert_eq!(timeline.tempo, 108.0);
        assert_eq!(table.max_seq(), 20);
    }
}
