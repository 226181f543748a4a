//! Session merge engine
//!
//! Folds local commits and peer messages into one session-wide timeline and
//! start/stop state. The engine is single-threaded and clock-free: every call
//! takes `now` explicitly, and outbound messages are queued in an outbox that
//! the controller thread drains and hands to the transport.
//!
//! ## Rules
//!
//! - Inside a session, the timeline with the greatest [`Stamp`] wins and is
//!   adopted through [`adopt_timeline`], so the local beat magnitude never
//!   jumps.
//! - Start/stop states merge by [`SessionStartStop::key`] precedence.
//! - When two sessions meet, the one with the greater [`SessionKey`] wins.
//!   Members of the losing session measure their clock against the winner and
//!   then move over.

mod membership;
mod peers;

pub use membership::{SessionKey, Stamp};
pub use peers::{PeerSessionView, PeerTable};

use crate::ghost::{ClockEstimator, ClockSample, EstimatorConfig, GhostXForm};
use crate::resolver::adopt_timeline;
use crate::session_state::{Changes, SessionState};
use crate::start_stop::{merge_start_stop, SessionStartStop, StartStopMerge, StartStopState};
use crate::timeline::{phase_offset, Timeline};
use crate::types::{HostTime, PeerId, SessionId, NANOS_PER_MILLI};
use crate::wire::PeerMessage;

/// Phase difference (in beats) below which two grids count as the same
const GRID_TOLERANCE: f64 = 1e-6;

/// Tuning for the merge engine
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineConfig {
    /// Quantum whose phase is shared across the session
    pub quantum: f64,
    pub broadcast_interval_nanos: i64,
    pub peer_ttl_nanos: i64,
    /// Ping period while measuring a session to join
    pub ping_interval_nanos: i64,
    /// Ping period for drift tracking against the founder
    pub drift_interval_nanos: i64,
    /// Give up a join measurement after this long
    pub measurement_timeout_nanos: i64,
    pub estimator: EstimatorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            quantum: 4.0,
            broadcast_interval_nanos: 250 * NANOS_PER_MILLI,
            peer_ttl_nanos: 5_000 * NANOS_PER_MILLI,
            ping_interval_nanos: 50 * NANOS_PER_MILLI,
            drift_interval_nanos: 1_000 * NANOS_PER_MILLI,
            measurement_timeout_nanos: 3_000 * NANOS_PER_MILLI,
            estimator: EstimatorConfig::default(),
        }
    }
}

/// Clock measurement against a session this peer is about to join
#[derive(Debug)]
struct Measurement {
    session: SessionId,
    target: PeerId,
    estimator: ClockEstimator,
    started: HostTime,
    next_ping: HostTime,
}

/// The local belief about the session, and the rules that update it
#[derive(Debug)]
pub struct SessionEngine {
    id: PeerId,
    config: EngineConfig,
    session: SessionId,
    xform: GhostXForm,
    /// Host-axis timeline; its beat magnitude is local to this peer
    timeline: Timeline,
    stamp: Stamp,
    max_seq: u64,
    /// `None` until someone has expressed a start/stop intent
    start_stop: Option<SessionStartStop>,
    peers: PeerTable,
    participating: bool,
    start_stop_sync: bool,
    measurement: Option<Measurement>,
    drift: ClockEstimator,
    next_drift_ping: HostTime,
    next_broadcast: HostTime,
    broadcast_pending: bool,
    outbox: Vec<PeerMessage>,
}

impl SessionEngine {
    /// A solo session founded by `id`
    pub fn new(id: PeerId, timeline: Timeline, config: EngineConfig) -> Self {
        Self {
            id,
            config,
            session: SessionId(id),
            xform: GhostXForm::IDENTITY,
            timeline,
            stamp: Stamp::new(0, id),
            max_seq: 0,
            start_stop: None,
            peers: PeerTable::new(),
            participating: false,
            start_stop_sync: false,
            measurement: None,
            drift: ClockEstimator::new(config.estimator),
            next_drift_ping: HostTime::default(),
            next_broadcast: HostTime::default(),
            broadcast_pending: false,
            outbox: Vec::new(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn xform(&self) -> GhostXForm {
        self.xform
    }

    pub fn timeline(&self) -> Timeline {
        self.timeline
    }

    pub fn stamp(&self) -> Stamp {
        self.stamp
    }

    /// Tempo of the session, identical on every member
    pub fn session_tempo(&self) -> f64 {
        self.timeline.tempo
    }

    /// Start/stop state on the host axis
    pub fn start_stop(&self) -> StartStopState {
        self.start_stop
            .map(|ss| self.xform.start_stop_to_host(&ss))
            .unwrap_or_default()
    }

    /// Live peers in this peer's session
    pub fn num_peers(&self) -> usize {
        self.peers.count_in_session(self.session)
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn is_participating(&self) -> bool {
        self.participating
    }

    pub fn is_start_stop_sync_enabled(&self) -> bool {
        self.start_stop_sync
    }

    /// Whether a clock measurement for a session join is in progress
    pub fn is_joining(&self) -> bool {
        self.measurement.is_some()
    }

    fn member_count(&self) -> usize {
        1 + self.num_peers()
    }

    fn session_key(&self) -> SessionKey {
        SessionKey::new(self.member_count(), self.session)
    }

    /// Current state as a caller-facing snapshot
    pub fn capture(&self) -> SessionState {
        SessionState::new(self.timeline, self.start_stop(), self.num_peers())
    }

    /// Messages queued since the last drain
    pub fn drain_outbox(&mut self) -> Vec<PeerMessage> {
        std::mem::take(&mut self.outbox)
    }

    // ─────────────────────────────────────────────────────────────
    // Local changes
    // ─────────────────────────────────────────────────────────────

    /// Apply the modified parts of a locally committed snapshot
    pub fn commit_local(&mut self, state: &SessionState, now: HostTime) {
        let changes = state.changes();

        if changes.contains(Changes::TIMELINE) {
            let next = *state.timeline();
            if changes.contains(Changes::FORCED) || self.changes_shared_grid(&next, now) {
                self.max_seq = self.max_seq.saturating_add(1).min(Stamp::MAX_SEQ);
                self.stamp = Stamp::new(self.max_seq, self.id);
                self.broadcast_pending = true;
                log::debug!(
                    "Local timeline change: {:.3} bpm, stamp {}",
                    next.tempo,
                    self.stamp.seq
                );
            }
            self.timeline = next;
        }

        if changes.contains(Changes::START_STOP) {
            let candidate = self.xform.start_stop_to_ghost(state.start_stop(), self.id);
            match self.merge_start_stop(candidate) {
                StartStopMerge::Adopted => {
                    if self.start_stop_sync {
                        self.broadcast_pending = true;
                    }
                }
                StartStopMerge::Stale => {
                    log::debug!(
                        "Dropping stale start/stop commit (playing={} at {:?})",
                        candidate.is_playing,
                        candidate.time
                    );
                }
                StartStopMerge::Unchanged => {}
            }
        }
    }

    /// Whether `next` differs from the current grid in tempo or shared phase
    fn changes_shared_grid(&self, next: &Timeline, now: HostTime) -> bool {
        if next.tempo != self.timeline.tempo {
            return true;
        }
        let offset = phase_offset(next.to_beats(now), self.timeline.to_beats(now), self.config.quantum);
        offset.abs() > GRID_TOLERANCE
    }

    fn merge_start_stop(&mut self, incoming: SessionStartStop) -> StartStopMerge {
        match self.start_stop.as_mut() {
            Some(current) => merge_start_stop(current, incoming),
            None => {
                self.start_stop = Some(incoming);
                StartStopMerge::Adopted
            }
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Participation and settings
    // ─────────────────────────────────────────────────────────────

    /// Start or stop taking part in sessions
    ///
    /// Leaving sends `Bye`, forgets every peer and founds a fresh solo
    /// session that keeps the current timeline and start/stop state.
    pub fn set_participating(&mut self, participating: bool, now: HostTime) {
        if participating == self.participating {
            return;
        }
        self.participating = participating;
        if participating {
            log::info!("Peer {} joining the network", self.id);
            self.broadcast_pending = true;
            self.next_broadcast = now;
        } else {
            log::info!("Peer {} leaving {}", self.id, self.session);
            self.outbox.push(PeerMessage::Bye { peer: self.id });
            self.peers.clear();
            self.measurement = None;
            self.found_solo_session();
        }
    }

    pub fn set_start_stop_sync(&mut self, enabled: bool) {
        if enabled != self.start_stop_sync {
            log::info!("Start/stop sync {}", if enabled { "enabled" } else { "disabled" });
            self.start_stop_sync = enabled;
            self.broadcast_pending |= enabled;
        }
    }

    fn found_solo_session(&mut self) {
        if self.session == SessionId(self.id) {
            return;
        }
        self.rebase_start_stop(GhostXForm::IDENTITY);
        self.session = SessionId(self.id);
        self.xform = GhostXForm::IDENTITY;
        self.drift.clear();
    }

    /// Keep the host time of the local start/stop state across an axis change
    fn rebase_start_stop(&mut self, next: GhostXForm) {
        let current = self.xform;
        self.start_stop = self.start_stop.map(|ss| {
            let host = current.start_stop_to_host(&ss);
            next.start_stop_to_ghost(host, ss.author)
        });
    }

    // ─────────────────────────────────────────────────────────────
    // Inbound messages
    // ─────────────────────────────────────────────────────────────

    /// Fold one decoded peer message into the session
    pub fn handle_message(&mut self, message: PeerMessage, now: HostTime) {
        if !self.participating || message.sender() == self.id {
            return;
        }
        match message {
            PeerMessage::State {
                peer,
                session,
                members,
                timeline,
                stamp,
                start_stop,
            } => {
                if stamp.seq > Stamp::MAX_SEQ {
                    log::debug!("Dropping state from {} with stamp {}", peer, stamp.seq);
                    return;
                }
                let view = PeerSessionView {
                    session,
                    members: members as usize,
                    timeline,
                    stamp,
                    start_stop,
                    last_seen: now,
                };
                if self.peers.upsert(peer, view) {
                    log::info!("Discovered peer {} in {}", peer, session);
                }
                self.max_seq = self.max_seq.max(stamp.seq);
                if session == self.session {
                    self.merge_peer_state(&view, now);
                } else {
                    self.consider_session(session, peer, now);
                }
            }
            PeerMessage::Ping { from, to, host_send } => {
                self.peers.touch(from, now);
                if to == self.id {
                    self.outbox.push(PeerMessage::Pong {
                        from: self.id,
                        to: from,
                        host_send,
                        ghost_now: self.xform.host_to_ghost(now),
                        session: self.session,
                    });
                }
            }
            PeerMessage::Pong {
                from,
                to,
                host_send,
                ghost_now,
                session,
            } => {
                self.peers.touch(from, now);
                if to == self.id {
                    let sample = ClockSample {
                        host_send,
                        remote_ghost: ghost_now,
                        host_recv: now,
                    };
                    self.handle_clock_sample(from, session, sample, now);
                }
            }
            PeerMessage::Bye { peer } => {
                log::info!("Peer {} left", peer);
                self.forget_peer(peer);
            }
        }
    }

    /// A peer was reported unreachable by the transport
    pub fn peer_lost(&mut self, peer: PeerId) {
        if self.peers.contains(peer) {
            log::info!("Lost peer {}", peer);
            self.forget_peer(peer);
        }
    }

    fn forget_peer(&mut self, peer: PeerId) {
        self.peers.remove(peer);
        if self.measurement.as_ref().is_some_and(|m| m.target == peer) {
            self.measurement = None;
        }
    }

    fn merge_peer_state(&mut self, view: &PeerSessionView, now: HostTime) {
        if view.stamp.supersedes(&self.stamp) {
            let incoming = self.xform.timeline_to_host(&view.timeline);
            self.timeline = adopt_timeline(&self.timeline, &incoming, now, self.config.quantum);
            self.stamp = view.stamp;
            log::debug!("Adopted session timeline {:.3} bpm (stamp {})", view.timeline.tempo, view.stamp.seq);
        } else if self.stamp.supersedes(&view.stamp) {
            // The peer is behind; tell it sooner than the next period
            self.broadcast_pending = true;
        }

        if !self.start_stop_sync {
            return;
        }
        match view.start_stop {
            Some(incoming) => match self.merge_start_stop(incoming) {
                StartStopMerge::Adopted => {
                    log::debug!("Adopted start/stop from {} (playing={})", incoming.author, incoming.is_playing);
                }
                StartStopMerge::Stale => self.broadcast_pending = true,
                StartStopMerge::Unchanged => {}
            },
            // Sync is off on their side; our state reaches them with the next period
            None => {}
        }
    }

    /// Begin joining `session` if it outranks ours
    fn consider_session(&mut self, session: SessionId, speaker: PeerId, now: HostTime) {
        let Some(theirs) = self.peers.session_key(session) else {
            return;
        };
        if theirs <= self.session_key() {
            return;
        }
        if let Some(m) = &self.measurement {
            let current = self.peers.session_key(m.session);
            if m.session == session || current.is_some_and(|k| k >= theirs) {
                return;
            }
        }

        // Measure against the founder when it is visible, otherwise whoever spoke
        let founder = session.founder();
        let target = match self.peers.get(founder) {
            Some(view) if view.session == session => founder,
            _ => speaker,
        };
        log::info!(
            "Found {} with {} members; measuring clock against {}",
            session,
            theirs.members(),
            target
        );
        self.measurement = Some(Measurement {
            session,
            target,
            estimator: ClockEstimator::new(self.config.estimator),
            started: now,
            next_ping: now,
        });
    }

    fn handle_clock_sample(&mut self, from: PeerId, session: SessionId, sample: ClockSample, now: HostTime) {
        if let Some(m) = self.measurement.as_mut() {
            if m.target == from && m.session == session {
                m.estimator.add_sample(sample);
                if let Some(xform) = m.estimator.estimate() {
                    self.join_session(session, xform, now);
                }
                return;
            }
        }

        if session == self.session && from == self.session.founder() {
            self.drift.add_sample(sample);
            if let Some(xform) = self.drift.estimate() {
                self.refresh_xform(xform);
            }
        }
    }

    /// Move to `session`, whose ghost axis is reached through `xform`
    fn join_session(&mut self, session: SessionId, xform: GhostXForm, now: HostTime) {
        self.measurement = None;
        if let Some(theirs) = self.peers.session_key(session) {
            if theirs <= self.session_key() {
                log::debug!("{} no longer outranks {}, staying", session, self.session);
                return;
            }
        }

        self.rebase_start_stop(xform);
        self.session = session;
        self.xform = xform;
        self.drift.clear();

        if let Some((timeline, stamp)) = self.peers.best_timeline(session) {
            let incoming = xform.timeline_to_host(&timeline);
            self.timeline = adopt_timeline(&self.timeline, &incoming, now, self.config.quantum);
            self.stamp = stamp;
        }
        if self.start_stop_sync {
            let states: Vec<SessionStartStop> = self
                .peers
                .in_session(session)
                .filter_map(|(_, view)| view.start_stop)
                .collect();
            for state in states {
                self.merge_start_stop(state);
            }
        }

        self.broadcast_pending = true;
        log::info!(
            "Joined {} at {:.3} bpm ({} members)",
            session,
            self.session_tempo(),
            self.member_count()
        );
    }

    /// Replace the drift estimate, keeping the session-axis timeline fixed
    fn refresh_xform(&mut self, xform: GhostXForm) {
        let ghost = self.xform.timeline_to_ghost(&self.timeline);
        self.xform = xform;
        self.timeline = xform.timeline_to_host(&ghost);
    }

    // ─────────────────────────────────────────────────────────────
    // Timers
    // ─────────────────────────────────────────────────────────────

    /// Expire peers, send pings and queue broadcasts that are due
    pub fn tick(&mut self, now: HostTime) {
        if !self.participating {
            return;
        }

        for peer in self.peers.prune(now, self.config.peer_ttl_nanos) {
            log::info!("Peer {} timed out", peer);
            if self.measurement.as_ref().is_some_and(|m| m.target == peer) {
                self.measurement = None;
            }
        }

        self.tick_measurement(now);
        self.tick_drift(now);

        if self.broadcast_pending || now >= self.next_broadcast {
            self.outbox.push(self.state_message());
            self.broadcast_pending = false;
            self.next_broadcast = now.offset(self.config.broadcast_interval_nanos);
        }
    }

    fn tick_measurement(&mut self, now: HostTime) {
        let Some(m) = self.measurement.as_mut() else {
            return;
        };
        if now.since(m.started) > self.config.measurement_timeout_nanos {
            log::warn!("Clock measurement against {} timed out", m.target);
            self.measurement = None;
        } else if now >= m.next_ping {
            self.outbox.push(PeerMessage::Ping {
                from: self.id,
                to: m.target,
                host_send: now,
            });
            m.next_ping = now.offset(self.config.ping_interval_nanos);
        }
    }

    fn tick_drift(&mut self, now: HostTime) {
        let founder = self.session.founder();
        if founder == self.id || now < self.next_drift_ping {
            return;
        }
        if self.peers.get(founder).is_some_and(|v| v.session == self.session) {
            self.outbox.push(PeerMessage::Ping {
                from: self.id,
                to: founder,
                host_send: now,
            });
            self.next_drift_ping = now.offset(self.config.drift_interval_nanos);
        }
    }

    fn state_message(&self) -> PeerMessage {
        PeerMessage::State {
            peer: self.id,
            session: self.session,
            members: u32::try_from(self.member_count()).unwrap_or(u32::MAX),
            timeline: self.xform.timeline_to_ghost(&self.timeline),
            stamp: self.stamp,
            start_stop: if self.start_stop_sync { self.start_stop } else { None },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ghost::SessionTimeline;
    use crate::timeline::phase;
    use crate::types::GhostTime;

    const STEP: i64 = 10 * NANOS_PER_MILLI;

    fn engine(id: u64, tempo: f64) -> SessionEngine {
        let timeline = Timeline::new(tempo, 0.0, HostTime(0)).unwrap();
        let mut e = SessionEngine::new(PeerId(id), timeline, EngineConfig::default());
        e.set_start_stop_sync(true);
        e.set_participating(true, HostTime(0));
        e
    }

    /// Lossless broadcast network of engines with skewed host clocks
    struct Sim {
        /// Engine, clock offset in nanoseconds, clock rate error in ppm
        nodes: Vec<(SessionEngine, i64, f64)>,
        global: i64,
    }

    impl Sim {
        fn new() -> Self {
            Self {
                nodes: Vec::new(),
                global: 1_000_000_000,
            }
        }

        fn add(&mut self, engine: SessionEngine, clock_offset: i64) -> usize {
            self.add_drifting(engine, clock_offset, 0.0)
        }

        fn add_drifting(&mut self, engine: SessionEngine, clock_offset: i64, ppm: f64) -> usize {
            self.nodes.push((engine, clock_offset, ppm));
            self.nodes.len() - 1
        }

        fn now(&self, node: usize) -> HostTime {
            let (_, offset, ppm) = self.nodes[node];
            let skew = (self.global as f64 * ppm * 1e-6).round() as i64;
            HostTime(self.global + offset + skew)
        }

        fn engine(&mut self, node: usize) -> &mut SessionEngine {
            &mut self.nodes[node].0
        }

        fn step(&mut self) {
            self.global += STEP;
            for i in 0..self.nodes.len() {
                let now = self.now(i);
                self.nodes[i].0.tick(now);
            }
            self.deliver();
        }

        fn deliver(&mut self) {
            for _ in 0..8 {
                let mut in_flight = Vec::new();
                for (i, (e, _, _)) in self.nodes.iter_mut().enumerate() {
                    in_flight.extend(e.drain_outbox().into_iter().map(|m| (i, m)));
                }
                if in_flight.is_empty() {
                    return;
                }
                for (from, message) in in_flight {
                    for to in 0..self.nodes.len() {
                        if to != from {
                            let now = self.now(to);
                            self.nodes[to].0.handle_message(message, now);
                        }
                    }
                }
            }
        }

        fn run_for(&mut self, millis: i64) {
            for _ in 0..(millis * NANOS_PER_MILLI / STEP) {
                self.step();
            }
        }

        /// Beat of `node` at the current global instant
        fn beat(&self, node: usize) -> f64 {
            self.nodes[node].0.timeline().to_beats(self.now(node))
        }
    }

    fn assert_same_phase(a: f64, b: f64) {
        let offset = phase_offset(a, b, 4.0).abs();
        assert!(offset < 1e-6, "phases differ: {a} vs {b}");
    }

    #[test]
    fn test_equal_sessions_converge_on_lower_id() {
        let mut sim = Sim::new();
        let a = sim.add(engine(0x10, 100.0), 0);
        let b = sim.add(engine(0x20, 128.0), 777_777);
        sim.run_for(2_000);

        assert_eq!(sim.engine(a).session(), SessionId(PeerId(0x10)));
        assert_eq!(sim.engine(b).session(), SessionId(PeerId(0x10)));
        let tempo_a = sim.engine(a).session_tempo();
        let tempo_b = sim.engine(b).session_tempo();
        assert!((tempo_a - 100.0).abs() < 1e-9);
        assert!((tempo_b - tempo_a).abs() < 1e-9);
        assert_eq!(sim.engine(a).num_peers(), 1);
        assert_eq!(sim.engine(b).num_peers(), 1);
        assert_same_phase(sim.beat(a), sim.beat(b));
    }

    #[test]
    fn test_joined_clock_offset_is_measured() {
        let mut sim = Sim::new();
        let _a = sim.add(engine(0x10, 120.0), 0);
        let b = sim.add(engine(0x20, 120.0), -3_000_000);
        sim.run_for(1_000);
        let xform = sim.engine(b).xform();
        let now = sim.now(b);
        assert_eq!(xform.host_to_ghost(now), GhostTime(sim.global));
    }

    #[test]
    fn test_larger_session_wins_over_lower_id() {
        let mut sim = Sim::new();
        let b = sim.add(engine(0x50, 120.0), 0);
        let c = sim.add(engine(0x60, 140.0), 12_345);
        sim.run_for(1_000);
        assert_eq!(sim.engine(c).session(), SessionId(PeerId(0x50)));

        let a = sim.add(engine(0x01, 90.0), -55_555);
        sim.run_for(2_000);
        for node in [a, b, c] {
            assert_eq!(sim.engine(node).session(), SessionId(PeerId(0x50)));
            assert!((sim.engine(node).session_tempo() - 120.0).abs() < 1e-9);
            assert_eq!(sim.engine(node).num_peers(), 2);
        }
        assert_same_phase(sim.beat(a), sim.beat(b));
        assert_same_phase(sim.beat(b), sim.beat(c));
    }

    #[test]
    fn test_tempo_change_propagates() {
        let mut sim = Sim::new();
        let a = sim.add(engine(0x10, 120.0), 0);
        let b = sim.add(engine(0x20, 120.0), 40_000);
        sim.run_for(1_000);

        let now = sim.now(b);
        let mut state = sim.engine(b).capture();
        state.set_tempo(140.0, now).unwrap();
        sim.engine(b).commit_local(&state, now);
        sim.run_for(500);

        assert!((sim.engine(a).session_tempo() - 140.0).abs() < 1e-9);
        assert_eq!(sim.engine(a).stamp(), sim.engine(b).stamp());
        assert_same_phase(sim.beat(a), sim.beat(b));
    }

    #[test]
    fn test_start_stop_converges() {
        let mut sim = Sim::new();
        let a = sim.add(engine(0x10, 120.0), 0);
        let b = sim.add(engine(0x20, 120.0), 9_999);
        sim.run_for(1_000);

        let now = sim.now(a);
        let mut state = sim.engine(a).capture();
        state.set_is_playing(true, now);
        sim.engine(a).commit_local(&state, now);
        sim.run_for(100);
        assert!(sim.engine(b).start_stop().is_playing);
        // Same instant, expressed on each host clock
        assert_eq!(sim.engine(b).start_stop().time, now.offset(9_999));
    }

    #[test]
    fn test_stale_peer_start_stop_is_ignored() {
        let mut e = engine(0x10, 120.0);
        let mut state = e.capture();
        state.set_is_playing(true, HostTime(1000));
        e.commit_local(&state, HostTime(1000));

        let timeline = e.xform().timeline_to_ghost(&e.timeline());
        let from_peer = |is_playing: bool, time: i64| PeerMessage::State {
            peer: PeerId(0x20),
            session: SessionId(PeerId(0x10)),
            members: 2,
            timeline,
            stamp: Stamp::new(0, PeerId(0x10)),
            start_stop: Some(SessionStartStop {
                is_playing,
                time: GhostTime(time),
                author: PeerId(0x20),
            }),
        };

        e.handle_message(from_peer(false, 900), HostTime(1100));
        assert!(e.start_stop().is_playing);
        assert_eq!(e.start_stop().time, HostTime(1000));

        e.handle_message(from_peer(false, 1200), HostTime(1300));
        assert!(!e.start_stop().is_playing);
    }

    #[test]
    fn test_stale_local_start_stop_is_dropped() {
        let mut e = engine(0x10, 120.0);
        let mut state = e.capture();
        state.set_is_playing(true, HostTime(5000));
        e.commit_local(&state, HostTime(5000));

        let mut late = e.capture();
        late.set_is_playing(false, HostTime(4000));
        e.commit_local(&late, HostTime(5100));
        assert!(e.start_stop().is_playing);
    }

    #[test]
    fn test_start_stop_ignored_when_sync_disabled() {
        let mut e = engine(0x10, 120.0);
        e.set_start_stop_sync(false);
        let timeline = e.xform().timeline_to_ghost(&e.timeline());
        e.handle_message(
            PeerMessage::State {
                peer: PeerId(0x20),
                session: SessionId(PeerId(0x10)),
                members: 2,
                timeline,
                stamp: Stamp::new(0, PeerId(0x10)),
                start_stop: Some(SessionStartStop {
                    is_playing: true,
                    time: GhostTime(10),
                    author: PeerId(0x20),
                }),
            },
            HostTime(20),
        );
        assert!(!e.start_stop().is_playing);

        e.tick(HostTime(30));
        let sent = e.drain_outbox();
        assert!(sent
            .iter()
            .all(|m| matches!(m, PeerMessage::State { start_stop: None, .. })));
    }

    #[test]
    fn test_untouched_capture_keeps_merged_timeline() {
        let mut e = engine(0x10, 120.0);
        let stale = e.capture();

        let incoming = SessionTimeline {
            tempo: 95.0,
            beat_origin: 0.0,
            time_origin: GhostTime(0),
        };
        e.handle_message(
            PeerMessage::State {
                peer: PeerId(0x20),
                session: SessionId(PeerId(0x10)),
                members: 2,
                timeline: incoming,
                stamp: Stamp::new(3, PeerId(0x20)),
                start_stop: None,
            },
            HostTime(500),
        );
        assert_eq!(e.timeline().tempo, 95.0);

        e.commit_local(&stale, HostTime(600));
        assert_eq!(e.timeline().tempo, 95.0);
    }

    #[test]
    fn test_magnitude_only_commit_keeps_stamp() {
        let mut e = engine(0x10, 120.0);
        let before = e.stamp();
        let mut state = e.capture();
        // Same phase mod 4, different magnitude
        let mut shifted = *state.timeline();
        shifted.beat_origin += 8.0;
        state = SessionState::new(shifted, state.start_stop(), 1).with_changes(Changes::TIMELINE);
        e.commit_local(&state, HostTime(0));
        assert_eq!(e.stamp(), before);
        assert_eq!(e.timeline().beat_origin, 8.0);

        let mut forced = e.capture();
        forced.force_beat_at_time(8.0, HostTime(0), 4.0).unwrap();
        e.commit_local(&forced, HostTime(0));
        assert!(e.stamp().supersedes(&before));
    }

    #[test]
    fn test_phase_change_bumps_stamp() {
        let mut e = engine(0x10, 120.0);
        let before = e.stamp();
        let mut state = e.capture().with_num_peers(1);
        // Quantized to single beats, which moves the bar phase
        state.request_beat_at_time(3.0, HostTime(0), 1.0).unwrap();
        e.commit_local(&state, HostTime(0));
        assert!(e.stamp().supersedes(&before));
        assert_eq!(phase(e.timeline().to_beats(HostTime(0)), 4.0), 3.0);
    }

    #[test]
    fn test_leaving_sends_bye_and_refounds() {
        let mut sim = Sim::new();
        let a = sim.add(engine(0x10, 120.0), 0);
        let b = sim.add(engine(0x20, 120.0), 0);
        sim.run_for(1_000);
        assert_eq!(sim.engine(b).session(), SessionId(PeerId(0x10)));

        let now = sim.now(b);
        sim.engine(b).set_participating(false, now);
        assert_eq!(sim.engine(b).session(), SessionId(PeerId(0x20)));
        assert_eq!(sim.engine(b).num_peers(), 0);
        sim.deliver();
        assert_eq!(sim.engine(a).num_peers(), 0);
        assert!(sim.engine(b).peers().is_empty());
    }

    #[test]
    fn test_silent_peer_expires() {
        let mut sim = Sim::new();
        let a = sim.add(engine(0x10, 120.0), 0);
        let _b = sim.add(engine(0x20, 120.0), 0);
        sim.run_for(1_000);
        assert_eq!(sim.engine(a).num_peers(), 1);

        // Stop delivering: only `a` keeps ticking
        for _ in 0..600 {
            sim.global += STEP;
            let now = sim.now(a);
            sim.engine(a).tick(now);
            sim.engine(a).drain_outbox();
        }
        assert_eq!(sim.engine(a).num_peers(), 0);
    }

    #[test]
    fn test_messages_ignored_when_not_participating() {
        let timeline = Timeline::new(120.0, 0.0, HostTime(0)).unwrap();
        let mut e = SessionEngine::new(PeerId(1), timeline, EngineConfig::default());
        let ping = PeerMessage::Ping {
            from: PeerId(2),
            to: PeerId(1),
            host_send: HostTime(0),
        };
        e.handle_message(ping, HostTime(1));
        e.tick(HostTime(2));
        assert!(e.drain_outbox().is_empty());
    }

    #[test]
    fn test_drifting_clock_keeps_phase_and_tempo() {
        const PPM: f64 = 400.0;
        let mut sim = Sim::new();
        let a = sim.add(engine(0x10, 120.0), 0);
        let b = sim.add_drifting(engine(0x20, 120.0), 250_000, PPM);
        sim.run_for(8_000);

        // Founder time advances 1 / (1 + drift) ns per host ns of `b`
        let slope = sim.engine(b).xform().slope;
        assert!((slope - 1.0 / (1.0 + PPM * 1e-6)).abs() < 1e-6, "slope {slope}");
        assert_eq!(sim.engine(b).capture().tempo(), 120.0);
        assert_eq!(sim.engine(b).session_tempo(), sim.engine(a).session_tempo());

        // Uncorrected, 7s at 400ppm would put `b` ~0.0056 beats ahead
        let offset = phase_offset(sim.beat(b), sim.beat(a), 4.0).abs();
        assert!(offset < 1.5e-3, "phase offset {offset}");

        let now = sim.now(b);
        let mut state = sim.engine(b).capture();
        state.set_tempo(131.0, now).unwrap();
        sim.engine(b).commit_local(&state, now);
        sim.run_for(300);
        assert_eq!(sim.engine(a).session_tempo(), 131.0);
        assert_eq!(sim.engine(b).capture().tempo(), 131.0);
    }

    #[test]
    fn test_drift_refresh_keeps_stamp() {
        let mut sim = Sim::new();
        let _a = sim.add(engine(0x10, 120.0), 0);
        let b = sim.add_drifting(engine(0x20, 120.0), 0, -300.0);
        sim.run_for(2_000);
        let stamp = sim.engine(b).stamp();
        assert_eq!(sim.engine(b).xform().slope, 1.0);

        sim.run_for(6_000);
        assert!(sim.engine(b).xform().slope > 1.0);
        assert_eq!(sim.engine(b).stamp(), stamp);
        assert_eq!(sim.engine(b).session(), SessionId(PeerId(0x10)));
    }

    #[test]
    fn test_lost_peer_is_forgotten() {
        let mut sim = Sim::new();
        let a = sim.add(engine(0x10, 120.0), 0);
        let _b = sim.add(engine(0x20, 120.0), 0);
        sim.run_for(1_000);
        assert_eq!(sim.engine(a).num_peers(), 1);

        sim.engine(a).peer_lost(PeerId(0x20));
        assert_eq!(sim.engine(a).num_peers(), 0);
        assert!(sim.engine(a).peers().is_empty());

        // Unknown peers are ignored
        sim.engine(a).peer_lost(PeerId(0x99));
        assert!(sim.engine(a).peers().is_empty());

        // The next broadcast from `b` brings it back
        sim.run_for(500);
        assert_eq!(sim.engine(a).num_peers(), 1);
    }

    #[test]
    fn test_lost_peer_cancels_join() {
        let mut sim = Sim::new();
        let _a = sim.add(engine(0x10, 120.0), 0);
        let b = sim.add(engine(0x20, 120.0), 0);
        sim.step();
        assert!(sim.engine(b).is_joining());

        sim.engine(b).peer_lost(PeerId(0x10));
        assert!(!sim.engine(b).is_joining());
        assert_eq!(sim.engine(b).session(), SessionId(PeerId(0x20)));
    }

    #[test]
    fn test_runaway_stamp_is_dropped() {
        let mut e = engine(0x10, 120.0);
        let timeline = SessionTimeline {
            tempo: 60.0,
            beat_origin: 0.0,
            time_origin: GhostTime(0),
        };
        e.handle_message(
            PeerMessage::State {
                peer: PeerId(0x20),
                session: SessionId(PeerId(0x10)),
                members: 2,
                timeline,
                stamp: Stamp::new(u64::MAX, PeerId(0x20)),
                start_stop: None,
            },
            HostTime(100),
        );
        assert_eq!(e.timeline().tempo, 120.0);
        assert!(e.peers().is_empty());

        let mut state = e.capture();
        state.set_tempo(90.0, HostTime(200)).unwrap();
        e.commit_local(&state, HostTime(200));
        assert_eq!(e.stamp().seq, 1);
    }

    #[test]
    fn test_stamp_sequence_saturates() {
        let mut e = engine(0x10, 120.0);
        let timeline = SessionTimeline {
            tempo: 60.0,
            beat_origin: 0.0,
            time_origin: GhostTime(0),
        };
        e.handle_message(
            PeerMessage::State {
                peer: PeerId(0x20),
                session: SessionId(PeerId(0x10)),
                members: 2,
                timeline,
                stamp: Stamp::new(Stamp::MAX_SEQ, PeerId(0x20)),
                start_stop: None,
            },
            HostTime(100),
        );
        assert_eq!(e.timeline().tempo, 60.0);

        let mut state = e.capture();
        state.set_tempo(90.0, HostTime(200)).unwrap();
        e.commit_local(&state, HostTime(200));
        assert_eq!(e.stamp().seq, Stamp::MAX_SEQ);
        assert_eq!(e.timeline().tempo, 90.0);
    }

    #[test]
    fn test_peer_without_sync_does_not_trigger_broadcast() {
        let mut e = engine(0x10, 120.0);
        let mut state = e.capture();
        state.set_is_playing(true, HostTime(10));
        e.commit_local(&state, HostTime(10));
        e.tick(HostTime(20));
        e.drain_outbox();

        let timeline = e.xform().timeline_to_ghost(&e.timeline());
        let stamp = e.stamp();
        for at in [30, 40, 50] {
            e.handle_message(
                PeerMessage::State {
                    peer: PeerId(0x20),
                    session: SessionId(PeerId(0x10)),
                    members: 2,
                    timeline,
                    stamp,
                    start_stop: None,
                },
                HostTime(at),
            );
            e.tick(HostTime(at));
        }
        assert!(e.drain_outbox().is_empty());
        assert!(e.start_stop().is_playing);
    }
}
