//! Session events and the callbacks they are delivered to
//!
//! The controller and control path never call user code. They compare each
//! published state with the last one reported and push the differences into
//! a `flume` channel; `Link::poll_events` drains it on the caller's thread
//! and runs the registered callbacks there.

use flume::{Receiver, Sender};

/// Relative tempo difference treated as no change
const TEMPO_EPSILON: f64 = 1e-9;

/// Something observable about the session changed
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionEvent {
    /// Session tempo in beats per minute
    TempoChanged(f64),
    NumPeersChanged(usize),
    /// At least one peer shares the session
    ConnectedChanged(bool),
    StartStopChanged(bool),
    /// User setting allowing network participation
    EnabledChanged(bool),
    StartStopSyncEnabledChanged(bool),
}

/// Observable values as last reported
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Observed {
    pub tempo: f64,
    pub num_peers: usize,
    pub is_playing: bool,
}

/// Emits events for differences between successive observations
pub(crate) struct EventTracker {
    last: Observed,
    tx: Sender<SessionEvent>,
}

impl EventTracker {
    pub fn new(initial: Observed, tx: Sender<SessionEvent>) -> Self {
        Self { last: initial, tx }
    }

    pub fn observe(&mut self, now: Observed) {
        let last = self.last;
        if (now.tempo - last.tempo).abs() > TEMPO_EPSILON * last.tempo.max(1.0) {
            self.emit(SessionEvent::TempoChanged(now.tempo));
        }
        if now.num_peers != last.num_peers {
            self.emit(SessionEvent::NumPeersChanged(now.num_peers));
            if (now.num_peers > 0) != (last.num_peers > 0) {
                self.emit(SessionEvent::ConnectedChanged(now.num_peers > 0));
            }
        }
        if now.is_playing != last.is_playing {
            self.emit(SessionEvent::StartStopChanged(now.is_playing));
        }
        self.last = now;
    }

    pub fn emit(&self, event: SessionEvent) {
        // The receiver lives as long as the Link; a send error means shutdown
        let _ = self.tx.send(event);
    }
}

type Callback<T> = Box<dyn FnMut(T) + Send>;

/// Registered observers, one list per event kind
#[derive(Default)]
pub(crate) struct Callbacks {
    tempo: Vec<Callback<f64>>,
    num_peers: Vec<Callback<usize>>,
    connected: Vec<Callback<bool>>,
    start_stop: Vec<Callback<bool>>,
    enabled: Vec<Callback<bool>>,
    start_stop_sync_enabled: Vec<Callback<bool>>,
}

impl Callbacks {
    pub fn on_tempo(&mut self, f: Callback<f64>) {
        self.tempo.push(f);
    }

    pub fn on_num_peers(&mut self, f: Callback<usize>) {
        self.num_peers.push(f);
    }

    pub fn on_connected(&mut self, f: Callback<bool>) {
        self.connected.push(f);
    }

    pub fn on_start_stop(&mut self, f: Callback<bool>) {
        self.start_stop.push(f);
    }

    pub fn on_enabled(&mut self, f: Callback<bool>) {
        self.enabled.push(f);
    }

    pub fn on_start_stop_sync_enabled(&mut self, f: Callback<bool>) {
        self.start_stop_sync_enabled.push(f);
    }

    /// Move every callback of `other` to the end of the matching list
    pub fn append(&mut self, mut other: Callbacks) {
        self.tempo.append(&mut other.tempo);
        self.num_peers.append(&mut other.num_peers);
        self.connected.append(&mut other.connected);
        self.start_stop.append(&mut other.start_stop);
        self.enabled.append(&mut other.enabled);
        self.start_stop_sync_enabled.append(&mut other.start_stop_sync_enabled);
    }

    pub fn dispatch(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::TempoChanged(bpm) => self.tempo.iter_mut().for_each(|f| f(bpm)),
            SessionEvent::NumPeersChanged(n) => self.num_peers.iter_mut().for_each(|f| f(n)),
            SessionEvent::ConnectedChanged(c) => self.connected.iter_mut().for_each(|f| f(c)),
            SessionEvent::StartStopChanged(p) => self.start_stop.iter_mut().for_each(|f| f(p)),
            SessionEvent::EnabledChanged(e) => self.enabled.iter_mut().for_each(|f| f(e)),
            SessionEvent::StartStopSyncEnabledChanged(e) => {
                self.start_stop_sync_enabled.iter_mut().for_each(|f| f(e))
            }
        }
    }
}

/// Create the event channel
pub(crate) fn event_channel() -> (Sender<SessionEvent>, Receiver<SessionEvent>) {
    flume::unbounded()
}
