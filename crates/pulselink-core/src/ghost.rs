//! Clock domain adapter: host time <-> session ghost time
//!
//! Host clocks are not comparable across devices. Every session defines a
//! virtual "ghost" axis (the founder's host clock), and each member keeps a
//! [`GhostXForm`] from its own host clock onto that axis. Timelines and
//! start/stop states are exchanged on the ghost axis only.
//!
//! The transform is estimated from round-trip measurements: a peer sends a
//! ping stamped with its host time, the responder answers with its current
//! ghost time, and the midpoint of the round trip is paired with that ghost
//! time. The offset is the median over a window of samples; the drift (slope)
//! is a least-squares fit once the window spans long enough.

use crate::start_stop::{SessionStartStop, StartStopState};
use crate::timeline::Timeline;
use crate::types::{GhostTime, HostTime, PeerId, NANOS_PER_MINUTE};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Minimum window span before a drift fit is attempted (one second)
const MIN_DRIFT_SPAN_NANOS: i64 = 1_000_000_000;

/// Affine map from host time onto the session ghost axis
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GhostXForm {
    /// Ghost nanoseconds per host nanosecond
    pub slope: f64,
    pub anchor_host: HostTime,
    pub anchor_ghost: GhostTime,
}

impl Default for GhostXForm {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl GhostXForm {
    /// Ghost time equals host time (used by a session founder)
    pub const IDENTITY: GhostXForm = GhostXForm {
        slope: 1.0,
        anchor_host: HostTime(0),
        anchor_ghost: GhostTime(0),
    };

    /// Pure offset transform: `ghost = host + offset`
    pub fn from_offset(offset_nanos: i64) -> Self {
        Self {
            slope: 1.0,
            anchor_host: HostTime(0),
            anchor_ghost: GhostTime(offset_nanos),
        }
    }

    #[inline]
    pub fn host_to_ghost(&self, host: HostTime) -> GhostTime {
        let delta = host.since(self.anchor_host) as f64 * self.slope;
        GhostTime(self.anchor_ghost.nanos().saturating_add(delta.round() as i64))
    }

    #[inline]
    pub fn ghost_to_host(&self, ghost: GhostTime) -> HostTime {
        let delta = ghost.nanos().saturating_sub(self.anchor_ghost.nanos()) as f64 / self.slope;
        self.anchor_host.offset(delta.round() as i64)
    }

    /// Express a host-axis timeline on the ghost axis
    ///
    /// Tempo is a session value and crosses unchanged; only the time origin
    /// moves. With drift correction the two axes agree exactly at the anchor
    /// and the mapping is re-anchored on every refresh.
    pub fn timeline_to_ghost(&self, timeline: &Timeline) -> SessionTimeline {
        if self.slope == 1.0 {
            return SessionTimeline {
                tempo: timeline.tempo,
                beat_origin: timeline.beat_origin,
                time_origin: self.host_to_ghost(timeline.time_origin),
            };
        }
        SessionTimeline {
            tempo: timeline.tempo,
            beat_origin: timeline.to_beats(self.anchor_host),
            time_origin: self.anchor_ghost,
        }
    }

    /// Express a ghost-axis timeline on the host axis
    pub fn timeline_to_host(&self, timeline: &SessionTimeline) -> Timeline {
        if self.slope == 1.0 {
            return Timeline {
                tempo: timeline.tempo,
                beat_origin: timeline.beat_origin,
                time_origin: self.ghost_to_host(timeline.time_origin),
            };
        }
        Timeline {
            tempo: timeline.tempo,
            beat_origin: timeline.to_beats(self.anchor_ghost),
            time_origin: self.anchor_host,
        }
    }

    pub fn start_stop_to_ghost(&self, state: StartStopState, author: PeerId) -> SessionStartStop {
        SessionStartStop {
            is_playing: state.is_playing,
            time: self.host_to_ghost(state.time),
            author,
        }
    }

    pub fn start_stop_to_host(&self, state: &SessionStartStop) -> StartStopState {
        StartStopState {
            is_playing: state.is_playing,
            time: self.ghost_to_host(state.time),
        }
    }
}

/// A timeline on the session ghost axis, as exchanged between peers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SessionTimeline {
    pub tempo: f64,
    pub beat_origin: f64,
    pub time_origin: GhostTime,
}

impl SessionTimeline {
    /// Whether every field is usable (finite, positive tempo)
    pub fn is_valid(&self) -> bool {
        self.tempo.is_finite() && self.tempo > 0.0 && self.beat_origin.is_finite()
    }

    /// Beat at a ghost time
    #[inline]
    pub fn to_beats(&self, time: GhostTime) -> f64 {
        self.beat_origin + time.since(self.time_origin) as f64 * self.tempo / NANOS_PER_MINUTE
    }
}

/// Tuning for clock measurement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EstimatorConfig {
    /// Samples required before an estimate is produced
    pub min_samples: usize,
    /// Samples kept in the sliding window
    pub max_samples: usize,
    /// Samples with a longer round trip are discarded
    pub max_round_trip_nanos: i64,
    /// Upper bound on the drift estimate, parts per million
    pub max_drift_ppm: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            min_samples: 5,
            max_samples: 100,
            max_round_trip_nanos: 50_000_000,
            max_drift_ppm: 500.0,
        }
    }
}

/// One ping/pong measurement against a remote peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSample {
    /// Local host time when the ping was sent
    pub host_send: HostTime,
    /// Remote ghost time when the ping was answered
    pub remote_ghost: GhostTime,
    /// Local host time when the pong arrived
    pub host_recv: HostTime,
}

impl ClockSample {
    #[inline]
    pub fn round_trip(&self) -> i64 {
        self.host_recv.since(self.host_send)
    }

    #[inline]
    pub fn midpoint(&self) -> HostTime {
        self.host_send.offset(self.round_trip() / 2)
    }
}

/// Sliding-window estimator of one remote ghost axis
#[derive(Debug, Clone)]
pub struct ClockEstimator {
    config: EstimatorConfig,
    /// (host midpoint, ghost - host offset)
    points: VecDeque<(HostTime, i64)>,
}

impl ClockEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        Self {
            config,
            points: VecDeque::with_capacity(config.max_samples),
        }
    }

    /// Record a sample; returns false if it was discarded
    pub fn add_sample(&mut self, sample: ClockSample) -> bool {
        let rtt = sample.round_trip();
        if rtt < 0 || rtt > self.config.max_round_trip_nanos {
            log::debug!("Discarding clock sample with round trip {}ns", rtt);
            return false;
        }
        let mid = sample.midpoint();
        let offset = sample.remote_ghost.nanos().saturating_sub(mid.nanos());
        if self.points.len() == self.config.max_samples.max(1) {
            self.points.pop_front();
        }
        self.points.push_back((mid, offset));
        true
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn is_ready(&self) -> bool {
        self.points.len() >= self.config.min_samples.max(1)
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    /// Current estimate, if enough samples have been collected
    pub fn estimate(&self) -> Option<GhostXForm> {
        if !self.is_ready() {
            return None;
        }
        let (anchor, _) = *self.points.back()?;
        let drift = self.drift();

        // Robust intercept: median of offsets projected onto the anchor
        let mut projected: Vec<f64> = self
            .points
            .iter()
            .map(|(h, off)| *off as f64 - drift * h.since(anchor) as f64)
            .collect();
        let offset = median(&mut projected)?;

        Some(GhostXForm {
            slope: 1.0 + drift,
            anchor_host: anchor,
            anchor_ghost: GhostTime(anchor.nanos().saturating_add(offset.round() as i64)),
        })
    }

    /// Least-squares drift of the offset over the window, clamped
    fn drift(&self) -> f64 {
        let (first, _) = match self.points.front() {
            Some(p) => *p,
            None => return 0.0,
        };
        let (last, _) = match self.points.back() {
            Some(p) => *p,
            None => return 0.0,
        };
        if self.points.len() < 2 || last.since(first) < MIN_DRIFT_SPAN_NANOS {
            return 0.0;
        }

        let n = self.points.len() as f64;
        let xs = self.points.iter().map(|(h, _)| h.since(first) as f64);
        let mean_x = xs.clone().sum::<f64>() / n;
        let mean_y = self.points.iter().map(|(_, o)| *o as f64).sum::<f64>() / n;

        let (mut sxy, mut sxx) = (0.0, 0.0);
        for (x, (_, off)) in xs.zip(self.points.iter()) {
            let dx = x - mean_x;
            sxy += dx * (*off as f64 - mean_y);
            sxx += dx * dx;
        }
        if sxx <= 0.0 {
            return 0.0;
        }
        let limit = self.config.max_drift_ppm * 1e-6;
        (sxy / sxx).clamp(-limit, limit)
    }
}

fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}
