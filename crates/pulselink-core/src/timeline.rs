//! Beat/time mapping and phase arithmetic
//!
//! A [`Timeline`] is an affine map between host time and beats:
//!
//! ```text
//! beat(t) = beat_origin + (t - time_origin) * tempo / 60e9
//! ```
//!
//! Beat magnitudes are local to one device. What peers share is the phase of
//! a beat with respect to a quantum (e.g. 4 for a 4-beat bar), computed with
//! floor-modulo so negative beats still land in `[0, quantum)`.

use crate::error::{LinkError, LinkResult};
use crate::types::{HostTime, NANOS_PER_MINUTE};
use serde::{Deserialize, Serialize};

/// Tolerance used when deciding that two phases are "the same"
pub const PHASE_EPSILON: f64 = 1e-9;

/// Beat/time relationship for one tempo epoch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    /// Beats per minute, always > 0
    pub tempo: f64,
    /// Beat value at `time_origin`
    pub beat_origin: f64,
    /// Host time at which `beat_origin` occurs
    pub time_origin: HostTime,
}

impl Timeline {
    /// Create a timeline, rejecting non-positive or non-finite tempo
    pub fn new(tempo: f64, beat_origin: f64, time_origin: HostTime) -> LinkResult<Self> {
        let tempo = validate_tempo(tempo)?;
        if !beat_origin.is_finite() {
            return Err(LinkError::InvalidArgument("beat origin must be finite"));
        }
        Ok(Self {
            tempo,
            beat_origin,
            time_origin,
        })
    }

    /// Length of one beat in nanoseconds
    #[inline]
    pub fn nanos_per_beat(&self) -> f64 {
        NANOS_PER_MINUTE / self.tempo
    }

    /// Raw beat value at a host time
    #[inline]
    pub fn to_beats(&self, time: HostTime) -> f64 {
        let elapsed = time.since(self.time_origin) as f64;
        self.beat_origin + elapsed * self.tempo / NANOS_PER_MINUTE
    }

    /// Raw host time of a beat value, rounded to the nearest nanosecond
    #[inline]
    pub fn from_beats(&self, beat: f64) -> HostTime {
        let nanos = ((beat - self.beat_origin) * self.nanos_per_beat()).round();
        // `as` saturates for out-of-range floats
        self.time_origin.offset(nanos as i64)
    }

    /// Beat at a host time
    ///
    /// The quantum does not change the value; it is validated for symmetry
    /// with [`Timeline::phase_at_time`].
    pub fn beat_at_time(&self, time: HostTime, quantum: f64) -> LinkResult<f64> {
        validate_quantum(quantum)?;
        Ok(self.to_beats(time))
    }

    /// Host time of a beat, the inverse of [`Timeline::beat_at_time`]
    pub fn time_at_beat(&self, beat: f64, quantum: f64) -> LinkResult<HostTime> {
        validate_quantum(quantum)?;
        if !beat.is_finite() {
            return Err(LinkError::InvalidArgument("beat must be finite"));
        }
        Ok(self.from_beats(beat))
    }

    /// Phase at a host time, in `[0, quantum)`
    pub fn phase_at_time(&self, time: HostTime, quantum: f64) -> LinkResult<f64> {
        let quantum = validate_quantum(quantum)?;
        Ok(phase(self.to_beats(time), quantum))
    }

    /// Change tempo at `at` while keeping the beat at `at` unchanged
    pub fn with_tempo_at(&self, tempo: f64, at: HostTime) -> LinkResult<Self> {
        let tempo = validate_tempo(tempo)?;
        Ok(Self {
            tempo,
            beat_origin: self.to_beats(at),
            time_origin: at,
        })
    }

    /// Re-express the same mapping with its origin moved to `at`
    pub fn rebased_at(&self, at: HostTime) -> Self {
        Self {
            tempo: self.tempo,
            beat_origin: self.to_beats(at),
            time_origin: at,
        }
    }
}

/// Reject tempos that are not strictly positive and finite
#[inline]
pub fn validate_tempo(tempo: f64) -> LinkResult<f64> {
    if tempo.is_finite() && tempo > 0.0 {
        Ok(tempo)
    } else {
        Err(LinkError::InvalidArgument("tempo must be positive and finite"))
    }
}

/// Reject quanta that are not strictly positive and finite
#[inline]
pub fn validate_quantum(quantum: f64) -> LinkResult<f64> {
    if quantum.is_finite() && quantum > 0.0 {
        Ok(quantum)
    } else {
        Err(LinkError::InvalidArgument("quantum must be positive and finite"))
    }
}

/// Floor-modulo of a beat value, always in `[0, quantum)`
#[inline]
pub fn phase(beat: f64, quantum: f64) -> f64 {
    let r = beat.rem_euclid(quantum);
    // rem_euclid can round up to `quantum` for tiny negative inputs
    if r >= quantum {
        0.0
    } else {
        r
    }
}

/// Smallest value `>= x` whose phase equals the phase of `target`
#[inline]
pub fn next_phase_match(x: f64, target: f64, quantum: f64) -> f64 {
    x + phase_distance(phase(x, quantum), phase(target, quantum), quantum)
}

/// Value closest to `x` whose phase equals the phase of `target`
///
/// The result is within half a quantum of `x`.
#[inline]
pub fn closest_phase_match(x: f64, target: f64, quantum: f64) -> f64 {
    next_phase_match(x - 0.5 * quantum, target, quantum)
}

/// Forward distance in beats from phase `from` to phase `to`, in `[0, quantum)`
///
/// Distances within [`PHASE_EPSILON`] of a full quantum collapse to zero so
/// that an already-matching phase never waits a whole cycle.
#[inline]
pub fn phase_distance(from: f64, to: f64, quantum: f64) -> f64 {
    let d = phase(to - from, quantum);
    if quantum - d <= PHASE_EPSILON * quantum.max(1.0) {
        0.0
    } else {
        d
    }
}

/// Signed phase difference between two beats, in `[-quantum/2, quantum/2)`
#[inline]
pub fn phase_offset(a: f64, b: f64, quantum: f64) -> f64 {
    phase(a - b + 0.5 * quantum, quantum) - 0.5 * quantum
}
