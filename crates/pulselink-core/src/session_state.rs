//! Session state snapshots handed to callers
//!
//! A [`SessionState`] is a plain value: capturing copies it out of the
//! published slot, and every setter only touches the caller's copy. Nothing
//! reaches the session until the copy is committed back through the same
//! path it was captured from.

use crate::error::{LinkError, LinkResult};
use crate::resolver;
use crate::start_stop::StartStopState;
use crate::timeline::{validate_quantum, Timeline};
use crate::types::HostTime;

/// Parts of a snapshot modified since it was captured
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Changes(u8);

impl Changes {
    pub const NONE: Changes = Changes(0);
    /// Tempo or beat grid changed
    pub const TIMELINE: Changes = Changes(1 << 0);
    /// Grid was force-remapped
    pub const FORCED: Changes = Changes(1 << 1);
    pub const START_STOP: Changes = Changes(1 << 2);

    #[inline]
    pub const fn contains(self, other: Changes) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn union(self, other: Changes) -> Changes {
        Changes(self.0 | other.0)
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Snapshot of the session: timeline, start/stop state and peer count
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionState {
    timeline: Timeline,
    start_stop: StartStopState,
    num_peers: usize,
    changes: Changes,
}

impl SessionState {
    pub(crate) fn new(timeline: Timeline, start_stop: StartStopState, num_peers: usize) -> Self {
        Self {
            timeline,
            start_stop,
            num_peers,
            changes: Changes::NONE,
        }
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn start_stop(&self) -> StartStopState {
        self.start_stop
    }

    /// Peers in the session when this snapshot was captured
    pub fn num_peers(&self) -> usize {
        self.num_peers
    }

    pub fn changes(&self) -> Changes {
        self.changes
    }

    pub(crate) fn with_changes(mut self, changes: Changes) -> Self {
        self.changes = changes;
        self
    }

    pub(crate) fn with_num_peers(mut self, num_peers: usize) -> Self {
        self.num_peers = num_peers;
        self
    }

    // ─────────────────────────────────────────────────────────────
    // Tempo and beat grid
    // ─────────────────────────────────────────────────────────────

    /// Tempo in beats per minute
    pub fn tempo(&self) -> f64 {
        self.timeline.tempo
    }

    /// Set the tempo from `at` onwards, keeping the beat at `at` continuous
    pub fn set_tempo(&mut self, bpm: f64, at: HostTime) -> LinkResult<()> {
        self.timeline = self.timeline.with_tempo_at(bpm, at)?;
        self.changes = self.changes.union(Changes::TIMELINE);
        Ok(())
    }

    pub fn beat_at_time(&self, time: HostTime, quantum: f64) -> LinkResult<f64> {
        self.timeline.beat_at_time(time, quantum)
    }

    pub fn phase_at_time(&self, time: HostTime, quantum: f64) -> LinkResult<f64> {
        self.timeline.phase_at_time(time, quantum)
    }

    pub fn time_at_beat(&self, beat: f64, quantum: f64) -> LinkResult<HostTime> {
        self.timeline.time_at_beat(beat, quantum)
    }

    /// Map `beat` onto `time`, quantized to the session grid when peers are present
    ///
    /// Alone this is the same as [`SessionState::force_beat_at_time`]. With
    /// peers the beat lands on the next time at or after `time` whose phase
    /// matches `beat` with respect to `quantum`.
    pub fn request_beat_at_time(&mut self, beat: f64, time: HostTime, quantum: f64) -> LinkResult<()> {
        if !beat.is_finite() {
            return Err(LinkError::InvalidArgument("beat must be finite"));
        }
        if self.num_peers == 0 {
            return self.force_beat_at_time(beat, time, quantum);
        }
        self.timeline = resolver::request_beat_at_time(&self.timeline, beat, time, quantum, true)?;
        self.changes = self.changes.union(Changes::TIMELINE);
        Ok(())
    }

    /// Map `beat` onto `time` unconditionally
    ///
    /// Peers following this session see the grid jump. The remap is always
    /// broadcast, even when it only changes the local beat magnitude.
    pub fn force_beat_at_time(&mut self, beat: f64, time: HostTime, quantum: f64) -> LinkResult<()> {
        if !beat.is_finite() {
            return Err(LinkError::InvalidArgument("beat must be finite"));
        }
        self.timeline = resolver::force_beat_at_time(&self.timeline, beat, time, quantum)?;
        self.changes = self.changes.union(Changes::TIMELINE).union(Changes::FORCED);
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────
    // Start/stop
    // ─────────────────────────────────────────────────────────────

    /// Start or stop the transport at `time`
    pub fn set_is_playing(&mut self, is_playing: bool, time: HostTime) {
        self.start_stop = StartStopState::new(is_playing, time);
        self.changes = self.changes.union(Changes::START_STOP);
    }

    pub fn is_playing(&self) -> bool {
        self.start_stop.is_playing
    }

    /// Host time of the latest start/stop transition
    pub fn time_for_is_playing(&self) -> HostTime {
        self.start_stop.time
    }

    /// Map `beat` onto the time the transport starts, if it is playing
    pub fn request_beat_at_start_playing_time(&mut self, beat: f64, quantum: f64) -> LinkResult<()> {
        validate_quantum(quantum)?;
        if self.is_playing() {
            self.request_beat_at_time(beat, self.time_for_is_playing(), quantum)?;
        }
        Ok(())
    }

    /// Set the transport state and map `beat` onto `time` in one step
    ///
    /// Same as [`set_is_playing`](Self::set_is_playing) followed by
    /// [`request_beat_at_time`](Self::request_beat_at_time). With peers the
    /// transport starts at `time` while `beat` lands on the next quantum
    /// boundary, so the beat at `time` may be negative.
    pub fn set_is_playing_and_request_beat_at_time(
        &mut self,
        is_playing: bool,
        time: HostTime,
        beat: f64,
        quantum: f64,
    ) -> LinkResult<()> {
        validate_quantum(quantum)?;
        if !beat.is_finite() {
            return Err(LinkError::InvalidArgument("beat must be finite"));
        }
        self.set_is_playing(is_playing, time);
        self.request_beat_at_time(beat, time, quantum)
    }
}
