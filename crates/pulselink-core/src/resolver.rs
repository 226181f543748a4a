//! Quantized launch resolver
//!
//! Turns "beat B at time T" requests into timeline remaps. Alone, a request
//! simply moves the beat grid. With peers, the grid may not jump: the beat is
//! deferred to the next time the current grid reaches the requested phase.

use crate::error::LinkResult;
use crate::timeline::{closest_phase_match, phase, phase_distance, validate_quantum, Timeline};
use crate::types::HostTime;

/// Remap so that `beat` occurs exactly at `time`, discarding continuity
pub fn force_beat_at_time(
    timeline: &Timeline,
    beat: f64,
    time: HostTime,
    quantum: f64,
) -> LinkResult<Timeline> {
    validate_quantum(quantum)?;
    Timeline::new(timeline.tempo, beat, time)
}

/// Host time at or after `time` where the current grid reaches the phase of `beat`
pub fn quantized_launch_time(
    timeline: &Timeline,
    beat: f64,
    time: HostTime,
    quantum: f64,
) -> LinkResult<HostTime> {
    let quantum = validate_quantum(quantum)?;
    let current = phase(timeline.to_beats(time), quantum);
    let wait_beats = phase_distance(current, phase(beat, quantum), quantum);
    let wait_nanos = (wait_beats * timeline.nanos_per_beat()).round() as i64;
    Ok(time.offset(wait_nanos))
}

/// Map `beat` onto `time` if alone, or onto the next matching phase otherwise
///
/// With peers the returned timeline keeps the tempo and the phase of every
/// earlier time; only the beat magnitude may shift by whole quanta.
pub fn request_beat_at_time(
    timeline: &Timeline,
    beat: f64,
    time: HostTime,
    quantum: f64,
    has_peers: bool,
) -> LinkResult<Timeline> {
    if !has_peers {
        return force_beat_at_time(timeline, beat, time, quantum);
    }
    let launch = quantized_launch_time(timeline, beat, time, quantum)?;
    Timeline::new(timeline.tempo, beat, launch)
}

/// Take on the tempo and phase of `incoming` without a jump in magnitude
///
/// The result has `incoming`'s tempo, its phase with respect to `quantum`,
/// and the beat value at `now` closest to what `current` shows at `now`.
pub fn adopt_timeline(current: &Timeline, incoming: &Timeline, now: HostTime, quantum: f64) -> Timeline {
    let local = current.to_beats(now);
    let remote = incoming.to_beats(now);
    Timeline {
        tempo: incoming.tempo,
        beat_origin: closest_phase_match(local, remote, quantum),
        time_origin: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LinkError;
    use crate::timeline::phase_offset;

    const T0: HostTime = HostTime(10_000_000_000);

    /// 120 bpm with beat 2.0 at `T0`
    fn grid() -> Timeline {
        Timeline::new(120.0, 2.0, T0).unwrap()
    }

    fn same_phase(a: f64, b: f64, q: f64) -> bool {
        phase_offset(a, b, q).abs() < 1e-6
    }

    #[test]
    fn test_quantized_wait_two_beats() {
        let tl = request_beat_at_time(&grid(), 0.0, T0, 4.0, true).unwrap();
        // Two beats of phase distance at 500ms per beat
        assert_eq!(tl.time_origin, HostTime(T0.nanos() + 1_000_000_000));
        assert_eq!(tl.beat_at_time(tl.time_origin, 4.0).unwrap(), 0.0);
        assert_eq!(tl.phase_at_time(tl.time_origin, 4.0).unwrap(), 0.0);
        assert_eq!(tl.tempo, 120.0);
    }

    #[test]
    fn test_solo_request_matches_force() {
        for beat in [-3.5, 0.0, 1.25, 9.0] {
            let requested = request_beat_at_time(&grid(), beat, T0, 4.0, false).unwrap();
            let forced = force_beat_at_time(&grid(), beat, T0, 4.0).unwrap();
            assert_eq!(requested, forced);
            assert_eq!(requested.beat_at_time(T0, 4.0).unwrap(), beat);
        }
    }

    #[test]
    fn test_zero_wait_when_phase_already_matches() {
        let tl = request_beat_at_time(&grid(), 6.0, T0, 4.0, true).unwrap();
        assert_eq!(tl.time_origin, T0);
        assert_eq!(tl.beat_at_time(T0, 4.0).unwrap(), 6.0);
    }

    #[test]
    fn test_quantized_wait_preserves_prior_phase() {
        let before = grid();
        for (beat, q) in [(0.0, 4.0), (1.5, 4.0), (0.25, 1.0), (5.0, 3.0), (-2.0, 8.0)] {
            let after = request_beat_at_time(&before, beat, T0, q, true).unwrap();
            let launch = after.time_origin;
            assert!(launch >= T0);
            assert!(same_phase(after.to_beats(launch), beat, q));
            assert_eq!(after.tempo, before.tempo);

            // Every time between the request and the launch keeps its phase
            let span = launch.since(T0);
            for step in 0..=8 {
                let t = T0.offset(span * step / 8);
                assert!(
                    same_phase(after.to_beats(t), before.to_beats(t), q),
                    "beat {beat} q {q}: phase changed at {t:?}"
                );
            }
        }
    }

    #[test]
    fn test_resolver_rejects_invalid_quantum() {
        for q in [0.0, -1.0, f64::NAN] {
            assert!(matches!(
                request_beat_at_time(&grid(), 0.0, T0, q, true),
                Err(LinkError::InvalidArgument(_))
            ));
            assert!(force_beat_at_time(&grid(), 0.0, T0, q).is_err());
        }
    }

    #[test]
    fn test_adopt_timeline_keeps_local_magnitude() {
        let current = Timeline::new(120.0, 101.0, T0).unwrap();
        // Remote is at beat 2.5 at T0, 100 bpm
        let incoming = Timeline::new(100.0, 2.5, T0).unwrap();
        let adopted = adopt_timeline(&current, &incoming, T0, 4.0);
        assert_eq!(adopted.tempo, 100.0);
        assert!(same_phase(adopted.to_beats(T0), 2.5, 4.0));
        assert!((adopted.to_beats(T0) - 101.0).abs() <= 2.0);

        // Phase stays locked to the remote grid afterwards
        let later = T0.offset(3_333_333_333);
        assert!(same_phase(adopted.to_beats(later), incoming.to_beats(later), 4.0));
    }
}
