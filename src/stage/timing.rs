//! Inter-move pacing estimate.
//!
//! The stage controller has no flow control the host can lean on, so the
//! dispatcher spaces commands out itself. The estimate assumes a worst-case
//! trapezoidal profile (full ramp up, cruise, ramp down) over the straight
//! line between the two positions, which makes it a conservative lower
//! bound on how long the move takes, not a simulation of it.

use std::time::Duration;

use thiserror::Error;

use super::position::Position;

#[derive(Debug, Error, PartialEq)]
pub enum TimingError {
    #[error("invalid motion parameters: {0}")]
    InvalidParameters(String),
}

/// Minimum delay before the next command may be sent.
///
/// `max_rate` is in mm/min (GRBL convention), `max_accel` in mm/s². The
/// result is floored to whole milliseconds. The formula reduces to
/// `v/a + d/v`, so even a zero-distance move pays one ramp time.
pub fn delay_before_next(
    current: Position,
    next: Position,
    max_rate: f64,
    max_accel: f64,
) -> Result<Duration, TimingError> {
    if max_rate <= 0.0 {
        return Err(TimingError::InvalidParameters(format!(
            "max rate must be positive, got {max_rate}"
        )));
    }
    if max_accel <= 0.0 {
        return Err(TimingError::InvalidParameters(format!(
            "max acceleration must be positive, got {max_accel}"
        )));
    }

    let d = current.distance_to(&next);
    let v = max_rate / 60.0;
    let ramp_time = (2.0 * v) / max_accel;
    let cruise_correction = (v * v) / max_accel;
    let delta_t = ramp_time + (d - cruise_correction) / v;

    let millis = (delta_t * 1000.0).floor().max(0.0) as u64;
    Ok(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(x: f64, y: f64) -> Position {
        Position::new(x, y)
    }

    #[test]
    fn matches_trapezoid_formula() {
        // v = 600/60 = 10 mm/s, a = 100 mm/s²:
        // dt = 2*10/100 + (50 - 100/100)/10 = 0.2 + 4.9 = 5.1 s
        let delay = delay_before_next(at(0.0, 0.0), at(50.0, 0.0), 600.0, 100.0).unwrap();
        assert_eq!(delay, Duration::from_millis(5100));
    }

    #[test]
    fn monotonically_non_decreasing_in_distance() {
        let mut last = Duration::ZERO;
        for step in 0..50 {
            let d = step as f64 * 2.0;
            let delay = delay_before_next(at(0.0, 0.0), at(d, 0.0), 800.0, 200.0).unwrap();
            assert!(delay >= last, "delay shrank at d={d}");
            last = delay;
        }
    }

    #[test]
    fn zero_distance_still_pays_the_ramp() {
        // dt = v/a + d/v; at d = 0 it collapses to v/a = 10/1 = 10 s.
        let delay = delay_before_next(at(0.0, 0.0), at(0.0, 0.0), 600.0, 1.0).unwrap();
        assert_eq!(delay, Duration::from_secs(10));
    }

    #[test]
    fn rejects_non_positive_rate() {
        assert!(matches!(
            delay_before_next(at(0.0, 0.0), at(1.0, 0.0), 0.0, 100.0),
            Err(TimingError::InvalidParameters(_))
        ));
        assert!(matches!(
            delay_before_next(at(0.0, 0.0), at(1.0, 0.0), -5.0, 100.0),
            Err(TimingError::InvalidParameters(_))
        ));
    }

    #[test]
    fn rejects_non_positive_accel() {
        assert!(matches!(
            delay_before_next(at(0.0, 0.0), at(1.0, 0.0), 600.0, 0.0),
            Err(TimingError::InvalidParameters(_))
        ));
    }

    #[test]
    fn diagonal_uses_euclidean_distance() {
        let straight = delay_before_next(at(0.0, 0.0), at(5.0, 0.0), 600.0, 100.0).unwrap();
        let diagonal = delay_before_next(at(0.0, 0.0), at(3.0, 4.0), 600.0, 100.0).unwrap();
        assert_eq!(straight, diagonal);
    }
}
