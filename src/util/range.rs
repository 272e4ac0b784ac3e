//! Linear ramps for voltage and current sweeps.

use crate::error::{AppResult, BenchError};

/// Upper bound on the number of points of a single ramp.
pub const MAX_RAMP_POINTS: usize = 1_000_000;

/// Inclusive list of points from `begin` to `end` spaced by `|step|`.
///
/// The sign of `step` is ignored, the direction follows `end - begin`. The last
/// point is always exactly `end`, even if the distance is not a multiple of the
/// step. A zero step yields only the end points. Ramps with more than
/// [`MAX_RAMP_POINTS`] points are rejected.
pub fn linear_range(begin: f64, end: f64, step: f64) -> AppResult<Vec<f64>> {
    if !begin.is_finite() || !end.is_finite() {
        return Err(BenchError::Validation(format!(
            "ramp from {begin} to {end} is not finite"
        )));
    }
    let distance = (end - begin).abs();
    if distance == 0.0 {
        return Ok(vec![end]);
    }
    let step = step.abs();
    if step == 0.0 || !step.is_finite() {
        return Ok(vec![begin, end]);
    }
    let direction = if end < begin { -1.0 } else { 1.0 };
    let points = (distance / step).floor();
    if points >= MAX_RAMP_POINTS as f64 {
        return Err(BenchError::Validation(format!(
            "ramp from {begin} to {end} by {step} exceeds {MAX_RAMP_POINTS} points"
        )));
    }
    let count = points as usize;
    let mut values = Vec::with_capacity(count + 2);
    for index in 0..=count {
        let value = begin + direction * step * index as f64;
        // Guard against float drift past the end point.
        if (value - begin).abs() >= distance - step * 1e-9 {
            break;
        }
        values.push(value);
    }
    values.push(end);
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_range_up() {
        assert_eq!(linear_range(0.0, 3.0, 1.0).unwrap(), vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_linear_range_down_ignores_step_sign() {
        assert_eq!(linear_range(0.0, -10.0, 5.0).unwrap(), vec![0.0, -5.0, -10.0]);
        assert_eq!(linear_range(0.0, -10.0, -5.0).unwrap(), vec![0.0, -5.0, -10.0]);
    }

    #[test]
    fn test_linear_range_partial_step() {
        assert_eq!(
            linear_range(-60.0, 0.0, 25.0).unwrap(),
            vec![-60.0, -35.0, -10.0, 0.0]
        );
    }

    #[test]
    fn test_linear_range_degenerate() {
        assert_eq!(linear_range(5.0, 5.0, 1.0).unwrap(), vec![5.0]);
        assert_eq!(linear_range(0.0, 5.0, 0.0).unwrap(), vec![0.0, 5.0]);
    }

    #[test]
    fn test_linear_range_rejects_tiny_step() {
        let err = linear_range(0.0, -1000.0, 1e-300).unwrap_err();
        assert!(matches!(err, BenchError::Validation(_)));
        assert!(!err.is_retryable());
        assert!(linear_range(0.0, f64::INFINITY, 1.0).is_err());
    }
}
