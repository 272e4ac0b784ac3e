//! Sample statistics used by acquisitions.

use crate::error::AppResult;
use crate::util::Timer;
use std::thread;
use std::time::Duration;
use tracing::debug;

/// Arithmetic mean, `NaN` for no samples.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation, 0 for fewer than two samples.
pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = mean(values);
    let sum: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    (sum / (values.len() - 1) as f64).sqrt()
}

/// Median, `NaN` for no samples.
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// True if `std(values) / |mean(values)|` is below `threshold`.
pub fn std_mean_filter(values: &[f64], threshold: f64) -> bool {
    let mean = mean(values).abs();
    if mean == 0.0 {
        return std_dev(values) == 0.0;
    }
    std_dev(values) / mean < threshold
}

/// Result of a least squares line fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    /// Slope.
    pub slope: f64,
    /// Intercept.
    pub intercept: f64,
    /// Coefficient of determination.
    pub rsq: f64,
    /// Standard error of the slope.
    pub std_err: f64,
}

/// Least squares fit of `y` over `x`.
///
/// Returns `None` for fewer than two points or identical `x` values.
pub fn linear_fit(x: &[f64], y: &[f64]) -> Option<LinearFit> {
    let n = x.len().min(y.len());
    if n < 2 {
        return None;
    }
    let (x, y) = (&x[..n], &y[..n]);
    let mean_x = mean(x);
    let mean_y = mean(y);
    let ssxx: f64 = x.iter().map(|v| (v - mean_x).powi(2)).sum();
    let ssyy: f64 = y.iter().map(|v| (v - mean_y).powi(2)).sum();
    let ssxy: f64 = x.iter().zip(y).map(|(a, b)| (a - mean_x) * (b - mean_y)).sum();
    if ssxx == 0.0 {
        return None;
    }
    let slope = ssxy / ssxx;
    let intercept = mean_y - slope * mean_x;
    let rsq = if ssyy == 0.0 { 1.0 } else { (ssxy * ssxy) / (ssxx * ssyy) };
    let std_err = if n > 2 {
        let residual = (ssyy - slope * ssxy).max(0.0);
        (residual / (n - 2) as f64 / ssxx).sqrt()
    } else {
        0.0
    };
    Some(LinearFit {
        slope,
        intercept,
        rsq,
        std_err,
    })
}

/// Parameters of a steady state check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SteadyState {
    /// Fit attempts.
    pub iterations: usize,
    /// Readings per attempt.
    pub samples: usize,
    /// Largest accepted slope per second.
    pub max_slope: f64,
    /// Largest accepted slope error.
    pub max_std_err: f64,
    /// Minimum spacing of readings.
    pub waiting_time: Duration,
}

impl Default for SteadyState {
    fn default() -> Self {
        Self {
            iterations: 7,
            samples: 2,
            max_slope: 1e-6,
            max_std_err: 1e-6,
            waiting_time: Duration::ZERO,
        }
    }
}

impl SteadyState {
    /// Fit readings of `read` over time until the slope is flat enough.
    ///
    /// Returns `false` if no attempt reached a flat slope.
    pub fn check<F>(&self, mut read: F) -> AppResult<bool>
    where
        F: FnMut() -> AppResult<f64>,
    {
        for iteration in 1..=self.iterations {
            let timer = Timer::new();
            let mut x = Vec::with_capacity(self.samples);
            let mut y = Vec::with_capacity(self.samples);
            for index in 0..self.samples {
                let started = timer.delta();
                y.push(read()?);
                let elapsed = timer.delta();
                x.push(elapsed.as_secs_f64().max(index as f64 * 1e-6));
                if let Some(remaining) = self.waiting_time.checked_sub(elapsed - started) {
                    thread::sleep(remaining);
                }
            }
            let fit = linear_fit(&x, &y).unwrap_or(LinearFit {
                slope: 0.0,
                intercept: mean(&y),
                rsq: 1.0,
                std_err: 0.0,
            });
            debug!(iteration, slope = fit.slope, rsq = fit.rsq, std_err = fit.std_err, "steady state fit");
            if fit.std_err <= self.max_std_err && fit.slope.abs() <= self.max_slope.abs() {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Median of `count` readings.
pub fn median_of<F>(count: usize, mut read: F) -> AppResult<f64>
where
    F: FnMut() -> AppResult<f64>,
{
    let values = (0..count.max(1)).map(|_| read()).collect::<AppResult<Vec<_>>>()?;
    Ok(median(&values))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), 2.5);
        assert!(median(&[]).is_nan());
    }

    #[test]
    fn test_std_mean_filter() {
        assert!(std_mean_filter(&[1.0, 1.001, 0.999], 0.005));
        assert!(!std_mean_filter(&[1.0, 1.5, 0.5], 0.005));
        assert!(std_mean_filter(&[0.0, 0.0, 0.0], 0.005));
    }

    #[test]
    fn test_linear_fit() {
        let fit = linear_fit(&[0.0, 1.0, 2.0, 3.0], &[1.0, 3.0, 5.0, 7.0]).unwrap();
        assert!((fit.slope - 2.0).abs() < 1e-12);
        assert!((fit.intercept - 1.0).abs() < 1e-12);
        assert!((fit.rsq - 1.0).abs() < 1e-12);
        assert!(fit.std_err < 1e-12);
        assert!(linear_fit(&[1.0, 1.0], &[1.0, 2.0]).is_none());
    }

    #[test]
    fn test_steady_state_on_constant_reading() {
        let check = SteadyState::default();
        assert!(check.check(|| Ok(1e-9)).unwrap());
    }

    #[test]
    fn test_steady_state_on_drift() {
        let check = SteadyState {
            iterations: 2,
            samples: 3,
            waiting_time: Duration::from_millis(2),
            ..SteadyState::default()
        };
        let mut value = 0.0;
        let reached = check
            .check(|| {
                value += 1.0;
                Ok(value)
            })
            .unwrap();
        assert!(!reached);
    }

    #[test]
    fn test_median_of() {
        let mut values = vec![5.0, 1.0, 3.0].into_iter();
        assert_eq!(median_of(3, || Ok(values.next().unwrap_or(0.0))).unwrap(), 3.0);
    }
}
