//! Monotonic stopwatch and strip scan time estimation.

use std::time::{Duration, Instant};

/// Simple stop watch to measure time deltas.
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Time elapsed since creation or last reset.
    pub fn delta(&self) -> Duration {
        self.start.elapsed()
    }

    /// Restart the timer.
    pub fn reset(&mut self) {
        self.start = Instant::now();
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Linear estimate of the remaining time of a fixed number of passes.
#[derive(Debug, Clone)]
pub struct Estimate {
    timer: Timer,
    count: usize,
    passed: usize,
}

impl Estimate {
    /// Create an estimate for `count` passes.
    pub fn new(count: usize) -> Self {
        Self {
            timer: Timer::new(),
            count,
            passed: 0,
        }
    }

    /// Record one finished pass.
    pub fn advance(&mut self) {
        self.passed = (self.passed + 1).min(self.count);
    }

    /// Number of finished passes.
    pub fn passed(&self) -> usize {
        self.passed
    }

    /// Time since the estimate was created.
    pub fn elapsed(&self) -> Duration {
        self.timer.delta()
    }

    /// Average pass duration times remaining passes.
    pub fn remaining(&self) -> Duration {
        if self.passed == 0 {
            return Duration::ZERO;
        }
        let average = self.elapsed() / self.passed as u32;
        average * (self.count - self.passed) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_delta_grows() {
        let mut timer = Timer::new();
        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.delta() >= Duration::from_millis(5));
        timer.reset();
        assert!(timer.delta() < Duration::from_millis(5));
    }

    #[test]
    fn test_estimate_without_passes() {
        let estimate = Estimate::new(10);
        assert_eq!(estimate.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_estimate_saturates() {
        let mut estimate = Estimate::new(2);
        estimate.advance();
        estimate.advance();
        estimate.advance();
        assert_eq!(estimate.passed(), 2);
        assert_eq!(estimate.remaining(), Duration::ZERO);
    }
}
