//! Exponential backoff shared by the sensor networking loops.

use std::time::Duration;

use rand::Rng;

/// Jittered exponential backoff.
///
/// The first interval is `base`; each subsequent interval is multiplied by
/// `factor` and capped at `max_interval`. Jitter is applied as a uniform
/// fraction of the current interval.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: f64,
    factor: f64,
    max_interval: f64,
    jitter: f64,
    current: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(0.5, 2.0, 30.0, 0.1)
    }
}

impl ExponentialBackoff {
    pub fn new(base: f64, factor: f64, max_interval: f64, jitter: f64) -> Self {
        Self {
            base,
            factor,
            max_interval,
            jitter,
            current: 0.0,
        }
    }

    /// Reset to the initial state; the next interval will be `base` again.
    pub fn reset(&mut self) {
        self.current = 0.0;
    }

    /// Advance and return the next delay.
    pub fn next_interval(&mut self) -> Duration {
        if self.current == 0.0 {
            self.current = self.base;
        } else {
            self.current = (self.current * self.factor).min(self.max_interval);
        }
        let jitter_delta = self.current * self.jitter;
        let secs = if jitter_delta > 0.0 {
            self.current + rand::thread_rng().gen_range(-jitter_delta..=jitter_delta)
        } else {
            self.current
        };
        Duration::from_secs_f64(secs.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_until_max() {
        let mut backoff = ExponentialBackoff::new(0.1, 2.0, 1.0, 0.0);
        let intervals: Vec<f64> = (0..5).map(|_| backoff.next_interval().as_secs_f64()).collect();
        assert!((intervals[0] - 0.1).abs() < 1e-9);
        assert!((intervals[1] - 0.2).abs() < 1e-9);
        assert!(intervals.windows(2).all(|w| w[0] <= w[1]));
        assert!((intervals[4] - 1.0).abs() < 1e-9);
        assert!((backoff.next_interval().as_secs_f64() - 1.0).abs() < 1e-9);
        backoff.reset();
        assert!((backoff.next_interval().as_secs_f64() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_backoff_jitter_stays_near_current() {
        let mut backoff = ExponentialBackoff::new(1.0, 2.0, 8.0, 0.1);
        let first = backoff.next_interval().as_secs_f64();
        assert!((0.9..=1.1).contains(&first));
    }
}
