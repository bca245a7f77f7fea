use std::collections::VecDeque;
use std::time::{Duration, Instant};

// Window shared with the controller's bandwidth apportionment.
pub const WINDOW: Duration = Duration::from_secs(20);

/// Sliding-window byte-rate estimator: rate() is the number of bytes added
/// in the last window, divided by the window length.
#[derive(Debug)]
pub struct RateMeter {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
    in_window: u64,
    total: u64,
}

impl RateMeter {

    pub fn new() -> Self {
        Self::with_window(WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
            in_window: 0,
            total: 0,
        }
    }

    pub fn add(&mut self, bytes: u64) {
        self.add_at(Instant::now(), bytes);
    }

    pub fn add_at(&mut self, at: Instant, bytes: u64) {
        self.samples.push_back((at, bytes));
        self.in_window += bytes;
        self.total += bytes;
    }

    /// Bytes per second over the window.
    pub fn rate(&mut self) -> f64 {
        self.rate_at(Instant::now())
    }

    pub fn rate_at(&mut self, now: Instant) -> f64 {
        self.prune(now);
        self.in_window as f64 / self.window.as_secs_f64()
    }

    /// Total bytes ever added.
    pub fn total(&self) -> u64 {
        self.total
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(at, bytes)) = self.samples.front() {
            if now.duration_since(at) <= self.window {
                break;
            }
            self.in_window -= bytes;
            self.samples.pop_front();
        }
    }
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_over_uniform_load() {
        // 1 KiB every second for a full window reads back within 10%.
        let mut meter = RateMeter::new();
        let start = Instant::now();
        for i in 0..20 {
            meter.add_at(start + Duration::from_secs(i), 1024);
        }
        let rate = meter.rate_at(start + Duration::from_secs(19));
        assert!((rate - 1024.0).abs() <= 1024.0 * 0.1, "rate was {}", rate);
    }

    #[test]
    fn stale_samples_fall_out() {
        let mut meter = RateMeter::new();
        let start = Instant::now();
        meter.add_at(start, 10_000);
        assert!(meter.rate_at(start + Duration::from_secs(1)) > 0.0);
        assert_eq!(meter.rate_at(start + Duration::from_secs(25)), 0.0);
        assert_eq!(meter.total(), 10_000);
    }

    #[test]
    fn empty_meter_is_zero() {
        let mut meter = RateMeter::new();
        assert_eq!(meter.rate(), 0.0);
        assert_eq!(meter.total(), 0);
    }
}
