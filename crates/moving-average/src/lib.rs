#![forbid(unsafe_code)]

//! A sliding-window rate meter used by the job execution engine to report
//! records/sec throughput per TaskGroup. The windowing algorithm is
//! domain-agnostic: it tracks `(timestamp, value)` samples and evicts any
//! that have aged out of `window_millis`, the same shape that applies
//! whether the value being windowed is records, bytes, or anything else
//! counted over time.

use std::collections::VecDeque;

/// Tracks a throughput figure over a trailing time window.
pub struct MovingAverage {
    window_millis: u64,
    samples: VecDeque<(u64, u64)>,
    sum: u64,
}

impl MovingAverage {
    pub fn new(window_millis: u64) -> Self {
        let now = chrono::Utc::now().naive_utc().timestamp_millis() as u64;
        let mut samples = VecDeque::new();
        samples.push_back((now, 0));
        Self {
            window_millis,
            samples,
            sum: 0,
        }
    }

    /// Records `value` at the current wall-clock time and returns the
    /// updated rate, e.g. `throughput.tick_now(report.records_written)`
    /// after a TaskGroup finishes draining.
    pub fn tick_now(&mut self, value: u64) -> f64 {
        let now = chrono::Utc::now().naive_utc().timestamp_millis() as u64;
        self.tick(now, value)
    }

    /// Records `value` at `timestamp_millis`, evicts samples that have
    /// aged out of the window, and returns the resulting average rate.
    pub fn tick(&mut self, timestamp_millis: u64, value: u64) -> f64 {
        self.samples.push_back((timestamp_millis, value));
        self.sum += value;
        while self.samples.len() > 2 {
            let Some((oldest_ts, oldest_val)) = self.samples.front() else {
                break;
            };
            if timestamp_millis - oldest_ts <= self.window_millis {
                break;
            }
            self.sum -= oldest_val;
            self.samples.pop_front();
        }
        self.avg()
    }

    /// The rate per second implied by the samples currently in the window.
    /// Meaningless before the first `tick`/`tick_now` call.
    pub fn avg(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let elapsed = self.samples.back().unwrap().0 - self.samples.front().unwrap().0;
        if elapsed == 0 {
            return 0.0;
        }
        (self.sum * 1000) as f64 / elapsed as f64
    }

    /// Total value accumulated within the current window.
    pub fn sum(&self) -> u64 {
        self.sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settles_near_the_steady_state_rate() {
        // 10 second window, 9 seconds spent at 100 records/sec.
        let mut meter = MovingAverage::new(10_000);
        for _ in 0..9 {
            meter.tick_now(100);
            std::thread::sleep(std::time::Duration::from_secs(1));
        }
        let avg = meter.avg();
        assert!(avg >= 99.0, "throughput settled too low: {avg}");
    }

    #[test]
    fn evicts_samples_older_than_the_window() {
        // Chosen far past `new()`'s real-clock seed sample so the seed is
        // always the first thing evicted, regardless of when the test runs.
        let base = 10_000_000_000_000u64;
        let mut meter = MovingAverage::new(1_000);
        meter.tick(base, 500);
        meter.tick(base + 500, 500);
        // 2s after the first real sample, well past the 1s window, so the
        // base sample should have aged out of `sum`.
        meter.tick(base + 2_000, 100);
        assert_eq!(meter.sum(), 600);
    }

    #[test]
    fn zero_elapsed_time_never_divides_by_zero() {
        let base = 10_000_000_000_000u64;
        let mut meter = MovingAverage::new(10_000);
        meter.tick(base, 5);
        // Two samples at the identical timestamp, once the real-clock seed
        // sample has aged out: elapsed-time is zero, not a divide-by-zero.
        let rate = meter.tick(base, 5);
        assert_eq!(rate, 0.0);
    }
}
