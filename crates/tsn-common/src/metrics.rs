//! Wake-up latency statistics for role threads.
//!
//! Each role records how far past its absolute deadline it actually woke.
//! Samples go into a pre-allocated ring buffer so recording never allocates.

use std::time::Duration;

/// Wake-up latency metrics with a ring buffer for percentile queries.
#[derive(Debug)]
pub struct WakeupMetrics {
    /// Ring buffer of latencies in nanoseconds.
    samples: Box<[u64]>,
    /// Current write position in the ring buffer.
    write_pos: usize,
    /// Number of samples collected (saturates at buffer size).
    sample_count: usize,
    /// Total wake-ups recorded.
    total_wakeups: u64,
    /// Minimum observed latency in nanoseconds.
    min_ns: u64,
    /// Maximum observed latency in nanoseconds.
    max_ns: u64,
    /// Sum of all latencies for mean calculation.
    sum_ns: u64,
    /// Wake-ups that landed a full period or more after their deadline.
    missed_count: u64,
    /// Cycle period in nanoseconds.
    period_ns: u64,
}

impl WakeupMetrics {
    /// Create a collector retaining `histogram_size` samples.
    ///
    /// A wake-up later than `period` counts as a missed cycle.
    #[must_use]
    pub fn new(histogram_size: usize, period: Duration) -> Self {
        let size = histogram_size.max(1);
        Self {
            samples: vec![0u64; size].into_boxed_slice(),
            write_pos: 0,
            sample_count: 0,
            total_wakeups: 0,
            min_ns: u64::MAX,
            max_ns: 0,
            sum_ns: 0,
            missed_count: 0,
            period_ns: period.as_nanos() as u64,
        }
    }

    /// Record one wake-up, `latency_ns` after its deadline.
    ///
    /// Negative latencies (clock read before the deadline) are recorded as 0.
    #[inline]
    pub fn record_ns(&mut self, latency_ns: i64) {
        let ns = u64::try_from(latency_ns).unwrap_or(0);

        self.samples[self.write_pos] = ns;
        self.write_pos = (self.write_pos + 1) % self.samples.len();
        self.sample_count = self.sample_count.saturating_add(1).min(self.samples.len());

        self.total_wakeups += 1;
        self.min_ns = self.min_ns.min(ns);
        self.max_ns = self.max_ns.max(ns);
        self.sum_ns = self.sum_ns.wrapping_add(ns);

        if ns >= self.period_ns {
            self.missed_count += 1;
        }
    }

    /// Total wake-ups recorded.
    #[must_use]
    pub fn total_wakeups(&self) -> u64 {
        self.total_wakeups
    }

    /// Wake-ups late by a full period or more.
    #[must_use]
    pub fn missed_count(&self) -> u64 {
        self.missed_count
    }

    /// Compute a percentile (0.0 to 100.0) over the retained samples.
    ///
    /// Returns `None` without samples or for an out-of-range percentile.
    #[must_use]
    pub fn percentile(&self, percentile: f64) -> Option<Duration> {
        if self.sample_count == 0 || !(0.0..=100.0).contains(&percentile) {
            return None;
        }

        let mut sorted: Vec<u64> = self.samples[..self.sample_count].to_vec();
        sorted.sort_unstable();

        let idx = ((percentile / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        Some(Duration::from_nanos(sorted[idx.min(sorted.len() - 1)]))
    }

    /// Get a snapshot of current metrics.
    #[must_use]
    pub fn snapshot(&self) -> WakeupSnapshot {
        let recorded = self.total_wakeups > 0;
        WakeupSnapshot {
            total_wakeups: self.total_wakeups,
            min_ns: recorded.then_some(self.min_ns),
            max_ns: recorded.then_some(self.max_ns),
            mean_ns: recorded.then(|| self.sum_ns / self.total_wakeups),
            p99_ns: self.percentile(99.0).map(|d| d.as_nanos() as u64),
            missed_count: self.missed_count,
        }
    }
}

/// Immutable summary of wake-up latency for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct WakeupSnapshot {
    /// Total wake-ups recorded.
    pub total_wakeups: u64,
    /// Minimum latency in nanoseconds.
    pub min_ns: Option<u64>,
    /// Maximum latency in nanoseconds.
    pub max_ns: Option<u64>,
    /// Mean latency in nanoseconds.
    pub mean_ns: Option<u64>,
    /// 99th percentile of the retained samples.
    pub p99_ns: Option<u64>,
    /// Wake-ups late by a full period or more.
    pub missed_count: u64,
}

impl WakeupSnapshot {
    /// Get jitter (max - min) in nanoseconds.
    #[must_use]
    pub fn jitter_ns(&self) -> Option<u64> {
        match (self.min_ns, self.max_ns) {
            (Some(min), Some(max)) => Some(max - min),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_recording() {
        let mut metrics = WakeupMetrics::new(100, Duration::from_micros(250));

        metrics.record_ns(5_000);
        metrics.record_ns(12_000);
        metrics.record_ns(8_000);

        let snap = metrics.snapshot();
        assert_eq!(snap.total_wakeups, 3);
        assert_eq!(snap.min_ns, Some(5_000));
        assert_eq!(snap.max_ns, Some(12_000));
        assert_eq!(snap.mean_ns, Some(8_333));
        assert_eq!(snap.jitter_ns(), Some(7_000));
    }

    #[test]
    fn test_negative_latency_clamps_to_zero() {
        let mut metrics = WakeupMetrics::new(10, Duration::from_micros(250));
        metrics.record_ns(-40);
        assert_eq!(metrics.snapshot().min_ns, Some(0));
    }

    #[test]
    fn test_missed_cycles() {
        let mut metrics = WakeupMetrics::new(10, Duration::from_micros(250));
        metrics.record_ns(249_999);
        metrics.record_ns(250_000);
        metrics.record_ns(900_000);
        assert_eq!(metrics.missed_count(), 2);
    }

    #[test]
    fn test_ring_buffer_wrapping() {
        let mut metrics = WakeupMetrics::new(10, Duration::from_millis(1));
        for i in 0..25 {
            metrics.record_ns(i * 1000);
        }
        assert_eq!(metrics.total_wakeups(), 25);
        // Only the last 10 samples (15..25 µs) are retained.
        assert_eq!(metrics.percentile(0.0), Some(Duration::from_micros(15)));
    }

    #[test]
    fn test_percentile_validation() {
        let mut metrics = WakeupMetrics::new(100, Duration::from_millis(1));
        assert!(metrics.percentile(50.0).is_none());

        for i in 1..=100 {
            metrics.record_ns(i * 1000);
        }
        let p50 = metrics.percentile(50.0).unwrap();
        assert!(p50.as_micros() >= 49 && p50.as_micros() <= 51);

        assert!(metrics.percentile(-1.0).is_none());
        assert!(metrics.percentile(101.0).is_none());
        assert!(metrics.percentile(f64::NAN).is_none());
    }

    #[test]
    fn test_empty_snapshot() {
        let metrics = WakeupMetrics::new(4, Duration::from_millis(1));
        let snap = metrics.snapshot();
        assert_eq!(snap, WakeupSnapshot::default());
        assert!(snap.jitter_ns().is_none());
    }
}
