use serde::{Deserialize, Serialize};

/// A fixed log-scale histogram of per-call execution times, in the same time
/// unit as [`crate::CallRecord`]'s timing fields (collector ticks).
///
/// Bucket `i` (for `i < BUCKET_COUNT - 1`) covers `[2^i, 2^(i+1))` ticks; the
/// last bucket is an overflow bucket for everything at or above
/// `2^(BUCKET_COUNT - 2)`. This mirrors the log-scale bucketing the original
/// `micro-profiler` frontend uses to draw call-duration distributions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Histogram {
    buckets: Vec<u64>,
}

const BUCKET_COUNT: usize = 64;

impl Default for Histogram {
    fn default() -> Self {
        Histogram {
            buckets: vec![0; BUCKET_COUNT],
        }
    }
}

impl Histogram {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket_for(duration_ticks: u64) -> usize {
        if duration_ticks == 0 {
            0
        } else {
            (63 - duration_ticks.leading_zeros() as usize).min(BUCKET_COUNT - 1)
        }
    }

    pub fn record(&mut self, duration_ticks: u64) {
        let bucket = Self::bucket_for(duration_ticks);
        self.buckets[bucket] += 1;
    }

    /// Rebuilds a histogram from already-bucketed counts, as received over
    /// the wire. The caller is responsible for `buckets.len() == BUCKET_COUNT`;
    /// shorter vectors are zero-padded so a stale peer with fewer buckets
    /// still decodes.
    pub fn from_raw_buckets(mut buckets: Vec<u64>) -> Self {
        buckets.resize(BUCKET_COUNT, 0);
        Histogram { buckets }
    }

    pub fn merge(&mut self, other: &Histogram) {
        for (a, b) in self.buckets.iter_mut().zip(other.buckets.iter()) {
            *a += b;
        }
    }

    pub fn buckets(&self) -> &[u64] {
        &self.buckets
    }

    pub fn total_samples(&self) -> u64 {
        self.buckets.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_are_log_scale() {
        assert_eq!(Histogram::bucket_for(0), 0);
        assert_eq!(Histogram::bucket_for(1), 0);
        assert_eq!(Histogram::bucket_for(2), 1);
        assert_eq!(Histogram::bucket_for(3), 1);
        assert_eq!(Histogram::bucket_for(4), 2);
    }

    #[test]
    fn merge_sums_counts() {
        let mut a = Histogram::new();
        a.record(5);
        let mut b = Histogram::new();
        b.record(5);
        b.record(100);
        a.merge(&b);
        assert_eq!(a.total_samples(), 3);
    }
}
