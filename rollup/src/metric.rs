//! Metrics of the index and the persister
//!
//! Metrics are written by the single writer of the index and read by any thread, for
//! example the thread that reports the ingestion progress. All of the atomics use
//! `Relaxed` ordering, metrics are statistics, not synchronization

use crossbeam_utils::CachePadded;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;
use std::time::Duration;

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Count(CachePadded<AtomicU64>);

impl Count {
    /// Create a new [`Count`]
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `n` to the counter
    #[inline]
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Relaxed);
    }

    /// Current value
    #[inline]
    pub fn value(&self) -> u64 {
        self.0.load(Relaxed)
    }
}

/// Measure a potentially non contiguous duration of time, in nanoseconds
#[derive(Debug, Default)]
pub struct Time(CachePadded<AtomicU64>);

impl Time {
    /// Create a new [`Time`]
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add duration to the time metric
    #[inline]
    pub fn add_duration(&self, duration: Duration) {
        self.0.fetch_add(duration.as_nanos() as _, Relaxed);
    }

    /// Get the accumulated duration
    #[inline]
    pub fn value(&self) -> Duration {
        Duration::from_nanos(self.0.load(Relaxed))
    }
}

/// Value of a single metric
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricValue {
    Count(u64),
    Time(Duration),
}

impl Display for MetricValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Count(count) => write!(f, "{}", count),
            Self::Time(time) => write!(f, "{:?}", time),
        }
    }
}

/// Snapshot of a group of metrics, created by the `MetricsSetBuilder` derive
#[derive(Debug, Clone)]
pub struct MetricsSet {
    /// Name of the struct that owns the metrics
    pub name: &'static str,
    /// Metrics, ordered by name
    pub metrics: BTreeMap<&'static str, MetricValue>,
}

impl MetricsSet {
    /// Get the count metric with given name
    pub fn count(&self, name: &str) -> Option<u64> {
        match self.metrics.get(name) {
            Some(MetricValue::Count(count)) => Some(*count),
            _ => None,
        }
    }
}

impl Display for MetricsSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: [", self.name)?;
        let mut iter = self.metrics.iter();
        if let Some((name, value)) = iter.next() {
            write!(f, "{}={}", name, value)?;
        }
        iter.try_for_each(|(name, value)| write!(f, ", {}={}", name, value))?;
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollup_procedural_macro::MetricsSetBuilder;

    #[derive(Debug, Default, MetricsSetBuilder)]
    struct MockMetrics {
        rows: Count,
        invalid_rows: Count,
    }

    #[test]
    fn test_derive_metrics_set() {
        let metrics = MockMetrics::default();
        metrics.rows.add(3);
        metrics.rows.add(4);
        metrics.invalid_rows.add(1);
        let set = metrics.metrics_set();
        assert_eq!(set.count("rows"), Some(7));
        expect_test::expect!["MockMetrics: [invalid_rows=1, rows=7]"].assert_eq(&set.to_string());
    }
}
