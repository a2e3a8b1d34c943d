//! Thread-safe counters, gauges, and bounded-sample histograms.
//!
//! Metrics are registered lazily on first use and keyed by a dotted name such
//! as `workflow.latency_ms`. The registry is sharded and each metric carries its
//! own lock, so writers touching unrelated metrics never contend on a shared
//! guard.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::{self, Display, Formatter};
use std::num::NonZeroUsize;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Longest metric name accepted by the collector.
pub const MAX_METRIC_NAME_LEN: usize = 200;

/// Errors raised by [`MetricsCollector`] operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MetricsError {
    /// Metric name is empty, too long, or contains an invalid segment.
    #[error("invalid metric name `{name}`")]
    InvalidName {
        /// The rejected name.
        name: String,
    },
    /// Counter deltas must be finite and non-negative.
    #[error("counter `{name}` rejects delta {delta}: must be finite and non-negative")]
    InvalidDelta {
        /// Counter that received the delta.
        name: String,
        /// The rejected delta.
        delta: f64,
    },
    /// The name is already registered under a different kind.
    #[error("metric `{name}` is a {existing}, not a {requested}")]
    KindMismatch {
        /// Metric name.
        name: String,
        /// Kind the metric was first registered with.
        existing: MetricKind,
        /// Kind requested by the failing call.
        requested: MetricKind,
    },
    /// No histogram exists under the name, or it holds no samples.
    #[error("histogram `{name}` not found or empty")]
    NotFound {
        /// Metric name.
        name: String,
    },
    /// Percentile outside of `[0.0, 1.0]`.
    #[error("percentile {0} outside of [0.0, 1.0]")]
    InvalidPercentile(f64),
}

/// Result alias for metrics operations.
pub type MetricsResult<T> = Result<T, MetricsError>;

/// The three metric shapes supported by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Monotonic, non-negative accumulator.
    Counter,
    /// Last-write-wins value.
    Gauge,
    /// Bounded ring of observed samples.
    Histogram,
}

impl Display for MetricKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
        })
    }
}

/// Collector configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    histogram_capacity: NonZeroUsize,
}

impl MetricsConfig {
    /// Creates a configuration retaining at most `histogram_capacity` samples
    /// per histogram.
    #[must_use]
    pub const fn new(histogram_capacity: NonZeroUsize) -> Self {
        Self { histogram_capacity }
    }

    /// Returns the per-histogram sample bound.
    #[must_use]
    pub const fn histogram_capacity(self) -> NonZeroUsize {
        self.histogram_capacity
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(1000).expect("non-zero"))
    }
}

#[derive(Debug)]
struct Samples {
    values: VecDeque<f64>,
    capacity: usize,
    observed: u64,
}

impl Samples {
    fn new(capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
            observed: 0,
        }
    }

    fn push(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
        self.observed = self.observed.saturating_add(1);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            samples: self.values.iter().copied().collect(),
            observed: self.observed,
        }
    }
}

#[derive(Debug)]
enum Cell {
    Counter(Mutex<f64>),
    Gauge(Mutex<f64>),
    Histogram(Mutex<Samples>),
}

impl Cell {
    fn new(kind: MetricKind, histogram_capacity: usize) -> Self {
        match kind {
            MetricKind::Counter => Self::Counter(Mutex::new(0.0)),
            MetricKind::Gauge => Self::Gauge(Mutex::new(0.0)),
            MetricKind::Histogram => Self::Histogram(Mutex::new(Samples::new(histogram_capacity))),
        }
    }

    fn kind(&self) -> MetricKind {
        match self {
            Self::Counter(_) => MetricKind::Counter,
            Self::Gauge(_) => MetricKind::Gauge,
            Self::Histogram(_) => MetricKind::Histogram,
        }
    }

    fn value(&self) -> MetricValue {
        match self {
            Self::Counter(value) => MetricValue::Counter(*value.lock()),
            Self::Gauge(value) => MetricValue::Gauge(*value.lock()),
            Self::Histogram(samples) => MetricValue::Histogram(samples.lock().snapshot()),
        }
    }
}

/// Thread-safe metrics registry.
///
/// Construct one per process and share it by `Arc`; there is no global
/// instance.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    config: MetricsConfig,
    metrics: DashMap<String, Arc<Cell>>,
}

impl MetricsCollector {
    /// Creates an empty collector.
    #[must_use]
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            metrics: DashMap::new(),
        }
    }

    /// Returns the collector configuration.
    #[must_use]
    pub const fn config(&self) -> MetricsConfig {
        self.config
    }

    /// Adds `delta` to the counter, creating it at zero on first use.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::InvalidDelta`] for negative or non-finite deltas
    /// (the counter is left untouched), [`MetricsError::InvalidName`] for a
    /// malformed name, and [`MetricsError::KindMismatch`] when the name belongs
    /// to another metric kind.
    pub fn increment_counter(&self, name: &str, delta: f64) -> MetricsResult<()> {
        if delta.is_nan() || delta.is_infinite() || delta < 0.0 {
            return Err(MetricsError::InvalidDelta {
                name: name.to_owned(),
                delta,
            });
        }

        if let Cell::Counter(value) = self.cell(name, MetricKind::Counter)?.as_ref() {
            *value.lock() += delta;
        }
        Ok(())
    }

    /// Increments the counter by one.
    ///
    /// # Errors
    ///
    /// See [`increment_counter`](Self::increment_counter).
    pub fn increment(&self, name: &str) -> MetricsResult<()> {
        self.increment_counter(name, 1.0)
    }

    /// Overwrites the gauge value.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::InvalidName`] or [`MetricsError::KindMismatch`].
    pub fn set_gauge(&self, name: &str, value: f64) -> MetricsResult<()> {
        if let Cell::Gauge(gauge) = self.cell(name, MetricKind::Gauge)?.as_ref() {
            *gauge.lock() = value;
        }
        Ok(())
    }

    /// Records one observation, evicting the oldest sample when the histogram
    /// is full.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::InvalidName`] or [`MetricsError::KindMismatch`].
    pub fn record_histogram(&self, name: &str, value: f64) -> MetricsResult<()> {
        if let Cell::Histogram(samples) = self.cell(name, MetricKind::Histogram)?.as_ref() {
            samples.lock().push(value);
        }
        Ok(())
    }

    /// Computes the nearest-rank percentile `p` (in `[0.0, 1.0]`) over the
    /// samples currently retained by the histogram.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::NotFound`] for unknown or empty histograms,
    /// [`MetricsError::KindMismatch`] when the name is not a histogram, and
    /// [`MetricsError::InvalidPercentile`] for `p` outside `[0.0, 1.0]`.
    pub fn percentile(&self, name: &str, p: f64) -> MetricsResult<f64> {
        check_percentile(p)?;
        let cell = self
            .metrics
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| MetricsError::NotFound {
                name: name.to_owned(),
            })?;

        let Cell::Histogram(samples) = cell.as_ref() else {
            return Err(MetricsError::KindMismatch {
                name: name.to_owned(),
                existing: cell.kind(),
                requested: MetricKind::Histogram,
            });
        };

        let snapshot = samples.lock().snapshot();
        snapshot.percentile(p).ok_or_else(|| MetricsError::NotFound {
            name: name.to_owned(),
        })
    }

    /// Returns the current value of a counter, if registered.
    #[must_use]
    pub fn counter(&self, name: &str) -> Option<f64> {
        match self.read(name)? {
            MetricValue::Counter(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the current value of a gauge, if registered.
    #[must_use]
    pub fn gauge(&self, name: &str) -> Option<f64> {
        match self.read(name)? {
            MetricValue::Gauge(value) => Some(value),
            _ => None,
        }
    }

    /// Returns a copy of a histogram's retained samples, if registered.
    #[must_use]
    pub fn histogram(&self, name: &str) -> Option<HistogramSnapshot> {
        match self.read(name)? {
            MetricValue::Histogram(snapshot) => Some(snapshot),
            _ => None,
        }
    }

    /// Copies every metric into an immutable, name-ordered snapshot.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let cells: Vec<(String, Arc<Cell>)> = self
            .metrics
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        MetricsSnapshot {
            metrics: cells
                .into_iter()
                .map(|(name, cell)| (name, cell.value()))
                .collect(),
        }
    }

    fn read(&self, name: &str) -> Option<MetricValue> {
        let cell = self.metrics.get(name).map(|entry| Arc::clone(entry.value()))?;
        Some(cell.value())
    }

    fn cell(&self, name: &str, kind: MetricKind) -> MetricsResult<Arc<Cell>> {
        let existing = self.metrics.get(name).map(|entry| Arc::clone(entry.value()));
        let cell = if let Some(cell) = existing {
            cell
        } else {
            validate_name(name)?;
            let capacity = self.config.histogram_capacity().get();
            let entry = self.metrics.entry(name.to_owned()).or_insert_with(|| {
                debug!(metric = name, %kind, "registering metric");
                Arc::new(Cell::new(kind, capacity))
            });
            Arc::clone(entry.value())
        };

        if cell.kind() != kind {
            return Err(MetricsError::KindMismatch {
                name: name.to_owned(),
                existing: cell.kind(),
                requested: kind,
            });
        }
        Ok(cell)
    }
}

fn validate_name(name: &str) -> MetricsResult<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_METRIC_NAME_LEN
        && name.split('.').all(|segment| {
            let mut chars = segment.chars();
            matches!(chars.next(), Some(first) if first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        });

    if valid {
        Ok(())
    } else {
        Err(MetricsError::InvalidName {
            name: name.to_owned(),
        })
    }
}

fn check_percentile(p: f64) -> MetricsResult<()> {
    if (0.0..=1.0).contains(&p) {
        Ok(())
    } else {
        Err(MetricsError::InvalidPercentile(p))
    }
}

/// Point-in-time value of a single metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MetricValue {
    /// Accumulated counter total.
    Counter(f64),
    /// Last gauge value.
    Gauge(f64),
    /// Retained histogram samples.
    Histogram(HistogramSnapshot),
}

impl MetricValue {
    /// Returns the kind of the captured metric.
    #[must_use]
    pub fn kind(&self) -> MetricKind {
        match self {
            Self::Counter(_) => MetricKind::Counter,
            Self::Gauge(_) => MetricKind::Gauge,
            Self::Histogram(_) => MetricKind::Histogram,
        }
    }
}

/// Copy of the samples a histogram retained at snapshot time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSnapshot {
    samples: Vec<f64>,
    observed: u64,
}

impl HistogramSnapshot {
    /// Retained samples, oldest first.
    #[must_use]
    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    /// Number of retained samples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns `true` when no samples are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Total observations ever recorded, including evicted ones.
    #[must_use]
    pub const fn observed(&self) -> u64 {
        self.observed
    }

    /// Sum of the retained samples.
    #[must_use]
    pub fn sum(&self) -> f64 {
        self.samples.iter().sum()
    }

    /// Nearest-rank percentile over the retained samples; `None` when empty or
    /// when `p` lies outside `[0.0, 1.0]`.
    #[must_use]
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.samples.is_empty() || check_percentile(p).is_err() {
            return None;
        }

        let mut sorted = self.samples.clone();
        sorted.sort_by(f64::total_cmp);

        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let rank = (p * sorted.len() as f64).ceil() as usize;
        let index = rank.clamp(1, sorted.len()) - 1;
        Some(sorted[index])
    }
}

/// Immutable, name-ordered copy of every metric in a collector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricsSnapshot {
    metrics: BTreeMap<String, MetricValue>,
}

impl MetricsSnapshot {
    /// Returns the captured value for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&MetricValue> {
        self.metrics.get(name)
    }

    /// Returns the counter value for `name`, if it is a counter.
    #[must_use]
    pub fn counter(&self, name: &str) -> Option<f64> {
        match self.metrics.get(name)? {
            MetricValue::Counter(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the histogram captured under `name`, if it is a histogram.
    #[must_use]
    pub fn histogram(&self, name: &str) -> Option<&HistogramSnapshot> {
        match self.metrics.get(name)? {
            MetricValue::Histogram(snapshot) => Some(snapshot),
            _ => None,
        }
    }

    /// Iterates over metrics in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetricValue)> {
        self.metrics.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Number of captured metrics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    /// Returns `true` when no metrics were captured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector_with_capacity(capacity: usize) -> MetricsCollector {
        MetricsCollector::new(MetricsConfig::new(NonZeroUsize::new(capacity).unwrap()))
    }

    #[test]
    fn counter_accumulates_deltas_lazily() {
        let metrics = MetricsCollector::default();
        assert_eq!(metrics.counter("workflow.runs"), None);

        for delta in [1.0, 2.5, 0.0, 4.0] {
            metrics.increment_counter("workflow.runs", delta).unwrap();
        }
        assert_eq!(metrics.counter("workflow.runs"), Some(7.5));
    }

    #[test]
    fn negative_delta_is_rejected_and_not_applied() {
        let metrics = MetricsCollector::default();
        metrics.increment_counter("workflow.runs", 3.0).unwrap();

        let err = metrics.increment_counter("workflow.runs", -1.0).unwrap_err();
        assert!(matches!(err, MetricsError::InvalidDelta { .. }));
        assert!(metrics.increment_counter("workflow.runs", f64::NAN).is_err());
        assert_eq!(metrics.counter("workflow.runs"), Some(3.0));
    }

    #[test]
    fn rejected_first_use_does_not_register_the_counter() {
        let metrics = MetricsCollector::default();
        assert!(metrics.increment_counter("fresh.counter", -5.0).is_err());
        assert!(metrics.snapshot().get("fresh.counter").is_none());
    }

    #[test]
    fn reusing_a_name_with_another_kind_fails() {
        let metrics = MetricsCollector::default();
        metrics.increment("tool.calls").unwrap();

        let err = metrics.set_gauge("tool.calls", 1.0).unwrap_err();
        assert_eq!(
            err,
            MetricsError::KindMismatch {
                name: "tool.calls".into(),
                existing: MetricKind::Counter,
                requested: MetricKind::Gauge,
            }
        );
        assert!(matches!(
            metrics.percentile("tool.calls", 0.5),
            Err(MetricsError::KindMismatch { .. })
        ));
    }

    #[test]
    fn malformed_names_are_rejected() {
        let metrics = MetricsCollector::default();
        for name in ["", "workflow..runs", ".runs", "9lives", "has space", "emoji.✓"] {
            assert!(
                matches!(metrics.increment(name), Err(MetricsError::InvalidName { .. })),
                "{name:?} should be rejected"
            );
        }
        metrics.increment("agent.web-search.calls").unwrap();
        metrics.increment("trace_export_failures").unwrap();
    }

    #[test]
    fn gauge_is_last_write_wins() {
        let metrics = MetricsCollector::default();
        metrics.set_gauge("queue.depth", 10.0).unwrap();
        metrics.set_gauge("queue.depth", 3.0).unwrap();
        assert_eq!(metrics.gauge("queue.depth"), Some(3.0));
    }

    #[test]
    fn histogram_keeps_only_most_recent_samples() {
        let metrics = collector_with_capacity(1000);
        for value in 1..=1500 {
            metrics
                .record_histogram("workflow.latency_ms", f64::from(value))
                .unwrap();
        }

        let snapshot = metrics.histogram("workflow.latency_ms").unwrap();
        assert_eq!(snapshot.len(), 1000);
        assert_eq!(snapshot.observed(), 1500);
        assert_eq!(snapshot.samples()[0], 501.0);
        assert_eq!(metrics.percentile("workflow.latency_ms", 0.0).unwrap(), 501.0);
        assert_eq!(metrics.percentile("workflow.latency_ms", 1.0).unwrap(), 1500.0);
    }

    #[test]
    fn percentile_uses_nearest_rank() {
        let metrics = MetricsCollector::default();
        for value in (1..=100).rev() {
            metrics.record_histogram("latency", f64::from(value)).unwrap();
        }

        assert_eq!(metrics.percentile("latency", 0.5).unwrap(), 50.0);
        assert_eq!(metrics.percentile("latency", 0.95).unwrap(), 95.0);
        assert_eq!(metrics.percentile("latency", 0.99).unwrap(), 99.0);
    }

    #[test]
    fn percentile_errors_are_explicit() {
        let metrics = MetricsCollector::default();
        assert!(matches!(
            metrics.percentile("missing", 0.5),
            Err(MetricsError::NotFound { .. })
        ));
        metrics.record_histogram("latency", 1.0).unwrap();
        assert_eq!(
            metrics.percentile("latency", 1.5),
            Err(MetricsError::InvalidPercentile(1.5))
        );
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let metrics = MetricsCollector::default();
        std::thread::scope(|scope| {
            for worker in 0..8 {
                let metrics = &metrics;
                scope.spawn(move || {
                    for _ in 0..1000 {
                        metrics.increment("shared.counter").unwrap();
                        metrics
                            .increment(&format!("worker.w{worker}.counter"))
                            .unwrap();
                    }
                });
            }
        });

        assert_eq!(metrics.counter("shared.counter"), Some(8000.0));
        assert_eq!(metrics.counter("worker.w3.counter"), Some(1000.0));
    }

    #[test]
    fn snapshot_is_detached_from_later_writes() {
        let metrics = MetricsCollector::default();
        metrics.increment("workflow.runs").unwrap();
        let snapshot = metrics.snapshot();
        metrics.increment("workflow.runs").unwrap();

        assert_eq!(snapshot.counter("workflow.runs"), Some(1.0));
        assert_eq!(metrics.counter("workflow.runs"), Some(2.0));
    }
}
