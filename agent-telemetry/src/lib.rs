//! Metrics, golden signals, and cost accounting for agent invocations.
//!
//! A single [`MetricsCollector`] is created at process start and handed to
//! every component that records measurements. [`GoldenSignals`] derives the
//! health view from it on demand and [`render_prometheus`] encodes a snapshot
//! as OpenMetrics text through `prometheus-client`.

#![warn(missing_docs, clippy::pedantic)]

pub mod cost;
pub mod exposition;
pub mod logging;
pub mod metrics;
pub mod signals;

pub use cost::{CostTracker, ModelPricing, TokenUsage};
pub use exposition::{SnapshotCollector, prometheus_name, render_prometheus};
pub use logging::init_tracing;
pub use metrics::{
    HistogramSnapshot, MetricKind, MetricValue, MetricsCollector, MetricsConfig, MetricsError,
    MetricsResult, MetricsSnapshot,
};
pub use signals::{
    Band, GoldenSignals, GoldenSignalsSnapshot, SignalReading, SignalSources, SignalStatus,
    SignalThresholds,
};
