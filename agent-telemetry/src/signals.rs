//! Golden-signal health view derived from collector state.

use serde::{Deserialize, Serialize};

use crate::metrics::{MetricsCollector, MetricsSnapshot};

/// Health classification of a single signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    /// Within the healthy band.
    Healthy,
    /// Degraded but above the critical band.
    Warning,
    /// Outside acceptable bounds.
    Critical,
}

/// Value of a signal, or the absence of data to compute it from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SignalReading {
    /// Denominator (or sample set) is empty.
    NoData,
    /// Computed value with its classification.
    Value {
        /// Signal value.
        value: f64,
        /// Classification against the configured thresholds.
        status: SignalStatus,
    },
}

impl SignalReading {
    /// Returns the computed value, if any.
    #[must_use]
    pub const fn value(self) -> Option<f64> {
        match self {
            Self::NoData => None,
            Self::Value { value, .. } => Some(value),
        }
    }

    /// Returns the classification, if a value was computed.
    #[must_use]
    pub const fn status(self) -> Option<SignalStatus> {
        match self {
            Self::NoData => None,
            Self::Value { status, .. } => Some(status),
        }
    }
}

/// Two-level threshold band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    /// Boundary of the healthy band (inclusive).
    pub healthy: f64,
    /// Boundary of the warning band (inclusive).
    pub warning: f64,
}

impl Band {
    fn classify_higher_is_better(self, value: f64) -> SignalStatus {
        if value >= self.healthy {
            SignalStatus::Healthy
        } else if value >= self.warning {
            SignalStatus::Warning
        } else {
            SignalStatus::Critical
        }
    }

    fn classify_lower_is_better(self, value: f64) -> SignalStatus {
        if value <= self.healthy {
            SignalStatus::Healthy
        } else if value <= self.warning {
            SignalStatus::Warning
        } else {
            SignalStatus::Critical
        }
    }
}

/// Fixed thresholds used to classify each golden signal.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalThresholds {
    /// Success rate in percent; higher is better.
    pub success_rate: Band,
    /// p95 latency in milliseconds; lower is better.
    pub p95_latency_ms: Band,
    /// Cost per successful task in USD; lower is better.
    pub cost_per_success_usd: Band,
    /// Policy violation rate in percent; lower is better.
    pub violation_rate: Band,
}

impl Default for SignalThresholds {
    fn default() -> Self {
        Self {
            success_rate: Band {
                healthy: 95.0,
                warning: 90.0,
            },
            p95_latency_ms: Band {
                healthy: 2000.0,
                warning: 5000.0,
            },
            cost_per_success_usd: Band {
                healthy: 0.10,
                warning: 0.50,
            },
            violation_rate: Band {
                healthy: 1.0,
                warning: 5.0,
            },
        }
    }
}

/// Metric names the signals are derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalSources {
    /// Counter of started invocations.
    pub runs: String,
    /// Counter of successful invocations.
    pub successes: String,
    /// Histogram of invocation latency in milliseconds.
    pub latency_ms: String,
    /// Counter of accumulated cost in USD.
    pub cost_usd: String,
    /// Counter of policy violations.
    pub violations: String,
}

impl Default for SignalSources {
    fn default() -> Self {
        Self {
            runs: "workflow.runs".into(),
            successes: "workflow.success".into(),
            latency_ms: "workflow.latency_ms".into(),
            cost_usd: "workflow.cost_usd".into(),
            violations: "policy.violations".into(),
        }
    }
}

/// Derived, never-cached health view.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GoldenSignalsSnapshot {
    /// `successes / runs * 100`.
    pub success_rate: SignalReading,
    /// 95th percentile of retained latency samples.
    pub p95_latency_ms: SignalReading,
    /// `total cost / successes`.
    pub cost_per_successful_task_usd: SignalReading,
    /// `violations / runs * 100`.
    pub policy_violation_rate_percent: SignalReading,
}

impl GoldenSignalsSnapshot {
    /// Worst status across all signals that have data.
    #[must_use]
    pub fn overall(&self) -> Option<SignalStatus> {
        [
            self.success_rate,
            self.p95_latency_ms,
            self.cost_per_successful_task_usd,
            self.policy_violation_rate_percent,
        ]
        .into_iter()
        .filter_map(SignalReading::status)
        .max()
    }
}

/// Read-side aggregator over [`MetricsCollector`] state.
#[derive(Debug, Clone, Default)]
pub struct GoldenSignals {
    sources: SignalSources,
    thresholds: SignalThresholds,
}

impl GoldenSignals {
    /// Creates an aggregator with custom metric sources and thresholds.
    #[must_use]
    pub fn new(sources: SignalSources, thresholds: SignalThresholds) -> Self {
        Self {
            sources,
            thresholds,
        }
    }

    /// Returns the configured thresholds.
    #[must_use]
    pub fn thresholds(&self) -> &SignalThresholds {
        &self.thresholds
    }

    /// Computes the signals from the collector's current state.
    #[must_use]
    pub fn read(&self, metrics: &MetricsCollector) -> GoldenSignalsSnapshot {
        self.compute(&metrics.snapshot())
    }

    /// Computes the signals from a previously captured snapshot.
    #[must_use]
    pub fn compute(&self, snapshot: &MetricsSnapshot) -> GoldenSignalsSnapshot {
        let runs = snapshot.counter(&self.sources.runs).unwrap_or(0.0);
        let successes = snapshot.counter(&self.sources.successes).unwrap_or(0.0);
        let cost = snapshot.counter(&self.sources.cost_usd).unwrap_or(0.0);
        let violations = snapshot.counter(&self.sources.violations).unwrap_or(0.0);

        let success_rate = ratio(successes, runs, 100.0).map_or(SignalReading::NoData, |value| {
            SignalReading::Value {
                value,
                status: self.thresholds.success_rate.classify_higher_is_better(value),
            }
        });

        let p95_latency_ms = snapshot
            .histogram(&self.sources.latency_ms)
            .and_then(|histogram| histogram.percentile(0.95))
            .map_or(SignalReading::NoData, |value| SignalReading::Value {
                value,
                status: self.thresholds.p95_latency_ms.classify_lower_is_better(value),
            });

        let cost_per_successful_task_usd =
            ratio(cost, successes, 1.0).map_or(SignalReading::NoData, |value| {
                SignalReading::Value {
                    value,
                    status: self
                        .thresholds
                        .cost_per_success_usd
                        .classify_lower_is_better(value),
                }
            });

        let policy_violation_rate_percent =
            ratio(violations, runs, 100.0).map_or(SignalReading::NoData, |value| {
                SignalReading::Value {
                    value,
                    status: self.thresholds.violation_rate.classify_lower_is_better(value),
                }
            });

        GoldenSignalsSnapshot {
            success_rate,
            p95_latency_ms,
            cost_per_successful_task_usd,
            policy_violation_rate_percent,
        }
    }
}

fn ratio(numerator: f64, denominator: f64, scale: f64) -> Option<f64> {
    (denominator > 0.0).then(|| numerator / denominator * scale)
}
