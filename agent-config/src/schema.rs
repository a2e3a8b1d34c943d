//! Strongly typed configuration schemas.

use std::path::PathBuf;
use std::time::Duration;

use agent_policy::{DecisionLogConfig, RuleSet};
use agent_resilience::RetryPolicy;
use agent_telemetry::{CostTracker, MetricsConfig, SignalThresholds};
use agent_trace::BatchConfig;
use serde::{Deserialize, Serialize};

/// Default per-request timeout of the OTLP exporter.
pub const DEFAULT_OTLP_TIMEOUT_MS: u64 = 10_000;

/// Complete configuration. Every section is optional in files; missing
/// sections take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentwatchConfig {
    /// Service name reported with exported spans.
    pub service_name: String,
    /// `tracing` filter directive installed at start-up, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_filter: Option<String>,
    /// Prefix of every exported Prometheus metric name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_namespace: Option<String>,
    /// Metrics collector settings.
    pub metrics: MetricsConfig,
    /// Span export settings.
    pub tracing: TracingConfig,
    /// Decision log settings.
    pub decision_log: DecisionLogSection,
    /// Timeout and retry around each invocation.
    pub resilience: ResilienceConfig,
    /// Golden-signal thresholds.
    pub signals: SignalThresholds,
    /// Per-model token pricing.
    pub pricing: CostTracker,
    /// Policy rule table.
    pub policy: RuleSet,
}

impl Default for AgentwatchConfig {
    fn default() -> Self {
        Self {
            service_name: "agentwatch".to_owned(),
            log_filter: None,
            metrics_namespace: None,
            metrics: MetricsConfig::default(),
            tracing: TracingConfig::default(),
            decision_log: DecisionLogSection::default(),
            resilience: ResilienceConfig::default(),
            signals: SignalThresholds::default(),
            pricing: CostTracker::default(),
            policy: RuleSet::default(),
        }
    }
}

/// Span exporter selection and batching.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    /// Where finished spans go.
    pub exporter: SpanExporterConfig,
    /// Batching, retry, and breaker settings.
    pub batch: BatchConfig,
}

/// Span exporter choice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SpanExporterConfig {
    /// Structured `tracing` events.
    #[default]
    Log,
    /// In-process buffer.
    Memory,
    /// OTLP/HTTP JSON collector.
    Otlp {
        /// Collector URL, e.g. `http://localhost:4318/v1/traces`.
        endpoint: String,
        /// Per-request timeout.
        #[serde(default = "default_otlp_timeout_ms")]
        timeout_ms: u64,
    },
}

fn default_otlp_timeout_ms() -> u64 {
    DEFAULT_OTLP_TIMEOUT_MS
}

/// Decision sink selection and queueing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionLogSection {
    /// Where decisions go.
    pub sink: DecisionSinkConfig,
    /// Queue, batch, and backpressure settings.
    #[serde(flatten)]
    pub queue: DecisionLogConfig,
}

/// Decision sink choice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecisionSinkConfig {
    /// Structured `tracing` events.
    #[default]
    Tracing,
    /// In-process buffer.
    Memory,
    /// JSON-lines file.
    File {
        /// Log file path; parent directories are created.
        path: PathBuf,
    },
}

/// Deadline and retry schedule applied to every invocation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Deadline of a single attempt.
    pub timeout_ms: u64,
    /// Retry schedule across attempts.
    pub retry: RetryPolicy,
    /// Whether an attempt that timed out is retried.
    pub retry_on_timeout: bool,
}

impl ResilienceConfig {
    /// Deadline of a single attempt.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            retry: RetryPolicy::default(),
            retry_on_timeout: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: AgentwatchConfig = serde_json::from_str("{}").unwrap();

        assert_eq!(config.service_name, "agentwatch");
        assert_eq!(config.metrics.histogram_capacity().get(), 1000);
        assert_eq!(config.tracing.exporter, SpanExporterConfig::Log);
        assert_eq!(config.tracing.batch.max_batch_size.get(), 500);
        assert_eq!(config.tracing.batch.max_wait_ms, 2_000);
        assert_eq!(config.decision_log.sink, DecisionSinkConfig::Tracing);
        assert_eq!(config.decision_log.queue.capacity.get(), 1024);
        assert_eq!(config.decision_log.queue.batch_size.get(), 100);
        assert_eq!(config.decision_log.queue.flush_interval_ms, 5_000);
        assert_eq!(config.resilience.timeout(), Duration::from_secs(30));
        assert_eq!(config.resilience.retry.max_attempts().get(), 3);
        assert!(config.resilience.retry_on_timeout);
        assert_eq!(config.policy.rules().len(), 1);
    }

    #[test]
    fn sections_parse_from_json() {
        let config: AgentwatchConfig = serde_json::from_str(
            r#"{
                "tracing": {
                    "exporter": { "kind": "otlp", "endpoint": "http://collector:4318/v1/traces" },
                    "batch": { "max_batch_size": 50 }
                },
                "decision_log": {
                    "sink": { "kind": "file", "path": "/var/log/decisions.jsonl" },
                    "capacity": 64
                },
                "resilience": { "timeout_ms": 500, "retry": { "max_attempts": 1 } },
                "pricing": { "gpt-4o": { "input_per_1k": 0.005, "output_per_1k": 0.015 } }
            }"#,
        )
        .unwrap();

        assert_eq!(
            config.tracing.exporter,
            SpanExporterConfig::Otlp {
                endpoint: "http://collector:4318/v1/traces".to_owned(),
                timeout_ms: DEFAULT_OTLP_TIMEOUT_MS,
            }
        );
        assert_eq!(config.tracing.batch.max_batch_size.get(), 50);
        assert_eq!(config.tracing.batch.queue_capacity.get(), 2048);
        assert_eq!(
            config.decision_log.sink,
            DecisionSinkConfig::File {
                path: PathBuf::from("/var/log/decisions.jsonl")
            }
        );
        assert_eq!(config.decision_log.queue.capacity.get(), 64);
        assert_eq!(config.resilience.timeout_ms, 500);
        assert_eq!(config.resilience.retry.max_attempts().get(), 1);
        assert!(config.pricing.pricing("gpt-4o").is_some());
    }
}
