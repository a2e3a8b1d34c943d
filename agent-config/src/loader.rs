//! Configuration loader implementations.

use std::num::{NonZeroU32, NonZeroUsize};
use std::path::Path;
use std::str::FromStr;

use agent_resilience::RetryPolicy;
use agent_telemetry::init_tracing;
use anyhow::{Context, Result, bail, ensure};
use tracing::debug;

use crate::schema::{
    AgentwatchConfig, DEFAULT_OTLP_TIMEOUT_MS, DecisionSinkConfig, SpanExporterConfig,
};

/// Prefix shared by every recognised environment variable.
pub const ENV_PREFIX: &str = "AGENTWATCH_";

/// Reads and validates a JSON configuration file.
///
/// # Errors
///
/// Fails when the file cannot be read, is not valid JSON for the schema, or
/// does not pass [`validate`].
pub fn load_from_path(path: impl AsRef<Path>) -> Result<AgentwatchConfig> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration file {}", path.display()))?;
    let config: AgentwatchConfig = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse configuration file {}", path.display()))?;
    validate(&config).with_context(|| format!("invalid configuration in {}", path.display()))?;
    debug!(path = %path.display(), "configuration loaded");
    Ok(config)
}

/// Builds the effective configuration: the file at `path` when given (defaults
/// otherwise), then `AGENTWATCH_*` overrides from the process environment.
///
/// # Errors
///
/// Propagates file, override, and validation errors.
pub fn load(path: Option<&Path>) -> Result<AgentwatchConfig> {
    let mut config = match path {
        Some(path) => load_from_path(path)?,
        None => AgentwatchConfig::default(),
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    validate(&config)?;
    Ok(config)
}

/// Installs the global `tracing` subscriber with the configured filter,
/// falling back to `RUST_LOG` and then `info`.
///
/// # Errors
///
/// Fails when a global subscriber is already installed.
pub fn init_logging(config: &AgentwatchConfig) -> Result<()> {
    init_tracing(config.log_filter.as_deref()).context("failed to install tracing subscriber")
}

/// Applies `AGENTWATCH_*` overrides read through `lookup`.
///
/// Recognised variables: `SERVICE_NAME`, `LOG`, `METRICS_NAMESPACE`, `HISTOGRAM_CAPACITY`,
/// `OTLP_ENDPOINT`, `DECISION_LOG_PATH`, `DECISION_LOG_CAPACITY`,
/// `TIMEOUT_MS`, `RETRY_MAX_ATTEMPTS`, and `RETRY_ON_TIMEOUT`.
///
/// # Errors
///
/// Fails when a variable is present but cannot be parsed.
pub fn apply_env_overrides<F>(config: &mut AgentwatchConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

    if let Some(name) = var("SERVICE_NAME") {
        config.service_name = name;
    }
    if let Some(filter) = var("LOG") {
        config.log_filter = Some(filter);
    }
    if let Some(namespace) = var("METRICS_NAMESPACE") {
        config.metrics_namespace = Some(namespace);
    }
    if let Some(capacity) = parse_var::<NonZeroUsize>(&var, "HISTOGRAM_CAPACITY")? {
        config.metrics = agent_telemetry::MetricsConfig::new(capacity);
    }
    if let Some(endpoint) = var("OTLP_ENDPOINT") {
        let timeout_ms = match &config.tracing.exporter {
            SpanExporterConfig::Otlp { timeout_ms, .. } => *timeout_ms,
            _ => DEFAULT_OTLP_TIMEOUT_MS,
        };
        config.tracing.exporter = SpanExporterConfig::Otlp {
            endpoint,
            timeout_ms,
        };
    }
    if let Some(path) = var("DECISION_LOG_PATH") {
        config.decision_log.sink = DecisionSinkConfig::File { path: path.into() };
    }
    if let Some(capacity) = parse_var::<NonZeroUsize>(&var, "DECISION_LOG_CAPACITY")? {
        config.decision_log.queue.capacity = capacity;
    }
    if let Some(timeout_ms) = parse_var::<u64>(&var, "TIMEOUT_MS")? {
        config.resilience.timeout_ms = timeout_ms;
    }
    if let Some(attempts) = parse_var::<NonZeroU32>(&var, "RETRY_MAX_ATTEMPTS")? {
        let retry = config.resilience.retry;
        config.resilience.retry =
            RetryPolicy::new(attempts, retry.initial_delay(), retry.backoff_factor())
                .with_jitter(retry.jitter())
                .with_max_delay(retry.max_delay());
    }
    if let Some(retry_on_timeout) = parse_var::<bool>(&var, "RETRY_ON_TIMEOUT")? {
        config.resilience.retry_on_timeout = retry_on_timeout;
    }
    Ok(())
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .with_context(|| format!("invalid value `{raw}` for {ENV_PREFIX}{name}"))
        })
        .transpose()
}

/// Checks cross-field constraints that the types alone cannot express.
///
/// # Errors
///
/// Describes the first violated constraint.
pub fn validate(config: &AgentwatchConfig) -> Result<()> {
    ensure!(
        !config.service_name.trim().is_empty(),
        "service_name cannot be empty"
    );
    if let Some(namespace) = &config.metrics_namespace {
        let mut chars = namespace.chars();
        ensure!(
            chars
                .next()
                .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_'),
            "metrics_namespace `{namespace}` is not a valid Prometheus name prefix"
        );
    }
    ensure!(config.resilience.timeout_ms > 0, "resilience.timeout_ms must be positive");
    validate_retry("resilience.retry", &config.resilience.retry)?;
    validate_retry("tracing.batch.export_retry", &config.tracing.batch.export_retry)?;

    let batch = &config.tracing.batch;
    ensure!(
        batch.max_batch_size <= batch.queue_capacity,
        "tracing.batch.max_batch_size ({}) exceeds queue_capacity ({})",
        batch.max_batch_size,
        batch.queue_capacity
    );
    ensure!(batch.max_wait_ms > 0, "tracing.batch.max_wait_ms must be positive");

    let queue = &config.decision_log.queue;
    ensure!(
        queue.batch_size <= queue.capacity,
        "decision_log.batch_size ({}) exceeds capacity ({})",
        queue.batch_size,
        queue.capacity
    );
    ensure!(queue.flush_interval_ms > 0, "decision_log.flush_interval_ms must be positive");

    if let SpanExporterConfig::Otlp { endpoint, timeout_ms } = &config.tracing.exporter {
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            bail!("tracing.exporter.endpoint must start with http:// or https://");
        }
        ensure!(*timeout_ms > 0, "tracing.exporter.timeout_ms must be positive");
    }

    for (name, band) in [
        ("success_rate", config.signals.success_rate),
        ("p95_latency_ms", config.signals.p95_latency_ms),
        ("cost_per_success_usd", config.signals.cost_per_success_usd),
        ("violation_rate", config.signals.violation_rate),
    ] {
        ensure!(
            band.healthy.is_finite() && band.warning.is_finite(),
            "signals.{name} thresholds must be finite"
        );
    }
    ensure!(
        config.signals.success_rate.healthy >= config.signals.success_rate.warning,
        "signals.success_rate.healthy must not be below warning"
    );

    config.policy.validate().context("invalid policy rule table")?;
    Ok(())
}

fn validate_retry(section: &str, retry: &RetryPolicy) -> Result<()> {
    ensure!(
        retry.backoff_factor() >= 1.0,
        "{section}.backoff_factor must be at least 1.0"
    );
    ensure!(
        (0.0..1.0).contains(&retry.jitter()),
        "{section}.jitter must be in [0.0, 1.0)"
    );
    Ok(())
}
