//! Configuration management for agentwatch.
//!
//! Settings come from an optional JSON file, then `AGENTWATCH_*` environment
//! variables override individual fields. Every section has a default, so an
//! empty document is a valid configuration.

#![warn(missing_docs, clippy::pedantic)]

pub mod loader;
pub mod schema;

pub use loader::{ENV_PREFIX, apply_env_overrides, init_logging, load, load_from_path, validate};
pub use schema::{
    AgentwatchConfig, DEFAULT_OTLP_TIMEOUT_MS, DecisionLogSection, DecisionSinkConfig,
    ResilienceConfig, SpanExporterConfig, TracingConfig,
};
