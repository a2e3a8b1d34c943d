//! Core shared types for the agentwatch observability and policy middleware.

#![warn(missing_docs, clippy::pedantic)]

mod error;
mod ids;

/// Error type and result alias shared across the workspace.
pub use error::{Error, Result};
/// Identifiers correlating spans, traces, and policy decisions.
pub use ids::{DecisionId, SpanId, TraceId};
