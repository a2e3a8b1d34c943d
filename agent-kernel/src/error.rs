//! Errors surfaced to invocation callers and to middleware construction.

use std::fmt::{self, Display, Formatter};

use agent_policy::{PolicyError, SinkError};
use agent_resilience::TimedOut;
use agent_trace::ExportError;
use thiserror::Error;

use crate::adapter::AdapterError;

/// Policy check that blocked an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyStage {
    /// Check of the request before execution.
    Input,
    /// Check of the produced output text.
    Output,
    /// Check of a tool call in the output.
    ToolCall,
}

impl Display for PolicyStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::ToolCall => "tool call",
        })
    }
}

/// Failure of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptError {
    /// The attempt exceeded its deadline and was cancelled.
    #[error(transparent)]
    TimedOut(#[from] TimedOut),
    /// The adapter reported an error.
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

impl AttemptError {
    /// Whether another attempt may follow.
    #[must_use]
    pub const fn is_retryable(&self, retry_on_timeout: bool) -> bool {
        match self {
            Self::TimedOut(_) => retry_on_timeout,
            Self::Adapter(err) => err.is_retryable(),
        }
    }
}

/// Errors returned by [`Middleware::invoke`](crate::Middleware::invoke).
///
/// Telemetry and decision-log failures never appear here; they are only
/// visible through self-reporting counters.
#[derive(Debug, Error)]
pub enum InvocationError {
    /// A policy check denied the invocation. For the input stage nothing was
    /// executed; for later stages the side effects already happened.
    #[error("policy denied {stage}: {}", reasons.join("; "))]
    PolicyDenied {
        /// Check that failed.
        stage: PolicyStage,
        /// Deny reasons of every matching rule.
        reasons: Vec<String>,
    },
    /// The only attempt allowed timed out.
    #[error(transparent)]
    TimedOut(TimedOut),
    /// Every attempt failed; `source` is the error of the last one.
    #[error("invocation failed after {attempts} attempts: {source}")]
    RetryExhausted {
        /// Attempts made.
        attempts: u32,
        /// Error of the final attempt, unmodified.
        #[source]
        source: AttemptError,
    },
    /// The adapter failed with an error that is not retried.
    #[error("invocation failed: {0}")]
    Execution(AdapterError),
}

impl InvocationError {
    /// Short label used for span tags and log fields.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::PolicyDenied { .. } => "policy_denied",
            Self::TimedOut(_) => "timed_out",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::Execution(_) => "execution",
        }
    }
}

impl From<AttemptError> for InvocationError {
    fn from(err: AttemptError) -> Self {
        match err {
            AttemptError::TimedOut(timed_out) => Self::TimedOut(timed_out),
            AttemptError::Adapter(adapter) => Self::Execution(adapter),
        }
    }
}

/// Result alias for invocations.
pub type InvocationResult<T> = Result<T, InvocationError>;

/// Errors raised while assembling a [`Middleware`](crate::Middleware).
#[derive(Debug, Error)]
pub enum BuildError {
    /// The configuration failed validation.
    #[error("invalid configuration: {0:#}")]
    Config(anyhow::Error),
    /// The policy rule table is malformed.
    #[error("invalid policy configuration: {0}")]
    Policy(#[from] PolicyError),
    /// The span exporter could not be created.
    #[error("invalid span exporter configuration: {0}")]
    Exporter(#[from] ExportError),
    /// The decision sink could not be opened.
    #[error("failed to open decision sink: {0}")]
    Sink(#[from] SinkError),
}
