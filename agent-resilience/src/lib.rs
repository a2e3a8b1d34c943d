//! Resilience primitives composed around agent and tool calls.
//!
//! [`with_timeout`] bounds a single attempt, [`retry_with_backoff`] re-runs
//! attempts that fail with retryable errors, and [`CircuitBreaker`] sheds load
//! from a dependency that keeps failing. Retryable versus fatal is decided by
//! a caller-supplied predicate over typed errors.

#![warn(missing_docs, clippy::pedantic)]

pub mod breaker;
pub mod retry;
pub mod timeout;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use retry::{RetryError, RetryPolicy, RetryPolicyError, retry_with_backoff};
pub use timeout::{TimedOut, with_timeout};
