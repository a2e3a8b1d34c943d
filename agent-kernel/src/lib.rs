//! Invocation lifecycle and middleware composition for agentwatch.
//!
//! Framework integrations implement [`Invocation`]; the [`Middleware`] runs
//! each one through input policy, timed and retried execution, output and
//! tool-call policy, and records spans, metrics, cost, and decisions along
//! the way.

#![warn(missing_docs, clippy::pedantic)]

mod adapter;
mod approval;
mod error;
mod lifecycle;
mod middleware;

pub use adapter::{AdapterError, FnInvocation, Invocation, InvocationOutput, InvocationRequest};
pub use approval::{ApprovalHandler, ApprovalVerdict, AutoApprove};
pub use error::{AttemptError, BuildError, InvocationError, InvocationResult, PolicyStage};
pub use lifecycle::{
    InvocationEvent, InvocationState, Lifecycle, LifecycleError, LifecycleResult,
};
pub use middleware::{
    APPROVALS_METRIC, EVALUATIONS_METRIC, FAILURES_METRIC, LATENCY_METRIC, Middleware,
    MiddlewareBuilder, RUNS_METRIC, SUCCESS_METRIC, ShutdownReport, VIOLATIONS_METRIC,
};
