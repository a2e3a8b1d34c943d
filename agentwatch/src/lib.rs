//! In-process observability and policy middleware for agent and tool calls.
//!
//! Depend on this crate via `cargo add agentwatch`. It bundles the member
//! crates behind feature flags so downstream users can enable only the parts
//! they need. With the default features, [`Middleware`] is the entry point:
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use agentwatch::kernel::{FnInvocation, InvocationOutput, InvocationRequest, Middleware};
//! use agentwatch::trace::TraceContext;
//!
//! let middleware = Middleware::builder().build();
//! let call = FnInvocation::new(
//!     InvocationRequest::new("req-1", "planner", "plan a trip"),
//!     |_ctx| async { Ok(InvocationOutput::text("done")) },
//! );
//! middleware.invoke(&TraceContext::for_request("req-1"), &call).await?;
//! println!("{:?}", middleware.signals());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs, clippy::pedantic)]

/// Re-export shared primitives for convenience.
pub use agent_primitives as primitives;

/// Invocation lifecycle and middleware (enabled by `kernel` feature).
#[cfg(feature = "kernel")]
pub use agent_kernel as kernel;

/// Composition root, re-exported at the top level (enabled by `kernel` feature).
#[cfg(feature = "kernel")]
pub use agent_kernel::{Middleware, MiddlewareBuilder};

/// Policy evaluation and decision logging (enabled by `policy` feature).
#[cfg(feature = "policy")]
pub use agent_policy as policy;

/// Timeout, retry, and circuit breaking (enabled by `resilience` feature).
#[cfg(feature = "resilience")]
pub use agent_resilience as resilience;

/// Metrics, golden signals, and cost (enabled by `telemetry` feature).
#[cfg(feature = "telemetry")]
pub use agent_telemetry as telemetry;

/// Spans and span export (enabled by `trace` feature).
#[cfg(feature = "trace")]
pub use agent_trace as trace;

/// Configuration management (enabled by `config` feature).
#[cfg(feature = "config")]
pub use agent_config as config;
