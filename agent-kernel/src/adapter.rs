//! Contract every agent or tool framework integration implements.

use std::fmt;
use std::future::Future;

use agent_policy::ToolCall;
use agent_telemetry::TokenUsage;
use agent_trace::TraceContext;
use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

/// Identifying data of one unit of agent work.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationRequest {
    request_id: String,
    agent_name: String,
    tool_name: Option<String>,
    input_text: String,
    context: Map<String, Value>,
}

impl InvocationRequest {
    /// Creates a request without a tool.
    #[must_use]
    pub fn new(
        request_id: impl Into<String>,
        agent_name: impl Into<String>,
        input_text: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            agent_name: agent_name.into(),
            tool_name: None,
            input_text: input_text.into(),
            context: Map::new(),
        }
    }

    /// Names the tool this invocation drives.
    #[must_use]
    pub fn with_tool(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    /// Adds a context entry visible to policy rules.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Correlation id shared by spans and decisions of this invocation.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Name of the invoking agent.
    #[must_use]
    pub fn agent_name(&self) -> &str {
        &self.agent_name
    }

    /// Tool driven by this invocation, if any.
    #[must_use]
    pub fn tool_name(&self) -> Option<&str> {
        self.tool_name.as_deref()
    }

    /// Text handed to the agent.
    #[must_use]
    pub fn input_text(&self) -> &str {
        &self.input_text
    }

    /// Additional context entries.
    #[must_use]
    pub fn context(&self) -> &Map<String, Value> {
        &self.context
    }
}

/// What a successful execution produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvocationOutput {
    /// Text returned by the agent.
    pub output_text: String,
    /// Tool calls the agent requested or performed.
    pub tool_calls: Vec<ToolCall>,
    /// Token usage of the underlying model call.
    pub usage: Option<TokenUsage>,
    /// Cost reported by the provider; overrides the pricing table.
    pub cost_usd: Option<f64>,
}

impl InvocationOutput {
    /// Output carrying only text.
    #[must_use]
    pub fn text(output_text: impl Into<String>) -> Self {
        Self {
            output_text: output_text.into(),
            ..Self::default()
        }
    }

    /// Appends a tool call.
    #[must_use]
    pub fn with_tool_call(mut self, call: ToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }

    /// Attaches token usage.
    #[must_use]
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Attaches an explicit cost in USD.
    #[must_use]
    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = Some(cost_usd);
        self
    }
}

/// Failure reported by an adapter, classified for the retry loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct AdapterError {
    message: String,
    retryable: bool,
}

impl AdapterError {
    /// A transient failure worth another attempt.
    #[must_use]
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that another attempt cannot fix.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether the retry loop may try again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// One unit of agent or tool work driven through the middleware.
///
/// `execute` may run several times when retries are enabled, and its future
/// is dropped when an attempt times out, so it must tolerate cancellation at
/// any await point.
#[async_trait]
pub trait Invocation: Send + Sync {
    /// Identifying data of this invocation.
    fn request(&self) -> &InvocationRequest;

    /// Performs the work. `ctx` carries the attempt span so nested
    /// invocations are parented under it.
    async fn execute(&self, ctx: &TraceContext) -> Result<InvocationOutput, AdapterError>;
}

/// Adapts a request and an async closure into an [`Invocation`].
pub struct FnInvocation<F> {
    request: InvocationRequest,
    execute: F,
}

impl<F> FnInvocation<F> {
    /// Wraps `execute`, which is called once per attempt with the attempt's
    /// trace context.
    #[must_use]
    pub fn new<Fut>(request: InvocationRequest, execute: F) -> Self
    where
        F: Fn(TraceContext) -> Fut + Send + Sync,
        Fut: Future<Output = Result<InvocationOutput, AdapterError>> + Send + 'static,
    {
        Self { request, execute }
    }
}

impl<F> fmt::Debug for FnInvocation<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnInvocation")
            .field("request", &self.request)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> Invocation for FnInvocation<F>
where
    F: Fn(TraceContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<InvocationOutput, AdapterError>> + Send + 'static,
{
    fn request(&self) -> &InvocationRequest {
        &self.request
    }

    async fn execute(&self, ctx: &TraceContext) -> Result<InvocationOutput, AdapterError> {
        (self.execute)(ctx.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closure_invocation_runs_per_call() {
        let invocation = FnInvocation::new(
            InvocationRequest::new("req-1", "planner", "plan a trip").with_tool("search"),
            |ctx: TraceContext| async move {
                Ok(InvocationOutput::text(format!(
                    "request {}",
                    ctx.request_id().unwrap_or("none")
                )))
            },
        );

        assert_eq!(invocation.request().tool_name(), Some("search"));
        let output = invocation
            .execute(&TraceContext::for_request("req-1"))
            .await
            .unwrap();
        assert_eq!(output.output_text, "request req-1");
    }

    #[test]
    fn adapter_errors_carry_classification() {
        assert!(AdapterError::retryable("rate limited").is_retryable());
        let fatal = AdapterError::fatal("bad credentials");
        assert!(!fatal.is_retryable());
        assert_eq!(fatal.to_string(), "bad credentials");
    }
}
