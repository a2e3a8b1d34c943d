//! Request-scoped propagation of the active span.

use agent_primitives::{SpanId, TraceId};
use serde::{Deserialize, Serialize};

/// Identity of one span: the trace it belongs to and its own id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanContext {
    trace_id: TraceId,
    span_id: SpanId,
}

impl SpanContext {
    /// Creates a span context.
    #[must_use]
    pub const fn new(trace_id: TraceId, span_id: SpanId) -> Self {
        Self { trace_id, span_id }
    }

    /// Trace shared by the whole workflow invocation.
    #[must_use]
    pub const fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// Id of this span.
    #[must_use]
    pub const fn span_id(&self) -> SpanId {
        self.span_id
    }
}

/// Value threaded through an invocation so that nested spans find their
/// parent without global state.
///
/// Contexts are immutable; starting a span returns a derived context in which
/// the new span is current. An empty context starts a fresh trace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceContext {
    current: Option<SpanContext>,
    request_id: Option<String>,
}

impl TraceContext {
    /// Creates an empty context with no active span.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty context correlated with an external request id.
    #[must_use]
    pub fn for_request(request_id: impl Into<String>) -> Self {
        Self {
            current: None,
            request_id: Some(request_id.into()),
        }
    }

    /// Span that new spans will be parented to, if any.
    #[must_use]
    pub const fn current(&self) -> Option<SpanContext> {
        self.current
    }

    /// Trace of the current span, if any.
    #[must_use]
    pub fn trace_id(&self) -> Option<TraceId> {
        self.current.map(|span| span.trace_id)
    }

    /// Correlation id carried by every span started under this context.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Returns a copy of this context with `span` as the current span.
    #[must_use]
    pub fn with_current(&self, span: SpanContext) -> Self {
        Self {
            current: Some(span),
            request_id: self.request_id.clone(),
        }
    }
}
