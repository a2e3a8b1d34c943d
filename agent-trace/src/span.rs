//! Spans and the tracer that creates them.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use agent_primitives::{SpanId, TraceId};
use agent_telemetry::MetricsCollector;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::context::{SpanContext, TraceContext};

/// Counter of spans lost before reaching the collector.
pub const EXPORT_FAILURES_METRIC: &str = "trace_export_failures";

/// Outcome recorded on a span.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpanStatus {
    /// The unit of work succeeded.
    #[default]
    Ok,
    /// The unit of work failed or was cancelled.
    Error,
}

impl Display for SpanStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ok => "OK",
            Self::Error => "ERROR",
        })
    }
}

/// Finished, immutable span handed to the exporter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanRecord {
    /// Trace the span belongs to.
    pub trace_id: TraceId,
    /// Id of the span.
    pub span_id: SpanId,
    /// Id of the parent span; `None` for a trace root.
    pub parent_span_id: Option<SpanId>,
    /// Operation name.
    pub name: String,
    /// Start, in nanoseconds since the Unix epoch.
    pub start_time_ns: u64,
    /// End, in nanoseconds since the Unix epoch.
    pub end_time_ns: u64,
    /// Free-form key/value annotations.
    pub tags: BTreeMap<String, String>,
    /// Final status.
    pub status: SpanStatus,
}

impl SpanRecord {
    /// Wall-clock duration of the span.
    #[must_use]
    pub fn duration_ns(&self) -> u64 {
        self.end_time_ns.saturating_sub(self.start_time_ns)
    }
}

#[derive(Debug)]
struct Shared {
    queue: mpsc::Sender<SpanRecord>,
    metrics: Arc<MetricsCollector>,
}

/// Creates spans and hands finished ones to the export queue.
///
/// Cloning is cheap; all clones feed the same queue.
#[derive(Debug, Clone)]
pub struct Tracer {
    shared: Arc<Shared>,
}

impl Tracer {
    pub(crate) fn new(queue: mpsc::Sender<SpanRecord>, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            shared: Arc::new(Shared { queue, metrics }),
        }
    }

    /// Opens a span under `parent` and returns it with a derived context in
    /// which the new span is current.
    ///
    /// Without a current span in `parent` a new trace is started. The
    /// context's request id, if any, is copied into the `request_id` tag.
    pub fn start_span(&self, name: impl Into<String>, parent: &TraceContext) -> (Span, TraceContext) {
        let parent_span = parent.current();
        let trace_id = parent_span.map_or_else(TraceId::random, |span| span.trace_id());
        let context = SpanContext::new(trace_id, SpanId::random());

        let mut tags = BTreeMap::new();
        if let Some(request_id) = parent.request_id() {
            tags.insert("request_id".to_owned(), request_id.to_owned());
        }

        let span = Span {
            open: Some(OpenSpan {
                context,
                parent_span_id: parent_span.map(|span| span.span_id()),
                name: name.into(),
                start_time_ns: now_ns(),
                tags,
                status: SpanStatus::Ok,
            }),
            tracer: self.clone(),
        };
        (span, parent.with_current(context))
    }

    fn submit(&self, record: SpanRecord) {
        match self.shared.queue.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                warn!(span = %record.name, trace_id = %record.trace_id, "span queue full; dropping span");
                let _ = self.shared.metrics.increment(EXPORT_FAILURES_METRIC);
            }
            Err(TrySendError::Closed(record)) => {
                debug!(span = %record.name, "span processor stopped; dropping span");
                let _ = self.shared.metrics.increment(EXPORT_FAILURES_METRIC);
            }
        }
    }
}

#[derive(Debug)]
struct OpenSpan {
    context: SpanContext,
    parent_span_id: Option<SpanId>,
    name: String,
    start_time_ns: u64,
    tags: BTreeMap<String, String>,
    status: SpanStatus,
}

impl OpenSpan {
    fn finish(self) -> SpanRecord {
        SpanRecord {
            trace_id: self.context.trace_id(),
            span_id: self.context.span_id(),
            parent_span_id: self.parent_span_id,
            name: self.name,
            start_time_ns: self.start_time_ns,
            end_time_ns: now_ns().max(self.start_time_ns),
            tags: self.tags,
            status: self.status,
        }
    }
}

/// An open span.
///
/// [`end`](Self::end) freezes the span and transfers it to the export queue.
/// A span dropped while still open is ended with [`SpanStatus::Error`] and the
/// tag `cancelled=true`, which is what happens when the future owning it is
/// cancelled.
#[derive(Debug)]
pub struct Span {
    open: Option<OpenSpan>,
    tracer: Tracer,
}

impl Span {
    /// Identity of this span.
    #[must_use]
    pub fn context(&self) -> SpanContext {
        self.state().context
    }

    /// Sets or replaces a tag.
    pub fn set_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.state_mut().tags.insert(key.into(), value.into());
    }

    /// Sets the span status.
    pub fn set_status(&mut self, status: SpanStatus) {
        self.state_mut().status = status;
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> SpanStatus {
        self.state().status
    }

    /// Ends the span and queues it for export.
    pub fn end(mut self) {
        if let Some(open) = self.open.take() {
            self.tracer.submit(open.finish());
        }
    }

    fn state(&self) -> &OpenSpan {
        // `open` is only taken by `end` and `drop`, which consume the span.
        self.open.as_ref().unwrap_or_else(|| unreachable!("span used after end"))
    }

    fn state_mut(&mut self) -> &mut OpenSpan {
        self.open.as_mut().unwrap_or_else(|| unreachable!("span used after end"))
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        if let Some(mut open) = self.open.take() {
            debug!(span = %open.name, "span dropped while open; ending as cancelled");
            open.status = SpanStatus::Error;
            open.tags.insert("cancelled".to_owned(), "true".to_owned());
            self.tracer.submit(open.finish());
        }
    }
}

fn now_ns() -> u64 {
    Utc::now()
        .timestamp_nanos_opt()
        .and_then(|nanos| u64::try_from(nanos).ok())
        .unwrap_or_default()
}
