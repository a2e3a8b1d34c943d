//! Span exporter contract and the built-in in-process exporters.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::info;

use crate::span::SpanRecord;

/// Failure to deliver a batch of spans.
#[derive(Debug, Error)]
pub enum ExportError {
    /// Exporter is misconfigured; retrying cannot help.
    #[error("invalid span exporter configuration: {0}")]
    Configuration(String),
    /// The batch could not be encoded.
    #[error("failed to encode span batch: {0}")]
    Encode(#[from] serde_json::Error),
    /// The collector could not be reached.
    #[error("span export transport error: {0}")]
    Transport(String),
    /// The collector did not answer in time.
    #[error("span export timed out after {0:?}")]
    Timeout(Duration),
    /// The collector answered with a non-success status.
    #[error("collector rejected span batch with status {status}: {body}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body, lossily decoded.
        body: String,
    },
}

impl ExportError {
    /// Whether re-sending the same batch may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Configuration(_) | Self::Encode(_) => false,
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::Rejected { status, .. } => *status == 429 || *status >= 500,
        }
    }
}

/// Result alias for span export.
pub type ExportResult<T> = Result<T, ExportError>;

/// Destination for finished spans.
#[async_trait]
pub trait SpanExporter: Send + Sync {
    /// Short name used in log events.
    fn name(&self) -> &'static str;

    /// Delivers one batch. The batch is never empty.
    async fn export(&self, batch: &[SpanRecord]) -> ExportResult<()>;
}

/// Exporter that writes each span as a structured `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSpanExporter;

#[async_trait]
impl SpanExporter for LogSpanExporter {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn export(&self, batch: &[SpanRecord]) -> ExportResult<()> {
        for span in batch {
            info!(
                target: "agentwatch::spans",
                trace_id = %span.trace_id,
                span_id = %span.span_id,
                parent_span_id = ?span.parent_span_id.map(|id| id.to_string()),
                name = %span.name,
                status = %span.status,
                duration_us = span.duration_ns() / 1_000,
                tags = ?span.tags,
                "span finished"
            );
        }
        Ok(())
    }
}

/// Exporter that keeps spans in memory, for tests and local inspection.
///
/// Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct InMemorySpanExporter {
    spans: Arc<Mutex<Vec<SpanRecord>>>,
    batches: Arc<Mutex<Vec<usize>>>,
    failures_remaining: Arc<AtomicU32>,
}

impl InMemorySpanExporter {
    /// Creates an empty exporter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every exported span, in export order.
    #[must_use]
    pub fn spans(&self) -> Vec<SpanRecord> {
        self.spans.lock().clone()
    }

    /// Sizes of the batches received so far.
    #[must_use]
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().clone()
    }

    /// Makes the next `count` export calls fail with a transport error.
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Discards everything exported so far.
    pub fn clear(&self) {
        self.spans.lock().clear();
        self.batches.lock().clear();
    }
}

#[async_trait]
impl SpanExporter for InMemorySpanExporter {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn export(&self, batch: &[SpanRecord]) -> ExportResult<()> {
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ExportError::Transport("injected failure".to_owned()));
        }

        self.batches.lock().push(batch.len());
        self.spans.lock().extend_from_slice(batch);
        Ok(())
    }
}
