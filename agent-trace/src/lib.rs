//! Hierarchical spans with asynchronous, batched export.
//!
//! A [`BatchSpanProcessor`] owns the export worker and hands out the
//! [`Tracer`] that feeds it. Spans are parented through an explicit
//! [`TraceContext`] value passed down the call chain, so nested operations
//! link up without any global state.

#![warn(missing_docs, clippy::pedantic)]

pub mod context;
pub mod exporter;
pub mod otlp;
pub mod processor;
pub mod span;

pub use context::{SpanContext, TraceContext};
pub use exporter::{ExportError, ExportResult, InMemorySpanExporter, LogSpanExporter, SpanExporter};
pub use otlp::OtlpHttpExporter;
pub use processor::{BatchConfig, BatchSpanProcessor, ExportReport};
pub use span::{Span, SpanRecord, SpanStatus, Tracer};
