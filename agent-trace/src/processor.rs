//! Background batching and export of finished spans.

use std::num::{NonZeroU32, NonZeroUsize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use agent_resilience::{BreakerConfig, CircuitBreaker, RetryPolicy, retry_with_backoff};
use agent_telemetry::MetricsCollector;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::exporter::{ExportError, SpanExporter};
use crate::span::{EXPORT_FAILURES_METRIC, SpanRecord, Tracer};

/// Counter of spans accepted by the exporter.
pub const EXPORTED_METRIC: &str = "trace.spans.exported";
/// Counter of times the export circuit breaker opened.
pub const BREAKER_OPENED_METRIC: &str = "trace.breaker.opened";

/// Batching, retry, and circuit-breaker settings of a [`BatchSpanProcessor`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Finished spans buffered ahead of the worker; spans beyond it are dropped.
    pub queue_capacity: NonZeroUsize,
    /// A batch is exported as soon as it holds this many spans.
    pub max_batch_size: NonZeroUsize,
    /// A non-empty batch is exported at most this long after its first span.
    pub max_wait_ms: u64,
    /// Retry schedule applied to each batch.
    pub export_retry: RetryPolicy,
    /// Consecutive failed batches that open the breaker.
    pub breaker_failure_threshold: NonZeroU32,
    /// Time the breaker stays open before probing the exporter again.
    pub breaker_cooldown_ms: u64,
}

impl BatchConfig {
    /// Maximum time a span waits in a partial batch.
    #[must_use]
    pub const fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    /// Circuit-breaker settings derived from this configuration.
    #[must_use]
    pub fn breaker(&self) -> BreakerConfig {
        BreakerConfig::new(
            self.breaker_failure_threshold,
            Duration::from_millis(self.breaker_cooldown_ms),
        )
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: NonZeroUsize::new(2048).expect("non-zero"),
            max_batch_size: NonZeroUsize::new(500).expect("non-zero"),
            max_wait_ms: 2_000,
            export_retry: RetryPolicy::default(),
            breaker_failure_threshold: NonZeroU32::new(3).expect("non-zero"),
            breaker_cooldown_ms: 30_000,
        }
    }
}

/// Span totals reported when the processor shuts down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExportReport {
    /// Spans accepted by the exporter.
    pub exported: u64,
    /// Spans lost to export failures, the open breaker, or shutdown.
    pub dropped: u64,
    /// `true` when the grace period elapsed and the worker was aborted.
    pub timed_out: bool,
}

#[derive(Debug, Default)]
struct Totals {
    exported: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug)]
enum Control {
    Flush(oneshot::Sender<()>),
    Shutdown,
}

#[derive(Debug)]
struct WorkerHandle {
    control: mpsc::Sender<Control>,
    join: JoinHandle<()>,
}

/// Owns the export worker and the [`Tracer`] that feeds it.
///
/// Finished spans wait in a bounded queue. The worker exports a batch when it
/// reaches `max_batch_size` or when `max_wait` has passed since its first span.
/// Failed batches are retried with backoff; after repeated failures a circuit
/// breaker drops batches until the cool-down elapses. Export never blocks the
/// code producing spans.
#[derive(Debug)]
pub struct BatchSpanProcessor {
    tracer: Tracer,
    totals: Arc<Totals>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl BatchSpanProcessor {
    /// Spawns the export worker on the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    #[must_use]
    pub fn start(
        exporter: Arc<dyn SpanExporter>,
        config: BatchConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity.get());
        let (control_tx, control_rx) = mpsc::channel(4);
        let totals = Arc::new(Totals::default());

        let worker = Worker {
            breaker: CircuitBreaker::new(exporter.name(), config.breaker()),
            exporter,
            config,
            metrics: Arc::clone(&metrics),
            totals: Arc::clone(&totals),
            batch: Vec::with_capacity(config.max_batch_size.get()),
        };
        let join = tokio::spawn(worker.run(queue_rx, control_rx));

        Self {
            tracer: Tracer::new(queue_tx, metrics),
            totals,
            worker: Mutex::new(Some(WorkerHandle {
                control: control_tx,
                join,
            })),
        }
    }

    /// Tracer feeding this processor.
    #[must_use]
    pub fn tracer(&self) -> Tracer {
        self.tracer.clone()
    }

    /// Exports every span queued so far and waits for the attempt to finish.
    pub async fn force_flush(&self) {
        let control = self.worker.lock().as_ref().map(|worker| worker.control.clone());
        let Some(control) = control else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if control.send(Control::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Stops the worker: no further spans are accepted, queued spans are
    /// exported, and after `grace` whatever remains is discarded.
    ///
    /// Calling it again returns the totals without waiting.
    pub async fn shutdown(&self, grace: Duration) -> ExportReport {
        let worker = self.worker.lock().take();
        let mut timed_out = false;

        if let Some(WorkerHandle { control, mut join }) = worker {
            let _ = control.send(Control::Shutdown).await;
            if tokio::time::timeout(grace, &mut join).await.is_err() {
                warn!(?grace, "span processor did not drain in time; discarding remaining spans");
                join.abort();
                timed_out = true;
            }
        }

        ExportReport {
            exported: self.totals.exported.load(Ordering::SeqCst),
            dropped: self.totals.dropped.load(Ordering::SeqCst),
            timed_out,
        }
    }
}

struct Worker {
    exporter: Arc<dyn SpanExporter>,
    config: BatchConfig,
    metrics: Arc<MetricsCollector>,
    breaker: CircuitBreaker,
    totals: Arc<Totals>,
    batch: Vec<SpanRecord>,
}

impl Worker {
    async fn run(
        mut self,
        mut queue: mpsc::Receiver<SpanRecord>,
        mut control: mpsc::Receiver<Control>,
    ) {
        debug!(exporter = self.exporter.name(), "span processor started");
        let mut deadline = Instant::now() + self.config.max_wait();

        loop {
            tokio::select! {
                biased;
                command = control.recv() => match command {
                    Some(Control::Flush(done)) => {
                        while let Ok(record) = queue.try_recv() {
                            self.push(record).await;
                        }
                        self.flush().await;
                        let _ = done.send(());
                    }
                    Some(Control::Shutdown) | None => break,
                },
                received = queue.recv() => match received {
                    Some(record) => {
                        if self.batch.is_empty() {
                            deadline = Instant::now() + self.config.max_wait();
                        }
                        self.push(record).await;
                    }
                    None => break,
                },
                () = sleep_until(deadline), if !self.batch.is_empty() => self.flush().await,
            }
        }

        queue.close();
        while let Some(record) = queue.recv().await {
            self.push(record).await;
        }
        self.flush().await;
        info!(
            exported = self.totals.exported.load(Ordering::SeqCst),
            dropped = self.totals.dropped.load(Ordering::SeqCst),
            "span processor stopped"
        );
    }

    async fn push(&mut self, record: SpanRecord) {
        self.batch.push(record);
        if self.batch.len() >= self.config.max_batch_size.get() {
            self.flush().await;
        }
    }

    async fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.batch);
        let size = batch.len() as u64;

        if !self.breaker.allow() {
            debug!(spans = size, "export breaker open; dropping batch");
            self.drop_spans(size);
            return;
        }

        let exporter = self.exporter.as_ref();
        let spans = batch.as_slice();
        let outcome = retry_with_backoff(
            &self.config.export_retry,
            &self.metrics,
            ExportError::is_retryable,
            move |_| exporter.export(spans),
        )
        .await;

        match outcome {
            Ok(()) => {
                self.breaker.record_success();
                self.totals.exported.fetch_add(size, Ordering::SeqCst);
                #[allow(clippy::cast_precision_loss)]
                let _ = self.metrics.increment_counter(EXPORTED_METRIC, size as f64);
            }
            Err(err) => {
                warn!(
                    exporter = exporter.name(),
                    spans = size,
                    error = %err.inner(),
                    "span export failed; dropping batch"
                );
                if self.breaker.record_failure() {
                    let _ = self.metrics.increment(BREAKER_OPENED_METRIC);
                }
                self.drop_spans(size);
            }
        }
    }

    fn drop_spans(&self, count: u64) {
        self.totals.dropped.fetch_add(count, Ordering::SeqCst);
        #[allow(clippy::cast_precision_loss)]
        let _ = self.metrics.increment_counter(EXPORT_FAILURES_METRIC, count as f64);
    }
}
