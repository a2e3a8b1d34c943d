//! Bounded, batched, asynchronous decision log.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use agent_telemetry::MetricsCollector;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout_at};
use tracing::{debug, info, warn};

use crate::decision::PolicyDecision;
use crate::sink::DecisionSink;

/// Counter of decisions written by the sink.
pub const PERSISTED_METRIC: &str = "decision_log.persisted";
/// Counter of decisions lost to backpressure, sink failures, or shutdown.
pub const DROPPED_METRIC: &str = "decision_log_dropped";
/// Counter of failed sink writes.
pub const SINK_FAILURES_METRIC: &str = "decision_log.sink_failures";

/// Queueing and flushing settings of a [`DecisionLog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionLogConfig {
    /// Decisions buffered ahead of the sink.
    pub capacity: NonZeroUsize,
    /// Decisions written per sink call; a full batch is flushed immediately.
    pub batch_size: NonZeroUsize,
    /// Interval at which partial batches are flushed.
    pub flush_interval_ms: u64,
    /// How long `append` waits for space before evicting the oldest record.
    pub block_timeout_ms: u64,
}

impl DecisionLogConfig {
    /// Interval at which partial batches are flushed.
    #[must_use]
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Longest time `append` blocks on a full queue.
    #[must_use]
    pub const fn block_timeout(&self) -> Duration {
        Duration::from_millis(self.block_timeout_ms)
    }
}

impl Default for DecisionLogConfig {
    fn default() -> Self {
        Self {
            capacity: NonZeroUsize::new(1024).expect("non-zero"),
            batch_size: NonZeroUsize::new(100).expect("non-zero"),
            flush_interval_ms: 5_000,
            block_timeout_ms: 50,
        }
    }
}

/// Decision totals reported when the log shuts down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecisionLogReport {
    /// Decisions written by the sink.
    pub persisted: u64,
    /// Decisions lost; each one was also counted in `decision_log_dropped`.
    pub dropped: u64,
    /// `true` when the grace period elapsed and the worker was aborted.
    pub timed_out: bool,
}

#[derive(Debug)]
struct Shared {
    queue: Mutex<VecDeque<PolicyDecision>>,
    capacity: usize,
    space: Notify,
    ready: Notify,
    closed: AtomicBool,
    in_flight: AtomicU64,
    persisted: AtomicU64,
    dropped: AtomicU64,
    metrics: Arc<MetricsCollector>,
}

impl Shared {
    fn count_dropped(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.dropped.fetch_add(count, Ordering::SeqCst);
        #[allow(clippy::cast_precision_loss)]
        let _ = self.metrics.increment_counter(DROPPED_METRIC, count as f64);
    }
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

/// Append-only log of policy decisions.
///
/// `append` only enqueues; a background worker writes batches to the sink when
/// `batch_size` records are waiting or every `flush_interval`. When the queue
/// is full `append` waits up to `block_timeout` for room and then evicts the
/// oldest queued record. Every record that does not reach the sink is counted
/// in `decision_log_dropped`. Records from one producer reach the sink in
/// append order.
#[derive(Debug)]
pub struct DecisionLog {
    shared: Arc<Shared>,
    block_timeout: Duration,
    worker: Mutex<Option<WorkerHandle>>,
}

impl DecisionLog {
    /// Spawns the flush worker on the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    #[must_use]
    pub fn start(
        sink: Arc<dyn DecisionSink>,
        config: DecisionLogConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(config.capacity.get())),
            capacity: config.capacity.get(),
            space: Notify::new(),
            ready: Notify::new(),
            closed: AtomicBool::new(false),
            in_flight: AtomicU64::new(0),
            persisted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            metrics,
        });
        let (control_tx, control_rx) = mpsc::channel(4);

        let worker = Worker {
            sink,
            shared: Arc::clone(&shared),
            batch_size: config.batch_size.get(),
            flush_interval: config.flush_interval(),
        };
        let join = tokio::spawn(worker.run(control_rx));

        Self {
            shared,
            block_timeout: config.block_timeout(),
            worker: Mutex::new(Some(WorkerHandle {
                control: control_tx,
                join,
            })),
        }
    }

    /// Enqueues a decision for persistence.
    ///
    /// Returns once the record is queued, which on a full queue is after at
    /// most `block_timeout`. After shutdown the record is dropped and counted.
    pub async fn append(&self, decision: PolicyDecision) {
        let shared = &self.shared;
        if shared.closed.load(Ordering::SeqCst) {
            Self::reject_closed(shared, &decision);
            return;
        }

        let deadline = Instant::now() + self.block_timeout;
        loop {
            let space = shared.space.notified();
            {
                let mut queue = shared.queue.lock();
                if shared.closed.load(Ordering::SeqCst) {
                    drop(queue);
                    Self::reject_closed(shared, &decision);
                    return;
                }
                if queue.len() < shared.capacity {
                    queue.push_back(decision);
                    drop(queue);
                    shared.ready.notify_one();
                    return;
                }
            }
            if timeout_at(deadline, space).await.is_err() {
                break;
            }
        }

        let evicted = {
            let mut queue = shared.queue.lock();
            if shared.closed.load(Ordering::SeqCst) {
                drop(queue);
                Self::reject_closed(shared, &decision);
                return;
            }
            let evicted = if queue.len() >= shared.capacity {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(decision);
            evicted
        };
        shared.ready.notify_one();

        if let Some(evicted) = evicted {
            warn!(
                evicted = %evicted.decision_id(),
                capacity = shared.capacity,
                "decision log full; dropped oldest decision"
            );
            shared.count_dropped(1);
        }
    }

    fn reject_closed(shared: &Shared, decision: &PolicyDecision) {
        debug!(decision_id = %decision.decision_id(), "decision log closed; dropping decision");
        shared.count_dropped(1);
    }

    /// Number of decisions waiting for the sink.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Writes every queued decision and waits for the sink to finish.
    pub async fn flush(&self) {
        let control = self.worker.lock().as_ref().map(|worker| worker.control.clone());
        let Some(control) = control else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if control.send(Control::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Stops accepting decisions, writes what is queued, and after `grace`
    /// discards whatever is left.
    ///
    /// Calling it again returns the totals without waiting.
    pub async fn shutdown(&self, grace: Duration) -> DecisionLogReport {
        {
            // Appends test `closed` under this lock before pushing.
            let _queue = self.shared.queue.lock();
            self.shared.closed.store(true, Ordering::SeqCst);
        }
        self.shared.space.notify_waiters();
        let worker = self.worker.lock().take();
        let mut timed_out = false;

        if let Some(WorkerHandle { control, mut join }) = worker {
            let _ = control.send(Control::Shutdown).await;
            if tokio::time::timeout(grace, &mut join).await.is_err() {
                join.abort();
                let _ = join.await;
                timed_out = true;

                let abandoned = self.shared.queue.lock().drain(..).count() as u64
                    + self.shared.in_flight.swap(0, Ordering::SeqCst);
                warn!(?grace, abandoned, "decision log did not drain in time; discarding remaining decisions");
                self.shared.count_dropped(abandoned);
            }

            let stranded = self.shared.queue.lock().drain(..).count() as u64;
            if stranded > 0 {
                warn!(stranded, "decisions queued after the final drain; discarding");
                self.shared.count_dropped(stranded);
            }
        }

        DecisionLogReport {
            persisted: self.shared.persisted.load(Ordering::SeqCst),
            dropped: self.shared.dropped.load(Ordering::SeqCst),
            timed_out,
        }
    }
}

struct Worker {
    sink: Arc<dyn DecisionSink>,
    shared: Arc<Shared>,
    batch_size: usize,
    flush_interval: Duration,
}

impl Worker {
    async fn run(self, mut control: mpsc::Receiver<Control>) {
        debug!(sink = self.sink.name(), "decision log worker started");
        let mut next_flush = Instant::now() + self.flush_interval;

        loop {
            if self.shared.queue.lock().len() >= self.batch_size {
                self.write_batch().await;
                continue;
            }

            tokio::select! {
                biased;
                command = control.recv() => match command {
                    Some(Control::Flush(done)) => {
                        self.drain().await;
                        let _ = done.send(());
                    }
                    Some(Control::Shutdown) | None => break,
                },
                () = self.shared.ready.notified() => {}
                () = sleep_until(next_flush) => {
                    self.drain().await;
                    next_flush = Instant::now() + self.flush_interval;
                }
            }
        }

        self.drain().await;
        info!(
            persisted = self.shared.persisted.load(Ordering::SeqCst),
            dropped = self.shared.dropped.load(Ordering::SeqCst),
            "decision log worker stopped"
        );
    }

    async fn drain(&self) {
        while self.write_batch().await {}
    }

    /// Writes up to one batch. Returns `false` when the queue was empty.
    async fn write_batch(&self) -> bool {
        let batch: Vec<PolicyDecision> = {
            let mut queue = self.shared.queue.lock();
            let take = queue.len().min(self.batch_size);
            queue.drain(..take).collect()
        };
        if batch.is_empty() {
            return false;
        }
        self.shared.space.notify_waiters();

        let size = batch.len() as u64;
        self.shared.in_flight.store(size, Ordering::SeqCst);
        let outcome = self.sink.write_batch(&batch).await;
        self.shared.in_flight.store(0, Ordering::SeqCst);

        match outcome {
            Ok(()) => {
                self.shared.persisted.fetch_add(size, Ordering::SeqCst);
                #[allow(clippy::cast_precision_loss)]
                let _ = self.shared.metrics.increment_counter(PERSISTED_METRIC, size as f64);
            }
            Err(err) => {
                warn!(sink = self.sink.name(), decisions = size, error = %err, "decision sink write failed");
                let _ = self.shared.metrics.increment(SINK_FAILURES_METRIC);
                self.shared.count_dropped(size);
            }
        }
        true
    }
}
