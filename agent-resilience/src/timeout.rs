//! Deadline wrapper for a single unit of work.

use std::future::Future;
use std::time::Duration;

use agent_telemetry::MetricsCollector;
use thiserror::Error;
use tracing::warn;

/// Returned when a deadline elapses before the wrapped work completes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("`{operation}` timed out after {after:?}")]
pub struct TimedOut {
    /// Label of the timed-out operation.
    pub operation: String,
    /// Deadline that elapsed.
    pub after: Duration,
}

/// Runs `work` under a deadline of `duration`.
///
/// On expiry the future is dropped at its current suspension point, which
/// cancels it and releases everything it owns before this function returns.
/// The counter `<operation>.timeouts` is incremented as a side effect, so
/// `operation` should be a valid metric name segment.
///
/// # Errors
///
/// Returns [`TimedOut`] when the deadline elapses first.
pub async fn with_timeout<F, T>(
    operation: &str,
    duration: Duration,
    metrics: &MetricsCollector,
    work: F,
) -> Result<T, TimedOut>
where
    F: Future<Output = T>,
{
    match tokio::time::timeout(duration, work).await {
        Ok(output) => Ok(output),
        Err(_) => {
            warn!(operation, ?duration, "deadline exceeded; operation cancelled");
            let _ = metrics.increment(&format!("{operation}.timeouts"));
            Err(TimedOut {
                operation: operation.to_owned(),
                after: duration,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn completes_within_deadline() {
        let metrics = MetricsCollector::default();
        let value = with_timeout("tool", Duration::from_secs(1), &metrics, async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            7
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(metrics.counter("tool.timeouts"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_cancels_the_work_and_counts_it() {
        let metrics = MetricsCollector::default();
        let dropped = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));

        let guard = DropFlag(Arc::clone(&dropped));
        let finished_flag = Arc::clone(&finished);
        let err = with_timeout("tool", Duration::from_millis(100), &metrics, async move {
            let _guard = guard;
            tokio::time::sleep(Duration::from_secs(10)).await;
            finished_flag.store(true, Ordering::SeqCst);
        })
        .await
        .unwrap_err();

        assert_eq!(err.after, Duration::from_millis(100));
        assert_eq!(err.operation, "tool");
        assert!(dropped.load(Ordering::SeqCst), "work must be released on expiry");
        assert!(!finished.load(Ordering::SeqCst));
        assert_eq!(metrics.counter("tool.timeouts"), Some(1.0));
    }
}
