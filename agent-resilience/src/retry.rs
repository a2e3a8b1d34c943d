//! Retry with exponential backoff and jitter.

use std::future::Future;
use std::num::NonZeroU32;
use std::time::Duration;

use agent_telemetry::MetricsCollector;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Counter of attempts made, first attempts included.
pub const ATTEMPTS_METRIC: &str = "retry.attempts";
/// Counter of operations that failed on their final attempt.
pub const EXHAUSTED_METRIC: &str = "retry.exhausted";
/// Histogram of the attempt number that finally succeeded, recorded only when
/// at least one retry was needed.
pub const SUCCESS_AFTER_METRIC: &str = "retry.success_after_attempts";

const MAX_JITTER: f64 = 0.99;

/// Backoff schedule for [`retry_with_backoff`].
///
/// The delay before attempt `n + 1` is
/// `initial_delay * backoff_factor^(n - 1)`, capped at `max_delay`, then
/// scaled by a random factor in `[1 - jitter, 1 + jitter]`.
///
/// Deserialization rejects a `jitter` outside `[0.0, 1.0)` and a
/// `backoff_factor` below `1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RetryPolicyFields")]
pub struct RetryPolicy {
    max_attempts: NonZeroU32,
    initial_delay_ms: u64,
    backoff_factor: f64,
    jitter: f64,
    max_delay_ms: u64,
}

/// Rejected [`RetryPolicy`] parameter.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum RetryPolicyError {
    /// Jitter must lie in `[0.0, 1.0)`.
    #[error("retry jitter must be in [0, 1), got {0}")]
    Jitter(f64),
    /// Backoff factor must be finite and at least `1.0`.
    #[error("retry backoff_factor must be a finite value >= 1, got {0}")]
    BackoffFactor(f64),
}

#[derive(Deserialize)]
#[serde(default)]
struct RetryPolicyFields {
    max_attempts: NonZeroU32,
    initial_delay_ms: u64,
    backoff_factor: f64,
    jitter: f64,
    max_delay_ms: u64,
}

impl Default for RetryPolicyFields {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_delay_ms: policy.initial_delay_ms,
            backoff_factor: policy.backoff_factor,
            jitter: policy.jitter,
            max_delay_ms: policy.max_delay_ms,
        }
    }
}

impl TryFrom<RetryPolicyFields> for RetryPolicy {
    type Error = RetryPolicyError;

    fn try_from(fields: RetryPolicyFields) -> Result<Self, Self::Error> {
        if !(0.0..1.0).contains(&fields.jitter) {
            return Err(RetryPolicyError::Jitter(fields.jitter));
        }
        if !fields.backoff_factor.is_finite() || fields.backoff_factor < 1.0 {
            return Err(RetryPolicyError::BackoffFactor(fields.backoff_factor));
        }
        Ok(Self {
            max_attempts: fields.max_attempts,
            initial_delay_ms: fields.initial_delay_ms,
            backoff_factor: fields.backoff_factor,
            jitter: fields.jitter,
            max_delay_ms: fields.max_delay_ms,
        })
    }
}

impl RetryPolicy {
    /// Creates a policy with the default ±20% jitter and a 30s delay cap.
    #[must_use]
    pub fn new(max_attempts: NonZeroU32, initial_delay: Duration, backoff_factor: f64) -> Self {
        let backoff_factor = if backoff_factor.is_finite() { backoff_factor.max(1.0) } else { 1.0 };
        Self {
            max_attempts,
            initial_delay_ms: duration_ms(initial_delay),
            backoff_factor,
            jitter: 0.2,
            max_delay_ms: 30_000,
        }
    }

    /// A policy that makes exactly one attempt.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::new(NonZeroU32::MIN, Duration::ZERO, 1.0)
    }

    /// Sets the jitter fraction, clamped to `[0.0, 1.0)`. NaN disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_nan() { 0.0 } else { jitter.clamp(0.0, MAX_JITTER) };
        self
    }

    /// Caps any single delay at `max_delay`.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay_ms = duration_ms(max_delay);
        self
    }

    /// Maximum number of attempts, first attempt included.
    #[must_use]
    pub const fn max_attempts(&self) -> NonZeroU32 {
        self.max_attempts
    }

    /// Delay before the first retry.
    #[must_use]
    pub const fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Multiplier applied per attempt.
    #[must_use]
    pub const fn backoff_factor(&self) -> f64 {
        self.backoff_factor
    }

    /// Jitter fraction.
    #[must_use]
    pub const fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Upper bound of a single delay.
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Un-jittered delay after the failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self
            .initial_delay()
            .as_secs_f64()
            * self.backoff_factor.powi(exponent);
        let capped = scaled.min(self.max_delay().as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or_else(|_| self.max_delay())
    }

    /// Jittered delay after the failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter.min(MAX_JITTER);
        if jitter.is_nan() || jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        base.mul_f64(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            NonZeroU32::new(3).expect("non-zero"),
            Duration::from_secs(1),
            2.0,
        )
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Failure of a retried operation.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every permitted attempt failed with a retryable error.
    #[error("gave up after {attempts} attempts: {source}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Error of the final attempt, unmodified.
        #[source]
        source: E,
    },
    /// The operation failed with an error classified as non-retryable.
    #[error(transparent)]
    Fatal(E),
}

impl<E> RetryError<E> {
    /// Returns the original error.
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { source, .. } | Self::Fatal(source) => source,
        }
    }

    /// Borrows the original error.
    pub fn inner(&self) -> &E {
        match self {
            Self::Exhausted { source, .. } | Self::Fatal(source) => source,
        }
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// exhausts `policy.max_attempts()`.
///
/// `operation` receives the 1-based attempt number. There is no delay after
/// the final attempt. Metrics are recorded as a side effect only; a failure to
/// record them never changes the outcome.
///
/// # Errors
///
/// Returns [`RetryError::Fatal`] immediately for errors rejected by
/// `is_retryable`, and [`RetryError::Exhausted`] carrying the last error once
/// all attempts fail.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    metrics: &MetricsCollector,
    is_retryable: P,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts().get();
    let mut attempt = 1;

    loop {
        let _ = metrics.increment(ATTEMPTS_METRIC);
        match operation(attempt).await {
            Ok(output) => {
                if attempt > 1 {
                    let _ = metrics.record_histogram(SUCCESS_AFTER_METRIC, f64::from(attempt));
                }
                return Ok(output);
            }
            Err(err) if !is_retryable(&err) => return Err(RetryError::Fatal(err)),
            Err(err) if attempt >= max_attempts => {
                warn!(attempts = attempt, "retry budget exhausted");
                let _ = metrics.increment(EXHAUSTED_METRIC);
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    source: err,
                });
            }
            Err(_) => {
                let delay = policy.delay_for(attempt);
                debug!(attempt, ?delay, "retryable failure; backing off");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use parking_lot::Mutex;
    use tokio::time::Instant;

    #[derive(Debug, Clone, PartialEq, Eq, Error)]
    enum Flaky {
        #[error("transient #{0}")]
        Transient(u32),
        #[error("fatal")]
        Fatal,
    }

    fn is_transient(err: &Flaky) -> bool {
        matches!(err, Flaky::Transient(_))
    }

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(NonZeroU32::new(attempts).unwrap(), Duration::from_secs(1), 2.0)
    }

    #[test]
    fn base_delay_grows_geometrically_and_is_capped() {
        let policy = policy(5).with_max_delay(Duration::from_secs(3));
        assert_eq!(policy.base_delay(1), Duration::from_secs(1));
        assert_eq!(policy.base_delay(2), Duration::from_secs(2));
        assert_eq!(policy.base_delay(3), Duration::from_secs(3));
        assert_eq!(policy.base_delay(10), Duration::from_secs(3));
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let policy = policy(3);
        for _ in 0..200 {
            let delay = policy.delay_for(2).as_secs_f64();
            assert!((1.6..=2.4).contains(&delay), "delay {delay} out of band");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_operation_makes_exactly_max_attempts() {
        let metrics = MetricsCollector::default();
        let started_at = Arc::new(Mutex::new(Vec::new()));

        let log = Arc::clone(&started_at);
        let result: Result<(), _> = retry_with_backoff(&policy(3), &metrics, is_transient, |n| {
            let log = Arc::clone(&log);
            async move {
                log.lock().push(Instant::now());
                Err(Flaky::Transient(n))
            }
        })
        .await;
        let returned_at = Instant::now();

        let err = result.unwrap_err();
        assert!(matches!(err, RetryError::Exhausted { attempts: 3, .. }));
        assert_eq!(err.into_inner(), Flaky::Transient(3));

        let started_at = started_at.lock();
        assert_eq!(started_at.len(), 3);
        let first_gap = (started_at[1] - started_at[0]).as_secs_f64();
        let second_gap = (started_at[2] - started_at[1]).as_secs_f64();
        assert!((0.8..=1.2).contains(&first_gap), "first gap {first_gap}");
        assert!((1.6..=2.4).contains(&second_gap), "second gap {second_gap}");
        assert_eq!(returned_at, started_at[2], "no delay after the final attempt");

        assert_eq!(metrics.counter(ATTEMPTS_METRIC), Some(3.0));
        assert_eq!(metrics.counter(EXHAUSTED_METRIC), Some(1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_propagates_immediately() {
        let metrics = MetricsCollector::default();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = retry_with_backoff(&policy(5), &metrics, is_transient, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Flaky::Fatal) }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Fatal(Flaky::Fatal))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.counter(EXHAUSTED_METRIC), None);
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_retry_is_recorded() {
        let metrics = MetricsCollector::default();

        let value = retry_with_backoff(&policy(3), &metrics, is_transient, |n| async move {
            if n < 2 { Err(Flaky::Transient(n)) } else { Ok(n * 10) }
        })
        .await
        .unwrap();

        assert_eq!(value, 20);
        let histogram = metrics.histogram(SUCCESS_AFTER_METRIC).unwrap();
        assert_eq!(histogram.samples(), &[2.0]);
    }

    #[test]
    fn policy_deserializes_with_defaults() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"max_attempts": 5}"#).unwrap();
        assert_eq!(policy.max_attempts().get(), 5);
        assert_eq!(policy.initial_delay(), Duration::from_secs(1));
        assert!((policy.jitter() - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn out_of_range_parameters_are_rejected_when_deserialized() {
        let err = serde_json::from_str::<RetryPolicy>(r#"{"jitter": 1.5}"#).unwrap_err();
        assert!(err.to_string().contains("jitter"), "{err}");
        assert!(serde_json::from_str::<RetryPolicy>(r#"{"jitter": -0.1}"#).is_err());
        assert!(serde_json::from_str::<RetryPolicy>(r#"{"backoff_factor": 0.5}"#).is_err());

        let policy: RetryPolicy =
            serde_json::from_str(r#"{"jitter": 0.5, "initial_delay_ms": 1000}"#).unwrap();
        for _ in 0..100 {
            let delay = policy.delay_for(1).as_secs_f64();
            assert!((0.5..=1.5).contains(&delay), "delay {delay} out of band");
        }
    }

    #[test]
    fn extreme_builder_jitter_never_yields_a_negative_delay() {
        for jitter in [1.5, f64::INFINITY, f64::NAN] {
            let policy = policy(3).with_jitter(jitter);
            for _ in 0..50 {
                assert!(policy.delay_for(1) <= Duration::from_secs(2));
            }
        }
    }
}
