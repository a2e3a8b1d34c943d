//! Consecutive-failure circuit breaker.

use std::num::NonZeroU32;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

/// Breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    failure_threshold: NonZeroU32,
    cooldown_ms: u64,
}

impl BreakerConfig {
    /// Opens after `failure_threshold` consecutive failures and stays open for
    /// `cooldown`.
    #[must_use]
    pub fn new(failure_threshold: NonZeroU32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown_ms: u64::try_from(cooldown.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Consecutive failures that trip the breaker.
    #[must_use]
    pub const fn failure_threshold(&self) -> NonZeroU32 {
        self.failure_threshold
    }

    /// Time spent open before a probe is admitted.
    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::new(NonZeroU32::new(3).expect("non-zero"), Duration::from_secs(30))
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected until the cool-down elapses.
    Open,
    /// One probe call is admitted to test recovery.
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Gate that stops calling a failing dependency until it has had time to
/// recover.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Returns the breaker name used in log events.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the current state without advancing it.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Returns `true` when a call may proceed.
    ///
    /// An open breaker whose cool-down has elapsed moves to half-open and
    /// admits exactly one probe until that probe reports its outcome.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .is_none_or(|opened| opened.elapsed() >= self.config.cooldown());
                if cooled {
                    info!(breaker = %self.name, "circuit half-open; admitting probe");
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                }
                cooled
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Reports a successful call, closing the breaker.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            info!(breaker = %self.name, "circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    /// Reports a failed call. Returns `true` when this failure opened the
    /// breaker.
    pub fn record_failure(&self) -> bool {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.probe_in_flight = false;

        let trip = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => {
                inner.consecutive_failures >= self.config.failure_threshold().get()
            }
            CircuitState::Open => false,
        };

        if trip {
            warn!(
                breaker = %self.name,
                failures = inner.consecutive_failures,
                cooldown = ?self.config.cooldown(),
                "circuit opened"
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
        trip
    }
}
