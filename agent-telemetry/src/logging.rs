//! Structured logging bootstrap.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, prelude::*};

/// Filter applied when neither `RUST_LOG` nor an explicit directive is given.
pub const DEFAULT_FILTER: &str = "info";

/// Installs a global `fmt` subscriber.
///
/// `directives` overrides `RUST_LOG`; when both are absent [`DEFAULT_FILTER`]
/// applies.
///
/// # Errors
///
/// Returns [`TryInitError`] when a global subscriber is already installed.
pub fn init_tracing(directives: Option<&str>) -> Result<(), TryInitError> {
    let filter = match directives {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
}
