//! Shared error definitions for agent primitives.

use thiserror::Error;
use uuid::Error as UuidError;

/// Result alias used throughout the primitives crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while parsing identifier types.
#[derive(Debug, Error)]
pub enum Error {
    /// The provided decision identifier could not be parsed.
    #[error("invalid decision id: {source}")]
    InvalidDecisionId {
        /// Source parsing error from the UUID library.
        #[from]
        source: UuidError,
    },

    /// Trace identifier was not 32 hex characters or was all zeroes.
    #[error("invalid trace id `{value}`")]
    InvalidTraceId {
        /// The offending input.
        value: String,
    },

    /// Span identifier was not 16 hex characters or was all zeroes.
    #[error("invalid span id `{value}`")]
    InvalidSpanId {
        /// The offending input.
        value: String,
    },
}
