//! Lifecycle state machine for a single invocation.

use std::fmt::{self, Display, Formatter};

use thiserror::Error;
use tracing::debug;

/// States an invocation moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvocationState {
    /// Span opened, nothing checked yet.
    Start,
    /// Input passed policy.
    InputValidated,
    /// Adapter work is running under timeout and retry.
    Executing,
    /// Output and tool calls passed policy.
    OutputValidated,
    /// Completed successfully.
    End,
    /// Terminated by a policy denial, timeout, or execution failure.
    Error,
}

impl InvocationState {
    /// Label used in metric names and log fields.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::InputValidated => "input_validated",
            Self::Executing => "executing",
            Self::OutputValidated => "output_validated",
            Self::End => "end",
            Self::Error => "error",
        }
    }

    /// Returns `true` once no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::End | Self::Error)
    }
}

impl Display for InvocationState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events that trigger lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationEvent {
    /// Input policy allowed the invocation.
    InputAllowed,
    /// The first attempt is about to run.
    ExecutionStarted,
    /// Output policy allowed the result.
    OutputAllowed,
    /// Result handed back to the caller.
    Complete,
    /// Any failure; valid from every non-terminal state.
    Fail,
}

/// Lifecycle state manager for one invocation.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    request_id: String,
    state: InvocationState,
}

impl Lifecycle {
    /// Starts tracking the invocation `request_id` in [`InvocationState::Start`].
    #[must_use]
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            state: InvocationState::Start,
        }
    }

    /// Correlation id of the tracked invocation.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> InvocationState {
        self.state
    }

    /// Applies an event, returning the resulting state.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] when the event is not
    /// allowed from the current state.
    pub fn transition(&mut self, event: InvocationEvent) -> LifecycleResult<InvocationState> {
        use InvocationState as S;

        let next = match (self.state, event) {
            (S::Start, InvocationEvent::InputAllowed) => Some(S::InputValidated),
            (S::InputValidated, InvocationEvent::ExecutionStarted) => Some(S::Executing),
            (S::Executing, InvocationEvent::OutputAllowed) => Some(S::OutputValidated),
            (S::OutputValidated, InvocationEvent::Complete) => Some(S::End),
            (state, InvocationEvent::Fail) if !state.is_terminal() => Some(S::Error),
            _ => None,
        };

        let Some(next_state) = next else {
            return Err(LifecycleError::InvalidTransition {
                request_id: self.request_id.clone(),
                from: self.state,
                event,
            });
        };

        debug!(
            request_id = %self.request_id,
            from = %self.state,
            to = %next_state,
            ?event,
            "invocation lifecycle transition"
        );
        self.state = next_state;
        Ok(next_state)
    }
}

/// Errors emitted by the lifecycle controller.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Transition was not permitted from the current state.
    #[error("invalid lifecycle transition from {from} via {event:?} for request {request_id}")]
    InvalidTransition {
        /// Invocation whose transition failed.
        request_id: String,
        /// State prior to the attempted transition.
        from: InvocationState,
        /// Event that triggered the failure.
        event: InvocationEvent,
    },
}

/// Result alias used for lifecycle operations.
pub type LifecycleResult<T> = Result<T, LifecycleError>;
