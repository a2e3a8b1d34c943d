//! Policy evaluation and the decision log for agent invocations.
//!
//! [`RuleBasedEngine`] judges a [`DecisionInput`] against a host-supplied
//! [`RuleSet`]; every verdict becomes an immutable [`PolicyDecision`] that the
//! [`DecisionLog`] persists in batches through a [`DecisionSink`].

#![warn(missing_docs, clippy::pedantic)]

pub mod contracts;
pub mod decision;
pub mod engine;
pub mod log;
pub mod sink;

pub use contracts::{DecisionInput, DecisionType, TextField, ToolCall};
pub use decision::{DecisionResult, PolicyDecision};
pub use engine::{
    Condition, Evaluation, PolicyEngine, PolicyError, PolicyResult, PolicyRule, Predicate,
    RuleBasedEngine, RuleEffect, RuleSet,
};
pub use log::{DecisionLog, DecisionLogConfig, DecisionLogReport};
pub use sink::{
    DecisionSink, FileDecisionSink, MemoryDecisionSink, SinkError, SinkResult, TracingDecisionSink,
};
