//! Immutable records of policy outcomes.

use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use agent_primitives::DecisionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::contracts::{DecisionInput, DecisionType};
use crate::engine::Evaluation;

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionResult {
    /// Action is permitted.
    Allow,
    /// Action is rejected.
    Deny,
    /// Action may proceed only after a human approves it.
    RequireApproval,
}

impl Display for DecisionResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::RequireApproval => "require_approval",
        })
    }
}

/// One policy decision as written to the decision log.
///
/// Records are assembled once and never edited; a correction is a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDecision {
    decision_id: DecisionId,
    timestamp: DateTime<Utc>,
    decision_type: DecisionType,
    result: DecisionResult,
    reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    agent_id: Option<String>,
    latency_ms: f64,
    #[serde(default)]
    context: Map<String, Value>,
}

impl PolicyDecision {
    /// Creates a decision stamped with a fresh id and the current time.
    #[must_use]
    pub fn new(decision_type: DecisionType, result: DecisionResult, reason: impl Into<String>) -> Self {
        Self {
            decision_id: DecisionId::random(),
            timestamp: Utc::now(),
            decision_type,
            result,
            reason: reason.into(),
            tool_name: None,
            agent_id: None,
            latency_ms: 0.0,
            context: Map::new(),
        }
    }

    /// Builds the record of `evaluation` for `input`.
    ///
    /// The input's context is copied, and `request_id` and the names of the
    /// matched rules are added to it.
    #[must_use]
    pub fn from_evaluation(input: &DecisionInput, evaluation: &Evaluation, latency: Duration) -> Self {
        let mut context = input.context().clone();
        if let Some(request_id) = input.request_id() {
            context.insert("request_id".to_owned(), Value::from(request_id));
        }
        context.insert(
            "matched_rules".to_owned(),
            Value::from(evaluation.matched_rules().to_vec()),
        );

        let mut decision = Self::new(input.decision_type(), evaluation.verdict(), evaluation.reason())
            .with_latency(latency);
        decision.tool_name = input.tool_name().map(str::to_owned);
        decision.agent_id = input.agent_id().map(str::to_owned);
        decision.context = context;
        decision
    }

    /// Sets the tool name.
    #[must_use]
    pub fn with_tool(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    /// Sets the agent identifier.
    #[must_use]
    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Sets the time spent deciding.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let micros = latency.as_micros() as f64;
        self.latency_ms = micros / 1_000.0;
        self
    }

    /// Adds a context entry.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Unique id of the record.
    #[must_use]
    pub fn decision_id(&self) -> DecisionId {
        self.decision_id
    }

    /// When the decision was made.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Checkpoint the decision belongs to.
    #[must_use]
    pub fn decision_type(&self) -> DecisionType {
        self.decision_type
    }

    /// Outcome.
    #[must_use]
    pub fn result(&self) -> DecisionResult {
        self.result
    }

    /// Human-readable explanation.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Tool the decision concerns, if any.
    #[must_use]
    pub fn tool_name(&self) -> Option<&str> {
        self.tool_name.as_deref()
    }

    /// Agent the decision concerns, if any.
    #[must_use]
    pub fn agent_id(&self) -> Option<&str> {
        self.agent_id.as_deref()
    }

    /// Time spent deciding, in milliseconds.
    #[must_use]
    pub fn latency_ms(&self) -> f64 {
        self.latency_ms
    }

    /// Free-form context.
    #[must_use]
    pub fn context(&self) -> &Map<String, Value> {
        &self.context
    }
}
