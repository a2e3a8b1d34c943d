//! Policy engine trait and the rule-table implementation.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::contracts::{DecisionInput, DecisionType, TextField};
use crate::decision::DecisionResult;

/// Errors surfaced by policy engines.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Input failed validation before evaluation.
    #[error("invalid decision input: {0}")]
    InvalidInput(&'static str),
    /// Rule configuration error.
    #[error("invalid policy rule `{rule}`: {reason}")]
    InvalidRule {
        /// Offending rule name, possibly empty.
        rule: String,
        /// What is wrong with it.
        reason: &'static str,
    },
}

/// Result alias for policy operations.
pub type PolicyResult<T> = Result<T, PolicyError>;

/// Trait implemented by policy engines.
///
/// Evaluation is pure: no I/O and no side effects, so the same input always
/// yields the same [`Evaluation`].
pub trait PolicyEngine: Send + Sync {
    /// Evaluates the supplied input.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidInput`] for inputs the engine cannot judge.
    fn evaluate(&self, input: &DecisionInput) -> PolicyResult<Evaluation>;
}

/// Result of evaluating one [`DecisionInput`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Evaluation {
    allow: bool,
    deny_reasons: Vec<String>,
    require_approval: bool,
    approval_reasons: Vec<String>,
    matched_rules: Vec<String>,
}

impl Evaluation {
    /// Whether the action may proceed without further checks.
    #[must_use]
    pub fn allow(&self) -> bool {
        self.allow
    }

    /// Reasons of every deny rule that matched, or of the default denial.
    #[must_use]
    pub fn deny_reasons(&self) -> &[String] {
        &self.deny_reasons
    }

    /// Whether a human must approve the action.
    #[must_use]
    pub fn require_approval(&self) -> bool {
        self.require_approval
    }

    /// Reasons of the approval rules that matched.
    #[must_use]
    pub fn approval_reasons(&self) -> &[String] {
        &self.approval_reasons
    }

    /// Names of the rules that contributed to the outcome.
    #[must_use]
    pub fn matched_rules(&self) -> &[String] {
        &self.matched_rules
    }

    /// Collapses the evaluation into a single verdict.
    #[must_use]
    pub fn verdict(&self) -> DecisionResult {
        if self.allow {
            DecisionResult::Allow
        } else if self.require_approval {
            DecisionResult::RequireApproval
        } else {
            DecisionResult::Deny
        }
    }

    /// Human-readable explanation of the verdict.
    #[must_use]
    pub fn reason(&self) -> String {
        match self.verdict() {
            DecisionResult::Deny => self.deny_reasons.join("; "),
            DecisionResult::RequireApproval => self.approval_reasons.join("; "),
            DecisionResult::Allow => format!("allowed by {}", self.matched_rules.join(", ")),
        }
    }
}

/// Host-supplied predicate usable as a rule condition.
#[derive(Clone)]
pub struct Predicate(Arc<dyn Fn(&DecisionInput) -> bool + Send + Sync>);

impl Predicate {
    /// Wraps a pure function over the decision input.
    pub fn new(predicate: impl Fn(&DecisionInput) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Predicate(..)")
    }
}

/// Condition under which a rule fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    /// Always matches.
    Always,
    /// Matches one checkpoint.
    DecisionType {
        /// Checkpoint to match.
        decision_type: DecisionType,
    },
    /// Matches when the tool name is in the set.
    ToolIn {
        /// Tool names.
        tools: BTreeSet<String>,
    },
    /// Matches when the agent id is in the set.
    AgentIn {
        /// Agent ids.
        agents: BTreeSet<String>,
    },
    /// Matches when a text field contains `needle`.
    TextContains {
        /// Field to search.
        field: TextField,
        /// Substring to look for.
        needle: String,
        /// Compare without regard to case.
        #[serde(default)]
        case_insensitive: bool,
    },
    /// Matches when a text field is longer than `max_chars` characters.
    TextLongerThan {
        /// Field to measure.
        field: TextField,
        /// Largest accepted length.
        max_chars: usize,
    },
    /// Matches when the context entry equals `value`.
    ContextEquals {
        /// Context key.
        key: String,
        /// Expected value.
        value: Value,
    },
    /// Matches when the context entry is the boolean `true`.
    ContextFlag {
        /// Context key.
        key: String,
    },
    /// Matches when every nested condition matches.
    All {
        /// Nested conditions.
        conditions: Vec<Condition>,
    },
    /// Matches when at least one nested condition matches.
    AnyOf {
        /// Nested conditions.
        conditions: Vec<Condition>,
    },
    /// Inverts a condition.
    Not {
        /// Condition to invert.
        condition: Box<Condition>,
    },
    /// Host-supplied predicate; not representable in configuration files.
    #[serde(skip)]
    Custom(Predicate),
}

impl Condition {
    /// Matches when the tool name is one of `tools`.
    pub fn tool_in<I, S>(tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::ToolIn {
            tools: tools.into_iter().map(Into::into).collect(),
        }
    }

    /// Matches when `field` contains `needle`, ignoring case.
    pub fn text_contains(field: TextField, needle: impl Into<String>) -> Self {
        Self::TextContains {
            field,
            needle: needle.into(),
            case_insensitive: true,
        }
    }

    /// Matches one checkpoint.
    #[must_use]
    pub fn decision_type(decision_type: DecisionType) -> Self {
        Self::DecisionType { decision_type }
    }

    /// Matches when the host predicate returns `true`.
    pub fn custom(predicate: impl Fn(&DecisionInput) -> bool + Send + Sync + 'static) -> Self {
        Self::Custom(Predicate::new(predicate))
    }

    /// Evaluates the condition against `input`.
    #[must_use]
    pub fn matches(&self, input: &DecisionInput) -> bool {
        match self {
            Self::Always => true,
            Self::DecisionType { decision_type } => input.decision_type() == *decision_type,
            Self::ToolIn { tools } => input.tool_name().is_some_and(|tool| tools.contains(tool)),
            Self::AgentIn { agents } => input.agent_id().is_some_and(|agent| agents.contains(agent)),
            Self::TextContains {
                field,
                needle,
                case_insensitive,
            } => input.text(*field).is_some_and(|text| {
                if *case_insensitive {
                    text.to_lowercase().contains(&needle.to_lowercase())
                } else {
                    text.contains(needle.as_str())
                }
            }),
            Self::TextLongerThan { field, max_chars } => input
                .text(*field)
                .is_some_and(|text| text.chars().count() > *max_chars),
            Self::ContextEquals { key, value } => input.context().get(key) == Some(value),
            Self::ContextFlag { key } => input.context().get(key) == Some(&Value::Bool(true)),
            Self::All { conditions } => conditions.iter().all(|condition| condition.matches(input)),
            Self::AnyOf { conditions } => conditions.iter().any(|condition| condition.matches(input)),
            Self::Not { condition } => !condition.matches(input),
            Self::Custom(predicate) => (predicate.0)(input),
        }
    }
}

/// What a matching rule does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "effect", rename_all = "snake_case")]
pub enum RuleEffect {
    /// Reject the action.
    Deny {
        /// Explanation recorded with the decision.
        reason: String,
    },
    /// Hold the action for human approval.
    RequireApproval {
        /// Explanation recorded with the decision.
        reason: String,
    },
    /// Permit the action.
    Allow,
}

/// Named rule pairing a condition with an effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    name: String,
    #[serde(flatten)]
    effect: RuleEffect,
    when: Condition,
}

impl PolicyRule {
    /// Creates a new rule.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidRule`] when the name is empty or a deny or
    /// approval rule carries no reason.
    pub fn new(name: impl Into<String>, effect: RuleEffect, when: Condition) -> PolicyResult<Self> {
        let rule = Self {
            name: name.into(),
            effect,
            when,
        };
        rule.validate()?;
        Ok(rule)
    }

    /// Deny rule.
    ///
    /// # Errors
    ///
    /// See [`PolicyRule::new`].
    pub fn deny(name: impl Into<String>, reason: impl Into<String>, when: Condition) -> PolicyResult<Self> {
        Self::new(name, RuleEffect::Deny { reason: reason.into() }, when)
    }

    /// Approval rule.
    ///
    /// # Errors
    ///
    /// See [`PolicyRule::new`].
    pub fn require_approval(
        name: impl Into<String>,
        reason: impl Into<String>,
        when: Condition,
    ) -> PolicyResult<Self> {
        Self::new(name, RuleEffect::RequireApproval { reason: reason.into() }, when)
    }

    /// Allow rule.
    ///
    /// # Errors
    ///
    /// See [`PolicyRule::new`].
    pub fn allow(name: impl Into<String>, when: Condition) -> PolicyResult<Self> {
        Self::new(name, RuleEffect::Allow, when)
    }

    /// Returns the rule name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the rule effect.
    #[must_use]
    pub fn effect(&self) -> &RuleEffect {
        &self.effect
    }

    fn validate(&self) -> PolicyResult<()> {
        let invalid = |reason| PolicyError::InvalidRule {
            rule: self.name.clone(),
            reason,
        };
        if self.name.trim().is_empty() {
            return Err(invalid("rule name cannot be empty"));
        }
        match &self.effect {
            RuleEffect::Deny { reason } | RuleEffect::RequireApproval { reason }
                if reason.trim().is_empty() =>
            {
                Err(invalid("deny and approval rules need a reason"))
            }
            _ => Ok(()),
        }
    }
}

/// Ordered rule table.
///
/// The default table holds a single allow-all rule so that an unconfigured
/// deployment observes without blocking; [`RuleSet::empty`] denies everything.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSet {
    rules: Vec<PolicyRule>,
}

impl RuleSet {
    /// Table without rules; every input falls through to the default deny.
    #[must_use]
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Appends a rule.
    #[must_use]
    pub fn with_rule(mut self, rule: PolicyRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Appends a rule in place.
    pub fn push(&mut self, rule: PolicyRule) {
        self.rules.push(rule);
    }

    /// Rules in insertion order.
    #[must_use]
    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    /// Checks every rule, for tables loaded from configuration.
    ///
    /// # Errors
    ///
    /// Returns the first [`PolicyError::InvalidRule`] found.
    pub fn validate(&self) -> PolicyResult<()> {
        self.rules.iter().try_for_each(PolicyRule::validate)
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            rules: vec![PolicyRule {
                name: "allow-all".to_owned(),
                effect: RuleEffect::Allow,
                when: Condition::Always,
            }],
        }
    }
}

/// In-memory engine over a [`RuleSet`].
///
/// Evaluation runs in stages: every matching deny rule is collected and, if
/// any matched, the outcome is a denial carrying all their reasons. Otherwise
/// matching approval rules hold the action for review, then a matching allow
/// rule permits it. Nothing matching is a denial. Deny therefore always wins
/// over approval and allow.
#[derive(Debug, Default)]
pub struct RuleBasedEngine {
    rules: RwLock<RuleSet>,
}

/// Reason recorded when no rule matched.
pub const DEFAULT_DENY_REASON: &str = "no policy rule allowed the request";

impl RuleBasedEngine {
    /// Constructs an engine over `rules`.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidRule`] for malformed rules.
    pub fn new(rules: RuleSet) -> PolicyResult<Self> {
        rules.validate()?;
        Ok(Self {
            rules: RwLock::new(rules),
        })
    }

    /// Appends a rule at the end of the table.
    pub fn add_rule(&self, rule: PolicyRule) {
        self.rules.write().push(rule);
    }

    /// Swaps the whole table atomically.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidRule`] and keeps the current table when
    /// the replacement is malformed.
    pub fn replace_rules(&self, rules: RuleSet) -> PolicyResult<()> {
        rules.validate()?;
        *self.rules.write() = rules;
        Ok(())
    }
}

impl PolicyEngine for RuleBasedEngine {
    fn evaluate(&self, input: &DecisionInput) -> PolicyResult<Evaluation> {
        if input.decision_type() == DecisionType::ToolCall && input.tool_name().is_none() {
            return Err(PolicyError::InvalidInput("tool_call decisions require a tool name"));
        }

        let guard = self.rules.read();
        let matching: Vec<&PolicyRule> = guard
            .rules()
            .iter()
            .filter(|rule| rule.when.matches(input))
            .collect();

        let mut evaluation = Evaluation::default();

        for rule in &matching {
            if let RuleEffect::Deny { reason } = &rule.effect {
                debug!(rule = rule.name(), decision_type = %input.decision_type(), "deny rule matched");
                evaluation.deny_reasons.push(reason.clone());
                evaluation.matched_rules.push(rule.name.clone());
            }
        }
        if !evaluation.deny_reasons.is_empty() {
            warn!(
                decision_type = %input.decision_type(),
                tool = ?input.tool_name(),
                reasons = ?evaluation.deny_reasons,
                "policy denied request"
            );
            return Ok(evaluation);
        }

        for rule in &matching {
            if let RuleEffect::RequireApproval { reason } = &rule.effect {
                debug!(rule = rule.name(), decision_type = %input.decision_type(), "approval rule matched");
                evaluation.require_approval = true;
                evaluation.approval_reasons.push(reason.clone());
                evaluation.matched_rules.push(rule.name.clone());
            }
        }
        if evaluation.require_approval {
            return Ok(evaluation);
        }

        if let Some(rule) = matching.iter().find(|rule| rule.effect == RuleEffect::Allow) {
            debug!(rule = rule.name(), decision_type = %input.decision_type(), "allow rule matched");
            evaluation.allow = true;
            evaluation.matched_rules.push(rule.name.clone());
            return Ok(evaluation);
        }

        debug!(decision_type = %input.decision_type(), "no rule matched; denying");
        evaluation.deny_reasons.push(DEFAULT_DENY_REASON.to_owned());
        Ok(evaluation)
    }
}
