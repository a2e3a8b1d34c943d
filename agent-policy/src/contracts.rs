//! Structured inputs handed to the policy evaluator.

use std::borrow::Cow;
use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Which checkpoint of an invocation a decision belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    /// Authorization of a single tool call.
    ToolCall,
    /// Check of the invocation input before execution.
    InputValidation,
    /// Check of the invocation output after execution.
    OutputValidation,
    /// Verdict of a human reviewer on an approval request.
    HumanReview,
}

impl Display for DecisionType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ToolCall => "tool_call",
            Self::InputValidation => "input_validation",
            Self::OutputValidation => "output_validation",
            Self::HumanReview => "human_review",
        })
    }
}

/// A tool call requested by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

impl ToolCall {
    /// Creates a tool call with JSON arguments.
    #[must_use]
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }

    /// Tool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Call arguments.
    #[must_use]
    pub fn arguments(&self) -> &Value {
        &self.arguments
    }
}

/// Text field a rule condition inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextField {
    /// The invocation input.
    Input,
    /// The invocation output.
    Output,
    /// Tool-call arguments rendered as JSON.
    ToolArguments,
}

/// Everything a rule may look at when deciding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionInput {
    decision_type: DecisionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    input_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output_text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    context: Map<String, Value>,
}

impl DecisionInput {
    /// Creates an empty input for the given checkpoint.
    #[must_use]
    pub fn new(decision_type: DecisionType) -> Self {
        Self {
            decision_type,
            agent_id: None,
            tool_name: None,
            request_id: None,
            input_text: None,
            output_text: None,
            tool_calls: Vec::new(),
            context: Map::new(),
        }
    }

    /// Sets the agent identifier.
    #[must_use]
    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Sets the tool name.
    #[must_use]
    pub fn with_tool(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    /// Sets the correlation id of the invocation.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Sets the input text.
    #[must_use]
    pub fn with_input_text(mut self, text: impl Into<String>) -> Self {
        self.input_text = Some(text.into());
        self
    }

    /// Sets the output text.
    #[must_use]
    pub fn with_output_text(mut self, text: impl Into<String>) -> Self {
        self.output_text = Some(text.into());
        self
    }

    /// Appends a tool call.
    #[must_use]
    pub fn with_tool_call(mut self, call: ToolCall) -> Self {
        self.tool_calls.push(call);
        self
    }

    /// Adds a context entry.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Checkpoint being decided.
    #[must_use]
    pub fn decision_type(&self) -> DecisionType {
        self.decision_type
    }

    /// Agent identifier, if known.
    #[must_use]
    pub fn agent_id(&self) -> Option<&str> {
        self.agent_id.as_deref()
    }

    /// Tool name, if the decision concerns a tool.
    #[must_use]
    pub fn tool_name(&self) -> Option<&str> {
        self.tool_name.as_deref()
    }

    /// Correlation id, if known.
    #[must_use]
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Tool calls under review.
    #[must_use]
    pub fn tool_calls(&self) -> &[ToolCall] {
        &self.tool_calls
    }

    /// Free-form context.
    #[must_use]
    pub fn context(&self) -> &Map<String, Value> {
        &self.context
    }

    /// Returns the content of `field`, or `None` when the input has none.
    #[must_use]
    pub fn text(&self, field: TextField) -> Option<Cow<'_, str>> {
        match field {
            TextField::Input => self.input_text.as_deref().map(Cow::Borrowed),
            TextField::Output => self.output_text.as_deref().map(Cow::Borrowed),
            TextField::ToolArguments if self.tool_calls.is_empty() => None,
            TextField::ToolArguments => Some(Cow::Owned(
                self.tool_calls
                    .iter()
                    .map(|call| call.arguments.to_string())
                    .collect::<Vec<_>>()
                    .join("\n"),
            )),
        }
    }
}
