//! LLM message, tool, and request/response types.
//!
//! The engine talks to language models exclusively through these shapes;
//! no provider names appear anywhere in the core. `submit` and `abort`
//! are part of the interface contract itself: every schema-constrained
//! call carries them, and the model must end its turn with one of them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name of the built-in tool that proposes a configuration.
pub const SUBMIT_TOOL: &str = "submit";

/// Name of the built-in tool that gives up.
pub const ABORT_TOOL: &str = "abort";

/// Role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    /// Result of a tool invocation, fed back to the model.
    Tool,
}

/// A message in a healing or evaluation conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.into(),
        }
    }
}

/// A tool the model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema for the tool's arguments.
    pub parameters: Value,
    /// How many times the model may call this tool within one episode.
    /// `None` means unbounded. Built-in tools are always unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_uses: Option<u32>,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            max_uses: None,
        }
    }

    pub fn with_max_uses(mut self, max_uses: u32) -> Self {
        self.max_uses = Some(max_uses);
        self
    }

    /// The built-in `submit` tool carrying the endpoint schema.
    pub fn submit(schema: Value) -> Self {
        Self::new(
            SUBMIT_TOOL,
            "Propose the corrected step configuration. Arguments must conform to the \
             endpoint schema.",
            schema,
        )
    }

    /// The built-in `abort` tool.
    pub fn abort() -> Self {
        Self::new(
            ABORT_TOOL,
            "Give up: the failure cannot be fixed by changing the step configuration. \
             Provide a reason for the caller.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "reason": { "type": "string" }
                },
                "required": ["reason"]
            }),
        )
    }
}

/// A tool call emitted by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
}

/// Request for a schema-constrained structured generation.
#[derive(Debug, Clone)]
pub struct ObjectRequest {
    pub messages: Vec<ChatMessage>,
    /// Schema the `submit` arguments must conform to.
    pub schema: Value,
    pub temperature: f64,
    /// Tools offered this turn (always includes `submit` and `abort`).
    pub tools: Vec<ToolDefinition>,
}

/// What the model did with a structured request.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectOutcome {
    /// `submit(args)`: a proposed configuration.
    Submit(Value),
    /// `abort(reason)`: non-recoverable.
    Abort { reason: String },
    /// A custom tool call; the agent runs it and re-invokes.
    ToolUse(ToolCall),
}

/// Response to a structured generation: the outcome plus the message
/// history as the provider extended it.
#[derive(Debug, Clone)]
pub struct ObjectResponse {
    pub outcome: ObjectOutcome,
    pub messages: Vec<ChatMessage>,
}

/// Request for free-text generation.
#[derive(Debug, Clone)]
pub struct TextRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
}

/// Response to a free-text generation.
#[derive(Debug, Clone)]
pub struct TextResponse {
    pub content: String,
    pub messages: Vec<ChatMessage>,
}

/// Temperature ramp across healing attempts: `min(k · 0.1, 1.0)`.
pub fn temperature_for_attempt(attempt: u32) -> f64 {
    (f64::from(attempt) * 0.1).min(1.0)
}
