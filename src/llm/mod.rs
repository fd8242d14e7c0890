//! LLM abstraction.
//!
//! The healing agent and response evaluator consume language models
//! through [`LlmClient`] only. Providers plug in behind this trait;
//! the core never references any of them.

mod types;

pub use types::{
    temperature_for_attempt, ChatMessage, ChatRole, ObjectOutcome, ObjectRequest, ObjectResponse,
    TextRequest, TextResponse, ToolCall, ToolDefinition, ABORT_TOOL, SUBMIT_TOOL,
};

use async_trait::async_trait;

use crate::error::Result;

/// The contract the engine requires of a language model.
///
/// Implementations must be thread-safe; one client instance is shared
/// across concurrent healing episodes.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Free-text generation.
    async fn generate_text(&self, request: TextRequest) -> Result<TextResponse>;

    /// Schema-constrained generation. The model must finish the turn by
    /// calling exactly one of the offered tools; `submit` arguments must
    /// conform to `request.schema`.
    async fn generate_object(&self, request: ObjectRequest) -> Result<ObjectResponse>;
}
