//! Inference trait: the boundary to the hosted language model.
//!
//! The collaborator receives the settled conversation history, the
//! aggregated tool set and the new user message, and returns one final
//! assistant message. It may call tools through the supplied
//! [`ToolInvoker`] any number of times before answering.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::InferenceError;
use crate::message::Turn;
use crate::tool::{ToolDescriptor, ToolInvoker};

/// Everything the collaborator needs for one completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceRequest {
    /// Prior turns, oldest first, always ending with an assistant turn (or empty).
    pub history: Vec<Turn>,

    /// Tools currently available across all ready servers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDescriptor>,

    /// The new user message.
    pub message: String,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Record of one tool call made while producing a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub server_id: String,
    pub tool_name: String,
    pub success: bool,
}

/// The final assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub content: String,

    /// Which model actually responded
    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_invocations: Vec<ToolInvocation>,
}

impl InferenceResponse {
    pub fn text(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model: model.into(),
            usage: None,
            tool_invocations: Vec::new(),
        }
    }
}

/// The inference collaborator.
#[async_trait]
pub trait Inference: Send + Sync {
    /// A human-readable name (e.g., "openrouter", "ollama").
    fn name(&self) -> &str;

    /// Produce the assistant reply for `request`.
    async fn infer(
        &self,
        request: InferenceRequest,
        tools: Arc<dyn ToolInvoker>,
    ) -> Result<InferenceResponse, InferenceError>;

    /// Can we reach the endpoint?
    async fn health_check(&self) -> Result<bool, InferenceError> {
        Ok(true)
    }
}
