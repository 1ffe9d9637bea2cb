//! LLM client abstraction.
//!
//! The [`LlmClient`] trait is the seam between the pipeline and the model
//! provider. Every pipeline stage uses [`LlmClient::complete_structured`]:
//! the provider is forced to answer through a single declared tool, and the
//! caller receives a value that deserializes into the stage's response type
//! or a categorized error, never malformed data.

pub mod anthropic;
pub mod schemas;

pub use anthropic::AnthropicClient;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::prompts::ModelTier;

/// Errors from LLM calls.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// No API key configured.
    #[error("no API key configured for the LLM provider")]
    MissingApiKey,
    /// Request never produced a provider response.
    #[error("LLM transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    /// Provider returned a non-success status.
    #[error("LLM provider error ({status}): {message}")]
    Provider {
        /// HTTP status code.
        status: u16,
        /// Provider error body.
        message: String,
    },
    /// The forced tool was not used in the response.
    #[error("no tool_use block in LLM response")]
    MissingToolUse,
    /// The tool input did not match the declared response type.
    #[error("LLM response failed validation for {type_name}: {source}")]
    SchemaValidation {
        /// The expected response type.
        type_name: &'static str,
        /// Deserialization failure.
        source: serde_json::Error,
    },
}

/// Token counts and timing for one LLM call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallUsage {
    /// Prompt tokens.
    pub input_tokens: u32,
    /// Completion tokens.
    pub output_tokens: u32,
    /// Wall-clock call time in milliseconds.
    pub elapsed_ms: u64,
    /// Concrete model id the call ran on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Tool declaration for structured output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name the model is forced to call.
    pub name: String,
    /// Tool description.
    pub description: String,
    /// JSON schema for the tool input.
    pub input_schema: serde_json::Value,
}

/// A free-form completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Model tier to run on.
    pub tier: ModelTier,
    /// Sampling temperature.
    pub temperature: f32,
    /// Optional system prompt.
    pub system_prompt: Option<String>,
    /// User prompt.
    pub user_prompt: String,
}

/// A structured-output request.
#[derive(Debug, Clone)]
pub struct StructuredRequest {
    /// Model tier to run on.
    pub tier: ModelTier,
    /// Sampling temperature.
    pub temperature: f32,
    /// System prompt.
    pub system_prompt: String,
    /// User prompt.
    pub user_prompt: String,
    /// The tool the model must answer through.
    pub tool: ToolSpec,
}

/// Client for a large-language-model provider.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Free-form text completion.
    async fn complete(&self, req: CompletionRequest) -> Result<(String, CallUsage), LlmError>;

    /// Structured completion; returns the raw tool input as JSON.
    async fn complete_structured(
        &self,
        req: StructuredRequest,
    ) -> Result<(serde_json::Value, CallUsage), LlmError>;
}

/// Typed wrapper around [`LlmClient::complete_structured`].
///
/// Deserialization failure is an [`LlmError::SchemaValidation`]; callers
/// never observe a value that does not match the stage's response type.
pub async fn call_structured<T: DeserializeOwned>(
    client: &dyn LlmClient,
    req: StructuredRequest,
) -> Result<(T, CallUsage), LlmError> {
    let (value, usage) = client.complete_structured(req).await?;
    let typed = serde_json::from_value(value).map_err(|source| LlmError::SchemaValidation {
        type_name: std::any::type_name::<T>(),
        source,
    })?;
    Ok((typed, usage))
}
