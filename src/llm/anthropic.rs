//! Anthropic Messages API client.
//!
//! Non-streaming client for the `/v1/messages` endpoint. Structured output
//! uses forced tool choice: the request declares exactly one tool and
//! `tool_choice` pins the model to it, so the response carries the stage's
//! answer as the tool input rather than free text.

use std::time::Instant;

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use super::{CallUsage, CompletionRequest, LlmClient, LlmError, StructuredRequest};
use crate::config::LlmConfig;
use crate::prompts::ModelTier;

/// Anthropic Claude API client.
#[derive(Debug, Clone)]
pub struct AnthropicClient {
    client: Client,
    base_url: String,
    api_key: String,
    weak_model: String,
    planning_model: String,
    developer_model: String,
    max_tokens: u32,
    debug: bool,
}

impl AnthropicClient {
    /// Build a client from configuration.
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or(LlmError::MissingApiKey)?;

        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .expect("Failed to create HTTP client");

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            api_key,
            weak_model: config.weak_model.clone(),
            planning_model: config.planning_model.clone(),
            developer_model: config.developer_model.clone(),
            max_tokens: config.max_tokens,
            debug: config.debug,
        })
    }

    /// Build the API URL.
    fn api_url(&self) -> String {
        format!("{}/v1/messages", self.base_url.trim_end_matches('/'))
    }

    /// Resolve a tier to a concrete model id.
    #[must_use]
    pub fn model_for_tier(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Weak => &self.weak_model,
            ModelTier::Planning => &self.planning_model,
            ModelTier::Developer => &self.developer_model,
        }
    }

    async fn post_messages(&self, body: &serde_json::Value) -> Result<MessagesResponse, LlmError> {
        let response = self
            .client
            .post(self.api_url())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Provider { status, message });
        }

        Ok(response.json::<MessagesResponse>().await?)
    }
}

#[async_trait::async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(&self, req: CompletionRequest) -> Result<(String, CallUsage), LlmError> {
        let model = self.model_for_tier(req.tier);

        let mut body = json!({
            "model": model,
            "max_tokens": self.max_tokens,
            "temperature": req.temperature,
            "messages": [{"role": "user", "content": req.user_prompt}],
        });
        if let Some(system) = &req.system_prompt {
            body["system"] = json!(system);
        }

        let start = Instant::now();
        let response = self.post_messages(&body).await?;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let text = response
            .content
            .iter()
            .find_map(|block| block.text.clone())
            .unwrap_or_default();

        let usage = CallUsage {
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
            elapsed_ms,
            model: Some(model.to_string()),
        };

        Ok((text, usage))
    }

    async fn complete_structured(
        &self,
        req: StructuredRequest,
    ) -> Result<(serde_json::Value, CallUsage), LlmError> {
        let StructuredRequest {
            tier,
            temperature,
            system_prompt,
            user_prompt,
            tool,
        } = req;
        let model = self.model_for_tier(tier);

        if self.debug {
            tracing::debug!(
                model = %model,
                tool = %tool.name,
                temperature = temperature,
                system_prompt = %system_prompt,
                user_prompt = %user_prompt,
                "LLM structured request"
            );
        }

        let body = json!({
            "model": model,
            "max_tokens": self.max_tokens,
            "temperature": temperature,
            "system": system_prompt,
            "messages": [{"role": "user", "content": user_prompt}],
            "tools": [{
                "name": tool.name.clone(),
                "description": tool.description,
                "input_schema": tool.input_schema,
            }],
            "tool_choice": {"type": "tool", "name": tool.name},
        });

        let start = Instant::now();
        let response = self.post_messages(&body).await?;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let usage = CallUsage {
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
            elapsed_ms,
            model: Some(model.to_string()),
        };

        let tool_input = response
            .content
            .into_iter()
            .find(|block| block.block_type == "tool_use")
            .and_then(|block| block.input)
            .ok_or(LlmError::MissingToolUse)?;

        if self.debug {
            tracing::debug!(
                model = %model,
                elapsed_ms = elapsed_ms,
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                response = %tool_input,
                "LLM structured response"
            );
        }

        Ok((tool_input, usage))
    }
}

/// Anthropic Messages API response.
#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
    input: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LlmConfig {
        LlmConfig {
            api_key: Some("test-key".to_string()),
            ..LlmConfig::default()
        }
    }

    #[test]
    fn test_requires_api_key() {
        let mut config = config();
        config.api_key = None;
        assert!(matches!(
            AnthropicClient::new(&config),
            Err(LlmError::MissingApiKey)
        ));

        config.api_key = Some(String::new());
        assert!(matches!(
            AnthropicClient::new(&config),
            Err(LlmError::MissingApiKey)
        ));
    }

    #[test]
    fn test_tier_resolution_uses_configured_models() {
        let mut config = config();
        config.weak_model = "model-w".into();
        config.planning_model = "model-p".into();
        config.developer_model = "model-d".into();

        let client = AnthropicClient::new(&config).unwrap();
        assert_eq!(client.model_for_tier(ModelTier::Weak), "model-w");
        assert_eq!(client.model_for_tier(ModelTier::Planning), "model-p");
        assert_eq!(client.model_for_tier(ModelTier::Developer), "model-d");
    }

    #[test]
    fn test_api_url_normalizes_trailing_slash() {
        let mut config = config();
        config.base_url = "https://api.anthropic.com/".into();
        let client = AnthropicClient::new(&config).unwrap();
        assert_eq!(client.api_url(), "https://api.anthropic.com/v1/messages");
    }

    #[test]
    fn test_response_parsing_extracts_tool_use() {
        let raw = serde_json::json!({
            "content": [
                {"type": "text", "text": "thinking..."},
                {"type": "tool_use", "id": "tu_1", "name": "provide_decision",
                 "input": {"action": "reject", "reasoning": "off topic"}}
            ],
            "usage": {"input_tokens": 120, "output_tokens": 40}
        });
        let parsed: MessagesResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.usage.input_tokens, 120);
        let tool = parsed
            .content
            .into_iter()
            .find(|b| b.block_type == "tool_use")
            .and_then(|b| b.input)
            .unwrap();
        assert_eq!(tool["action"], "reject");
    }
}
