//! OpenAI-compatible implementation of the [`LanguageModel`] trait.
//!
//! Speaks the `/chat/completions` wire format, which most hosted
//! providers accept. The model name sent on the wire is the last
//! `/`-separated segment of the provider identifier, so
//! "openai/gpt-4o" becomes "gpt-4o".

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{LmError, LmResult, PipelineError};
use crate::lm::{LanguageModel, LmMessage, LmRequest, LmResponse, LmUsage};

/// Chat-completions client for OpenAI-compatible endpoints.
#[derive(Clone)]
pub struct OpenAiLm {
    client: Client,
    api_key: String,
    base_url: String,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [LmMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    usage: Option<LmUsage>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Deserialize)]
struct WireMessage {
    content: String,
}

impl OpenAiLm {
    /// Create a client with the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.openai.com/v1".to_string(),
        }
    }

    /// Create from the `OPENAI_API_KEY` environment variable.
    ///
    /// The key is required before any LM call; absence is a fatal
    /// configuration error.
    pub fn from_env() -> Result<Self, PipelineError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| PipelineError::Config("OPENAI_API_KEY not set".into()))?;
        Ok(Self::new(api_key))
    }

    /// Set a custom base URL (for proxies and test servers).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Wire model name for a provider identifier.
    fn model_name(provider: &str) -> &str {
        provider.rsplit('/').next().unwrap_or(provider)
    }
}

#[async_trait]
impl LanguageModel for OpenAiLm {
    async fn complete(&self, request: LmRequest) -> LmResult<LmResponse> {
        let start = std::time::Instant::now();
        let model = Self::model_name(&request.provider);

        let body = WireRequest {
            model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                warn!(model = %model, error = %e, "LM request failed");
                LmError::Network(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!(model = %model, status = %status, error = %error_text, "LM API error");
            return Err(LmError::Api(format!("{status}: {error_text}")));
        }

        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| LmError::Parse(e.to_string()))?;

        let usage = wire.usage.unwrap_or_default();
        let content = wire
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| LmError::Api("no choices in response".into()))?;

        debug!(
            model = %model,
            duration_ms = start.elapsed().as_millis(),
            total_tokens = usage.total_tokens,
            "LM completion"
        );

        Ok(LmResponse { content, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_name_strips_provider_prefix() {
        assert_eq!(OpenAiLm::model_name("openai/gpt-4o"), "gpt-4o");
        assert_eq!(OpenAiLm::model_name("gpt-4o-mini"), "gpt-4o-mini");
        assert_eq!(OpenAiLm::model_name("azure/org/o1-mini"), "o1-mini");
    }

    #[test]
    fn test_client_builder() {
        let client = OpenAiLm::new("sk-test").with_base_url("http://127.0.0.1:1");
        assert_eq!(client.base_url, "http://127.0.0.1:1");
    }

    #[test]
    fn test_wire_request_omits_absent_knobs() {
        let messages = vec![LmMessage::user("hi")];
        let body = WireRequest {
            model: "o1-mini",
            messages: &messages,
            temperature: None,
            max_tokens: None,
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(!json.contains("temperature"));
        assert!(!json.contains("max_tokens"));
    }
}
