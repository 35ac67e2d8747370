//! Language-model client contract.
//!
//! The pipeline only needs one capability from a provider: complete a
//! chat request and report token usage. Implementations wrap concrete
//! providers; [`OpenAiLm`] is the bundled reference implementation.
//!
//! Provider quirks are handled at request construction: models whose
//! identifier contains `o1` (case-insensitive) reject a system role,
//! `temperature`, and `max_tokens`, so [`LmRequest::chat`] collapses
//! the prompt into a single user message and omits both knobs for them.

pub mod openai;

pub use openai::OpenAiLm;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LmResult;

/// One chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LmMessage {
    /// Role: "system" or "user"
    pub role: String,

    /// Message content
    pub content: String,
}

impl LmMessage {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// A provider-agnostic completion request.
#[derive(Debug, Clone)]
pub struct LmRequest {
    /// Opaque provider identifier (e.g. "openai/gpt-4o")
    pub provider: String,

    /// Conversation messages
    pub messages: Vec<LmMessage>,

    /// Sampling temperature; omitted for single-message providers
    pub temperature: Option<f32>,

    /// Completion token cap; omitted for single-message providers
    pub max_tokens: Option<u32>,
}

impl LmRequest {
    /// Build a system+user chat request, applying provider quirks.
    pub fn chat(
        provider: impl Into<String>,
        system: impl Into<String>,
        user: impl Into<String>,
        temperature: f32,
        max_tokens: Option<u32>,
    ) -> Self {
        let provider = provider.into();
        let system = system.into();
        let user = user.into();

        if Self::single_message_provider(&provider) {
            return Self {
                provider,
                messages: vec![LmMessage::user(format!("{system}\n\n{user}"))],
                temperature: None,
                max_tokens: None,
            };
        }

        Self {
            provider,
            messages: vec![LmMessage::system(system), LmMessage::user(user)],
            temperature: Some(temperature),
            max_tokens,
        }
    }

    /// Providers that reject a system role and sampling parameters.
    pub fn single_message_provider(provider: &str) -> bool {
        provider.to_ascii_lowercase().contains("o1")
    }

    /// Concatenated content of all messages, for matching in tests.
    pub fn joined_content(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Token usage reported for one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LmUsage {
    /// Tokens in the prompt
    pub prompt_tokens: u64,

    /// Tokens in the completion
    pub completion_tokens: u64,

    /// Total tokens used
    pub total_tokens: u64,
}

/// A completed chat response.
#[derive(Debug, Clone)]
pub struct LmResponse {
    /// Response text
    pub content: String,

    /// Token usage (zeros when the provider omits it)
    pub usage: LmUsage,
}

/// Capability interface the pipeline requires from a provider adapter.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Issue one completion request.
    async fn complete(&self, request: LmRequest) -> LmResult<LmResponse>;
}

/// Truncate a string to at most `max_bytes` bytes at a char boundary.
///
/// Used to take the deterministic content sample the filter prompts
/// with.
pub fn truncate_to_char_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    &s[..end]
}

/// Strip a wrapping markdown code fence from a response.
pub fn strip_code_blocks(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_request_two_messages() {
        let req = LmRequest::chat("openai/gpt-4o", "sys", "usr", 0.1, Some(4096));
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].role, "system");
        assert_eq!(req.messages[1].role, "user");
        assert_eq!(req.temperature, Some(0.1));
        assert_eq!(req.max_tokens, Some(4096));
    }

    #[test]
    fn test_chat_request_o1_quirk() {
        for provider in ["openai/o1-mini", "openai/O1-preview", "azure/foo-o1"] {
            let req = LmRequest::chat(provider, "sys", "usr", 0.1, Some(4096));
            assert_eq!(req.messages.len(), 1, "provider {provider}");
            assert_eq!(req.messages[0].role, "user");
            assert!(req.messages[0].content.contains("sys"));
            assert!(req.messages[0].content.contains("usr"));
            assert_eq!(req.temperature, None);
            assert_eq!(req.max_tokens, None);
        }

        assert!(!LmRequest::single_message_provider("openai/gpt-4o"));
    }

    #[test]
    fn test_truncate_to_char_boundary() {
        let text = "Hello 世界";
        let truncated = truncate_to_char_boundary(text, 8);
        assert!(truncated.len() <= 8);
        assert!(text.starts_with(truncated));
    }

    #[test]
    fn test_strip_code_blocks() {
        assert_eq!(strip_code_blocks("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("```\n{}\n```"), "{}");
        assert_eq!(strip_code_blocks("{}"), "{}");
    }
}
