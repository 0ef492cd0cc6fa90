//! JSON payloads exchanged with the engine
//!
//! The boundary passes these texts through untouched. These helpers are for
//! callers that build requests and read responses: messages and options are
//! serialized with proper escaping, and the response document is read with
//! every field optional.

use serde::{Deserialize, Serialize};

/// One chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

/// Serialize messages into the `messages_json` argument
pub fn messages_json(messages: &[ChatMessage]) -> serde_json::Result<String> {
    serde_json::to_string(messages)
}

/// Sampling options, serialized into the `options_json` argument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionOptions {
    pub temperature: f64,
    pub top_k: u32,
    pub top_p: f64,
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_k: 40,
            top_p: 0.95,
            max_tokens: 1024,
            stop: Vec::new(),
        }
    }
}

impl CompletionOptions {
    /// Options from layered configuration
    pub fn from_config(config: &cactus_config::Config) -> Self {
        Self {
            temperature: config.temperature(),
            top_k: config.top_k(),
            top_p: config.top_p(),
            max_tokens: config.max_tokens(),
            stop: config.stop().to_vec(),
        }
    }

    pub fn options_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Engine response document
///
/// Missing fields take neutral defaults; a missing `response` leaves the
/// field empty and callers fall back to the raw text.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CompletionResult {
    pub success: bool,
    pub response: String,
    pub time_to_first_token_ms: f64,
    pub total_time_ms: f64,
    pub tokens_per_second: f64,
    pub prefill_tokens: u64,
    pub decode_tokens: u64,
    pub total_tokens: u64,
}

impl Default for CompletionResult {
    fn default() -> Self {
        Self {
            success: true,
            response: String::new(),
            time_to_first_token_ms: 0.0,
            total_time_ms: 0.0,
            tokens_per_second: 0.0,
            prefill_tokens: 0,
            decode_tokens: 0,
            total_tokens: 0,
        }
    }
}

impl CompletionResult {
    /// Parse response text read from the buffer
    ///
    /// Fails for text that is not a JSON object, which includes a response
    /// cut short by truncation.
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        let mut result: Self = serde_json::from_str(text)?;
        if result.response.is_empty() && !text.contains("\"response\"") {
            result.response = text.to_string();
        }
        Ok(result)
    }
}
