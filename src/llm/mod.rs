//! LLM access layer.
//!
//! One trait seam (`LlmClient`) covers both the diagnosis drafter and the
//! safety classifier, so tests can substitute canned responses and the
//! worker never touches HTTP directly.

pub mod extract;
pub mod ollama;

pub use extract::extract_json_block;
pub use ollama::OllamaClient;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("Cannot connect to LLM service at {0}")]
    Connection(String),

    #[error("LLM request timed out after {0}s")]
    Timeout(u64),

    #[error("HTTP client error: {0}")]
    Http(String),

    #[error("LLM service returned {status}: {body}")]
    Service { status: u16, body: String },

    #[error("Response parsing error: {0}")]
    ResponseParsing(String),
}

/// One generation request. The response is free text that may wrap its JSON
/// payload in markdown fencing; callers parse with [`extract_json_block`].
#[derive(Debug, Clone)]
pub struct LlmRequest<'a> {
    pub model: &'a str,
    pub system_prompt: &'a str,
    pub user_prompt: &'a str,
    pub max_tokens: u32,
}

/// Blocking LLM client seam.
pub trait LlmClient: Send + Sync {
    fn generate(&self, request: &LlmRequest<'_>) -> Result<String, LlmError>;
}
