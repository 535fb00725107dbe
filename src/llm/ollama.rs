use serde::{Deserialize, Serialize};

use super::{LlmClient, LlmError, LlmRequest};

/// Blocking HTTP client for an Ollama-compatible `/api/generate` endpoint.
///
/// The request timeout is the pipeline's only defense against a hung model
/// call; a timeout surfaces as a terminal [`LlmError::Timeout`], never as an
/// indefinite block.
pub struct OllamaClient {
    base_url: String,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
}

impl OllamaClient {
    pub fn new(base_url: &str, timeout_secs: u64) -> Self {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            timeout_secs,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Request body for /api/generate.
#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    num_predict: u32,
}

/// Response body from /api/generate.
#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

impl LlmClient for OllamaClient {
    fn generate(&self, request: &LlmRequest<'_>) -> Result<String, LlmError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = GenerateRequest {
            model: request.model,
            prompt: request.user_prompt,
            system: request.system_prompt,
            stream: false,
            options: GenerateOptions {
                num_predict: request.max_tokens,
            },
        };

        let response = self.client.post(&url).json(&body).send().map_err(|e| {
            if e.is_connect() {
                LlmError::Connection(self.base_url.clone())
            } else if e.is_timeout() {
                LlmError::Timeout(self.timeout_secs)
            } else {
                LlmError::Http(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(LlmError::Service {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: GenerateResponse = response
            .json()
            .map_err(|e| LlmError::ResponseParsing(e.to_string()))?;

        Ok(parsed.response)
    }
}
