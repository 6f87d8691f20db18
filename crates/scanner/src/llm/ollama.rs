//! Local Ollama-style `api/generate` client. No API key, no JSON mode.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::provider::{build_http_client, with_retries, Analyzer, LlmError};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

pub struct OllamaClient {
    base_url: String,
    model: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

impl OllamaClient {
    pub fn new(
        base_url: &str,
        model: &str,
        timeout: Duration,
        proxy: Option<&str>,
    ) -> Result<Self, LlmError> {
        if model.trim().is_empty() {
            return Err(LlmError::Fatal {
                status: 0,
                message: "local llm: model name is required".to_string(),
            });
        }
        let base_url = if base_url.trim().is_empty() {
            DEFAULT_BASE_URL
        } else {
            base_url
        };
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            http: build_http_client(timeout, proxy)?,
        })
    }

    async fn send(&self, prompt: &str) -> Result<String, LlmError> {
        let body = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });
        let response = self
            .http
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::from_status(status.as_u16(), text));
        }
        let parsed: GenerateResponse =
            serde_json::from_str(&text).map_err(|e| LlmError::Transient {
                status: None,
                message: format!("malformed response: {e}"),
            })?;
        if parsed.response.is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(parsed.response)
    }
}

#[async_trait]
impl Analyzer for OllamaClient {
    async fn analyze(&self, prompt: &str) -> Result<String, LlmError> {
        with_retries("ollama", || self.send(prompt)).await
    }

    fn name(&self) -> String {
        format!("Ollama ({})", self.model)
    }
}
