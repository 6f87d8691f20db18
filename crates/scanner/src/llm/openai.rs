//! OpenAI-shaped chat-completions client. DeepSeek and compatible
//! gateways share this wire format under different defaults.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::provider::{build_http_client, with_retries, Analyzer, LlmError};

const DEFAULT_TEMPERATURE: f64 = 0.1;
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone)]
pub struct ChatClientConfig {
    pub label: String,
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
    pub proxy: Option<String>,
}

pub struct ChatCompletionsClient {
    label: String,
    api_key: String,
    base_url: String,
    model: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

impl ChatCompletionsClient {
    pub fn new(config: ChatClientConfig) -> Result<Self, LlmError> {
        if config.api_key.trim().is_empty() {
            return Err(LlmError::Fatal {
                status: 0,
                message: format!("{}: api key is required", config.label),
            });
        }
        Ok(Self {
            http: build_http_client(config.timeout, config.proxy.as_deref())?,
            label: config.label,
            api_key: config.api_key,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model,
        })
    }

    fn request_body(&self, prompt: &str, json_mode: bool) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": DEFAULT_TEMPERATURE,
            "max_completion_tokens": DEFAULT_MAX_TOKENS,
        });
        if json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }
        body
    }

    async fn send(&self, body: &Value) -> Result<String, LlmError> {
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(LlmError::from_status(status.as_u16(), text));
        }

        let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| LlmError::Transient {
            status: None,
            message: format!("malformed response: {e}"),
        })?;
        if let Some(error) = parsed.error {
            return Err(LlmError::Fatal {
                status: status.as_u16(),
                message: error.message,
            });
        }
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.is_empty())
            .ok_or(LlmError::EmptyResponse)
    }
}

#[async_trait]
impl Analyzer for ChatCompletionsClient {
    async fn analyze(&self, prompt: &str) -> Result<String, LlmError> {
        let body = self.request_body(prompt, false);
        with_retries(&self.label, || self.send(&body)).await
    }

    async fn analyze_json(&self, prompt: &str) -> Result<String, LlmError> {
        let body = self.request_body(prompt, true);
        match with_retries(&self.label, || self.send(&body)).await {
            Ok(content) => Ok(content),
            // Some gateways reject the response-format hint outright;
            // retransmit as a plain completion.
            Err(e) if e.is_json_mode_rejection() => self.analyze(prompt).await,
            Err(e) => Err(e),
        }
    }

    fn name(&self) -> String {
        format!("{} ({})", self.label, self.model)
    }
}

/// Provider defaults for the chat-completions wire shape.
pub fn chat_defaults(provider: &str) -> (&'static str, &'static str) {
    match provider {
        "deepseek" => ("https://api.deepseek.com/v1", "deepseek-chat"),
        _ => ("https://api.openai.com/v1", "gpt-4-turbo"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(json_mode: bool) -> (ChatCompletionsClient, Value) {
        let client = ChatCompletionsClient::new(ChatClientConfig {
            label: "openai".to_string(),
            api_key: "sk-test".to_string(),
            base_url: "https://api.openai.com/v1/".to_string(),
            model: "gpt-4-turbo".to_string(),
            timeout: Duration::from_secs(5),
            proxy: None,
        })
        .unwrap();
        let body = client.request_body("hello", json_mode);
        (client, body)
    }

    #[test]
    fn test_request_body_shape() {
        let (_, body) = client(false);
        assert_eq!(body["model"], "gpt-4-turbo");
        assert_eq!(body["messages"][0]["role"], "user");
        assert!(body.get("response_format").is_none());

        let (_, body) = client(true);
        assert_eq!(body["response_format"]["type"], "json_object");
    }

    #[test]
    fn test_missing_api_key_rejected() {
        let result = ChatCompletionsClient::new(ChatClientConfig {
            label: "openai".to_string(),
            api_key: "  ".to_string(),
            base_url: String::new(),
            model: String::new(),
            timeout: Duration::from_secs(5),
            proxy: None,
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_chat_defaults() {
        assert_eq!(chat_defaults("deepseek").1, "deepseek-chat");
        assert_eq!(chat_defaults("openai").0, "https://api.openai.com/v1");
    }
}
