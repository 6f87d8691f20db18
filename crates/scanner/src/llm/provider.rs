//! Provider capability interface and the shared retry policy.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum LlmError {
    /// 429, 5xx, timeouts and network faults. Retried with exponential
    /// backoff at the client layer.
    #[error("transient api error: {message}")]
    Transient { status: Option<u16>, message: String },

    /// 4xx other than 408/429, policy rejections. Never retried.
    #[error("api error {status}: {message}")]
    Fatal { status: u16, message: String },

    #[error("request timed out")]
    Timeout,

    #[error("no content in response")]
    EmptyResponse,
}

impl LlmError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout)
    }

    /// A 400 complaining about the JSON response-format hint; the caller
    /// retransmits without the hint.
    pub fn is_json_mode_rejection(&self) -> bool {
        match self {
            Self::Fatal { status: 400, message } => {
                let lower = message.to_lowercase();
                lower.contains("response_format") || lower.contains("json")
            }
            _ => false,
        }
    }

    pub fn from_status(status: u16, message: String) -> Self {
        if status == 429 || status == 408 || status >= 500 {
            Self::Transient {
                status: Some(status),
                message,
            }
        } else {
            Self::Fatal { status, message }
        }
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Self::Timeout;
        }
        Self::Transient {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }
}

/// One model endpoint. `analyze_json` defaults to the plain call for
/// providers without a JSON mode.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, prompt: &str) -> Result<String, LlmError>;

    async fn analyze_json(&self, prompt: &str) -> Result<String, LlmError> {
        self.analyze(prompt).await
    }

    fn name(&self) -> String;
}

pub(crate) const MAX_RETRIES: u32 = 3;
const BASE_BACKOFF: Duration = Duration::from_secs(2);

/// Runs a request up to `1 + MAX_RETRIES` times, backing off `2s·2ⁿ`
/// between attempts. Only transient errors are retried.
pub(crate) async fn with_retries<F, Fut>(label: &str, mut request: F) -> Result<String, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<String, LlmError>>,
{
    let mut last_err = None;
    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            let delay = BASE_BACKOFF * 2u32.pow(attempt - 1);
            warn!(provider = label, attempt, "transient api error, retrying in {delay:?}");
            tokio::time::sleep(delay).await;
        }
        match request().await {
            Ok(content) => return Ok(content),
            Err(e) if e.is_transient() && attempt < MAX_RETRIES => last_err = Some(e),
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or(LlmError::EmptyResponse))
}

/// HTTP client shared by the provider implementations; the proxy applies
/// only for http(s) proxies, matching the connection-dial contract.
pub(crate) fn build_http_client(
    timeout: Duration,
    proxy: Option<&str>,
) -> Result<reqwest::Client, LlmError> {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    if let Some(proxy) = proxy.filter(|p| !p.trim().is_empty()) {
        let proxy = reqwest::Proxy::all(proxy).map_err(|e| LlmError::Fatal {
            status: 0,
            message: format!("invalid proxy: {e}"),
        })?;
        builder = builder.proxy(proxy);
    }
    builder.build().map_err(|e| LlmError::Fatal {
        status: 0,
        message: format!("http client: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(LlmError::from_status(429, String::new()).is_transient());
        assert!(LlmError::from_status(500, String::new()).is_transient());
        assert!(LlmError::from_status(408, String::new()).is_transient());
        assert!(!LlmError::from_status(400, String::new()).is_transient());
        assert!(!LlmError::from_status(401, String::new()).is_transient());
    }

    #[test]
    fn test_json_mode_rejection_detection() {
        let err = LlmError::from_status(400, "response_format not supported".to_string());
        assert!(err.is_json_mode_rejection());
        let err = LlmError::from_status(400, "model cannot emit JSON".to_string());
        assert!(err.is_json_mode_rejection());
        let err = LlmError::from_status(400, "bad temperature".to_string());
        assert!(!err.is_json_mode_rejection());
        let err = LlmError::from_status(401, "json".to_string());
        assert!(!err.is_json_mode_rejection());
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let mut calls = 0;
        let result = with_retries("test", || {
            calls += 1;
            async move {
                Err::<String, _>(LlmError::Fatal {
                    status: 401,
                    message: "nope".to_string(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
