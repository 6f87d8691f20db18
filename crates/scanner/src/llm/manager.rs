//! Model orchestrator: paces every dispatch through the governor,
//! assembles the final prompt, parses the reply and issues one reformat
//! attempt when the model ignored the schema.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{canonical_provider, split_keys, AiProviderConfig};
use crate::error::{Result, ScanError};
use crate::limits::Governor;
use crate::llm::gemini::GeminiClient;
use crate::llm::multi::MultiAnalyzer;
use crate::llm::ollama::OllamaClient;
use crate::llm::openai::{chat_defaults, ChatClientConfig, ChatCompletionsClient};
use crate::llm::parser::{AnalysisReport, ResponseKind, ResponseParser};
use crate::llm::provider::Analyzer;

const DEFAULT_REQUESTS_PER_MIN: u32 = 120;
const REFORMAT_MIN_BUDGET: Duration = Duration::from_secs(2);
const REFORMAT_TEXT_CAP: usize = 64 * 1024;
const CODE_SNIPPET_PROBE: usize = 200;

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub provider: String,
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub proxy: Option<String>,
    pub timeout: Duration,
    pub requests_per_min: u32,
    pub verbose: bool,
}

impl ManagerConfig {
    pub fn from_provider_config(
        provider: &str,
        config: &AiProviderConfig,
        timeout: Duration,
        proxy_override: Option<&str>,
        verbose: bool,
    ) -> Self {
        let proxy = proxy_override
            .map(str::to_string)
            .filter(|p| !p.is_empty())
            .or_else(|| (!config.proxy.is_empty()).then(|| config.proxy.clone()));
        Self {
            provider: provider.to_string(),
            api_key: config.api_key.clone(),
            base_url: config.base_url.clone(),
            model: config.model.clone(),
            proxy,
            timeout,
            requests_per_min: DEFAULT_REQUESTS_PER_MIN,
            verbose,
        }
    }
}

pub struct LlmManager {
    client: Arc<dyn Analyzer>,
    governor: Governor,
    timeout: Duration,
    verbose: bool,
}

impl LlmManager {
    pub fn new(config: ManagerConfig) -> Result<Self> {
        let timeout = if config.timeout.is_zero() {
            Duration::from_secs(60)
        } else {
            config.timeout
        };

        let keys = {
            let parsed = split_keys(&config.api_key);
            if parsed.is_empty() {
                vec![config.api_key.clone()]
            } else {
                parsed
            }
        };
        let client = build_client(&config, &keys, timeout)?;

        let requests_per_min = config.requests_per_min.max(1) * keys.len().max(1) as u32;
        let base_concurrency = (keys.len() * 2)
            .max(config.requests_per_min as usize / 30)
            .clamp(1, 32);

        info!(
            provider = %config.provider,
            client = %client.name(),
            requests_per_min,
            base_concurrency,
            "llm manager ready"
        );
        Ok(Self {
            client,
            governor: Governor::new(requests_per_min, base_concurrency),
            timeout,
            verbose: config.verbose,
        })
    }

    /// Test wiring: any analyzer behind a fixed governor.
    pub fn with_client(client: Arc<dyn Analyzer>, timeout: Duration) -> Self {
        Self {
            client,
            governor: Governor::new(600, 4),
            timeout,
            verbose: false,
        }
    }

    pub fn client_name(&self) -> String {
        self.client.name()
    }

    pub fn governor(&self) -> &Governor {
        &self.governor
    }

    /// One end-to-end analysis call: pace, gate, dispatch, parse, and
    /// a single reformat attempt when parsing failed and enough budget
    /// remains.
    pub async fn analyze_contract(
        &self,
        cancel: &CancellationToken,
        contract_code: &str,
        prompt: &str,
        kind: ResponseKind,
    ) -> Result<AnalysisReport> {
        let started = Instant::now();
        let result = tokio::time::timeout(
            self.timeout,
            self.analyze_inner(cancel, contract_code, prompt, kind, started),
        )
        .await
        .map_err(|_| {
            ScanError::Llm(crate::llm::LlmError::Timeout)
        })?;

        self.governor.record_latency(started.elapsed());
        result
    }

    async fn analyze_inner(
        &self,
        cancel: &CancellationToken,
        contract_code: &str,
        prompt: &str,
        kind: ResponseKind,
        started: Instant,
    ) -> Result<AnalysisReport> {
        self.governor.wait(cancel).await?;
        let _permit = self.governor.acquire(cancel).await?;

        let full_prompt = assemble_prompt(prompt, contract_code, kind);
        if self.verbose {
            debug!(prompt_len = full_prompt.len(), "sending model request\n{full_prompt}");
        } else {
            debug!(
                prompt_len = full_prompt.len(),
                prompt_sha256 = %hash_for_log(&full_prompt),
                "sending model request"
            );
        }

        let mut response = self.client.analyze_json(&full_prompt).await?;
        if self.verbose {
            debug!(resp_len = response.len(), "model response\n{response}");
        } else {
            debug!(
                resp_len = response.len(),
                resp_sha256 = %hash_for_log(&response),
                "model response"
            );
        }

        let parser = ResponseParser::new(kind);
        let mut parsed = parser.parse(&response);
        let needs_reformat = match &parsed {
            Ok(report) => !report.parse_error.is_empty(),
            Err(_) => true,
        };

        if needs_reformat && self.remaining_budget(started) > REFORMAT_MIN_BUDGET {
            debug!("reply did not match schema, sending reformat prompt");
            let reformat = build_reformat_prompt(kind, &response);
            if let Ok(retry_response) = self.client.analyze_json(&reformat).await {
                if let Ok(retry_report) = parser.parse(&retry_response) {
                    if retry_report.parse_error.is_empty() {
                        response = retry_response;
                        parsed = Ok(retry_report);
                    }
                }
            }
        }

        let mut report = match parsed {
            Ok(report) => report,
            Err(e) => {
                warn!("model reply unusable: {e}");
                AnalysisReport {
                    parse_error: e.to_string(),
                    ..Default::default()
                }
            }
        };
        report.raw_response = response;
        report.duration = started.elapsed();
        Ok(report)
    }

    fn remaining_budget(&self, started: Instant) -> Duration {
        self.timeout.saturating_sub(started.elapsed())
    }

    /// Startup probe; failures surface to the caller, which decides
    /// whether they are fatal.
    pub async fn test_connection(&self) -> Result<()> {
        let reply = self
            .client
            .analyze("Please respond with 'OK' if you can read this message.")
            .await?;
        debug!(reply_len = reply.len(), "connection test ok");
        Ok(())
    }

    pub fn close(&self) {
        self.governor.close();
    }
}

fn build_client(
    config: &ManagerConfig,
    keys: &[String],
    timeout: Duration,
) -> Result<Arc<dyn Analyzer>> {
    let mut clients: Vec<Arc<dyn Analyzer>> = Vec::with_capacity(keys.len());
    for key in keys {
        clients.push(single_client(config, key, timeout)?);
    }
    match clients.len() {
        0 => Err(ScanError::ConfigInvalid("no api key configured".to_string())),
        1 => Ok(clients.remove(0)),
        _ => Ok(Arc::new(MultiAnalyzer::new(clients))),
    }
}

fn single_client(
    config: &ManagerConfig,
    api_key: &str,
    timeout: Duration,
) -> Result<Arc<dyn Analyzer>> {
    let provider = canonical_provider(&config.provider);
    let proxy = config.proxy.as_deref();
    let client: Arc<dyn Analyzer> = match provider {
        "gemini" => Arc::new(GeminiClient::new(
            api_key,
            &config.base_url,
            &config.model,
            timeout,
            proxy,
        )?),
        "local_llm" => Arc::new(OllamaClient::new(
            &config.base_url,
            &config.model,
            timeout,
            proxy,
        )?),
        other => {
            let (default_base, default_model) = chat_defaults(other);
            Arc::new(ChatCompletionsClient::new(ChatClientConfig {
                label: other.to_string(),
                api_key: api_key.to_string(),
                base_url: if config.base_url.is_empty() {
                    default_base.to_string()
                } else {
                    config.base_url.clone()
                },
                model: if config.model.is_empty() {
                    default_model.to_string()
                } else {
                    config.model.clone()
                },
                timeout,
                proxy: config.proxy.clone(),
            })?)
        }
    };
    Ok(client)
}

/// The strategy template normally embeds the contract; when it does not
/// (probed by the leading code snippet and a solidity fence), the code is
/// appended, followed by the fixed schema instruction.
pub fn assemble_prompt(prompt: &str, contract_code: &str, kind: ResponseKind) -> String {
    let mut full = prompt.to_string();

    let snippet: String = contract_code
        .trim()
        .chars()
        .take(CODE_SNIPPET_PROBE)
        .collect();
    let has_code = !snippet.is_empty()
        && (full.contains(&snippet) || full.to_lowercase().contains("```solidity"));
    if !has_code && !contract_code.trim().is_empty() {
        full.push_str("\n\nContract Code:\n```solidity\n");
        full.push_str(contract_code);
        full.push_str("\n```");
    }

    full.push_str("\n\n");
    full.push_str(schema_instruction(kind));
    full
}

pub fn schema_instruction(kind: ResponseKind) -> &'static str {
    match kind {
        ResponseKind::Verification => {
            r#"Output ONLY one JSON object:
{"is_vulnerability":true|false,"severity":"Critical|High|Medium|Low|None|Unknown","reason":"...","vuln_type":"..."}
No markdown, no extra text."#
        }
        ResponseKind::Analysis => {
            r#"Output ONLY one JSON object:
{"contract_address":"0x...","risk_score":0,"vuln_probability":"85%|High|Medium|Low","severity":"Critical|High|Medium|Low|None|Unknown","summary":"...","recommendations":["..."],"vulnerabilities":[{"type":"...","severity":"Critical|High|Medium|Low|Unknown","description":"...","location":"...","line_numbers":[1,2]}]}
No markdown, no extra text. Use [] for empty lists."#
        }
    }
}

fn build_reformat_prompt(kind: ResponseKind, text: &str) -> String {
    let mut text = text;
    if text.len() > REFORMAT_TEXT_CAP {
        let mut end = REFORMAT_TEXT_CAP;
        while end > 0 && !text.is_char_boundary(end) {
            end -= 1;
        }
        text = &text[..end];
    }
    format!(
        "Convert the following text into the required JSON.\n\n{}\n\nTEXT:\n{}",
        schema_instruction(kind),
        text
    )
}

fn hash_for_log(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::MockAnalyzer;

    const CODE: &str = "pragma solidity ^0.8.0;\ncontract Vault { function f() public {} }";

    #[test]
    fn test_prompt_gets_code_fence_when_missing() {
        let full = assemble_prompt("Find bugs.", CODE, ResponseKind::Analysis);
        assert!(full.contains("```solidity"));
        assert!(full.contains(CODE));
        assert!(full.contains("Output ONLY one JSON object"));
    }

    #[test]
    fn test_prompt_with_embedded_code_is_not_duplicated() {
        let prompt = format!("Audit:\n```solidity\n{CODE}\n```");
        let full = assemble_prompt(&prompt, CODE, ResponseKind::Analysis);
        assert_eq!(full.matches(CODE).count(), 1);
    }

    #[test]
    fn test_verification_schema_selected() {
        let full = assemble_prompt("Verify.", CODE, ResponseKind::Verification);
        assert!(full.contains("is_vulnerability"));
        assert!(!full.contains("recommendations"));
    }

    #[test]
    fn test_reformat_prompt_caps_text() {
        let long = "y".repeat(100_000);
        let reformat = build_reformat_prompt(ResponseKind::Analysis, &long);
        assert!(reformat.len() < 70_000);
    }

    #[tokio::test]
    async fn test_analyze_contract_happy_path() {
        let mock = Arc::new(MockAnalyzer::with_reply(
            r#"{"vulnerabilities":[{"type":"reentrancy","severity":"High","description":"d"}],"summary":"s"}"#,
        ));
        let manager = LlmManager::with_client(mock.clone(), Duration::from_secs(30));
        let cancel = CancellationToken::new();

        let report = manager
            .analyze_contract(&cancel, CODE, "Find bugs.", ResponseKind::Analysis)
            .await
            .unwrap();
        assert_eq!(report.vulnerabilities.len(), 1);
        assert!(!report.raw_response.is_empty());
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn test_reformat_retry_substitutes_good_reply() {
        let mock = Arc::new(MockAnalyzer::with_replies(&[
            "I think there might be problems but I will not emit JSON.",
            r#"{"vulnerabilities":[],"summary":"reformatted"}"#,
        ]));
        let manager = LlmManager::with_client(mock.clone(), Duration::from_secs(30));
        let cancel = CancellationToken::new();

        let report = manager
            .analyze_contract(&cancel, CODE, "Find bugs.", ResponseKind::Analysis)
            .await
            .unwrap();
        assert_eq!(report.summary, "reformatted");
        assert!(report.parse_error.is_empty());
        assert_eq!(mock.calls(), 2);
    }

    #[tokio::test]
    async fn test_failing_client_surfaces_error() {
        let mock = Arc::new(MockAnalyzer::failing());
        let manager = LlmManager::with_client(mock, Duration::from_secs(5));
        let cancel = CancellationToken::new();

        let result = manager
            .analyze_contract(&cancel, CODE, "Find bugs.", ResponseKind::Analysis)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_cancelled_token_aborts_before_dispatch() {
        let mock = Arc::new(MockAnalyzer::with_reply("{}"));
        let manager = LlmManager::with_client(mock.clone(), Duration::from_secs(5));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = manager
            .analyze_contract(&cancel, CODE, "Find bugs.", ResponseKind::Analysis)
            .await;
        assert!(result.is_err());
        assert_eq!(mock.calls(), 0);
    }
}
