//! Static analyzer adapter.
//!
//! Spawns the embedded slither wrapper once per contract with a JSON
//! stdin/stdout contract and a hard wall clock. Results are memoized per
//! `(effective_address, sha256(source))` for a short window.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{Result, ScanError};

const WRAPPER_SCRIPT: &str = include_str!("slither_wrapper.py");
const ANALYZER_TIMEOUT: Duration = Duration::from_secs(120);
const STDERR_CAP: usize = 4096;
const CACHE_TTL: Duration = Duration::from_secs(300);

static EXTRACTED_SCRIPT: OnceLock<Option<PathBuf>> = OnceLock::new();

#[derive(Debug, Clone, Default, Serialize)]
pub struct AnalysisConfig {
    pub contract_name: String,
    pub solc_version: String,
    pub address: String,
    pub optimization: bool,
    pub via_ir: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AnalysisResult {
    pub state_variables: Vec<StateVariable>,
    pub functions: Vec<Function>,
    pub detectors: Vec<Detector>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StateVariable {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub visibility: String,
    pub is_constant: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Function {
    pub name: String,
    pub signature: String,
    pub visibility: String,
    pub state_mutability: String,
    pub parameters: Vec<String>,
    pub returns: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Detector {
    pub check: String,
    pub impact: String,
    pub confidence: String,
    pub description: String,
    pub line_numbers: Vec<u64>,
}

#[derive(Debug, Deserialize)]
struct WrapperResponse {
    success: bool,
    #[serde(default)]
    result: Option<AnalysisResult>,
    #[serde(default)]
    error: Option<String>,
}

/// The wrapper is shipped inside the binary and written to a temp file the
/// first time any analyzer in the process needs it.
fn wrapper_path() -> Result<&'static PathBuf> {
    EXTRACTED_SCRIPT
        .get_or_init(|| {
            let file = tempfile::Builder::new()
                .prefix("slither_wrapper_")
                .suffix(".py")
                .tempfile()
                .ok()?;
            std::fs::write(file.path(), WRAPPER_SCRIPT).ok()?;
            file.into_temp_path().keep().ok()
        })
        .as_ref()
        .ok_or_else(|| ScanError::AnalyzerFailed("failed to extract wrapper script".to_string()))
}

pub fn cache_key(address: &str, code: &str) -> String {
    let digest = Sha256::digest(code.as_bytes());
    format!("{address}:{}", hex::encode(digest))
}

pub struct StaticAnalyzer {
    python: String,
    timeout: Duration,
    cache: DashMap<String, (Arc<AnalysisResult>, Instant)>,
}

impl StaticAnalyzer {
    pub fn new(python: Option<String>) -> Self {
        Self {
            python: python.unwrap_or_else(|| "python3".to_string()),
            timeout: ANALYZER_TIMEOUT,
            cache: DashMap::new(),
        }
    }

    pub async fn analyze(
        &self,
        code: &str,
        config: &AnalysisConfig,
    ) -> Result<Arc<AnalysisResult>> {
        let address = if config.address.trim().is_empty() {
            "unknown"
        } else {
            config.address.trim()
        };
        let key = cache_key(address, code);

        if let Some(entry) = self.cache.get(&key) {
            let (result, stored_at) = entry.value();
            if stored_at.elapsed() < CACHE_TTL {
                debug!(address, "slither cache hit");
                return Ok(Arc::clone(result));
            }
        }
        self.cache.remove(&key);

        info!(address, "running slither analysis");
        let result = Arc::new(self.run_wrapper(code, config).await?);
        self.cache.insert(key, (Arc::clone(&result), Instant::now()));
        Ok(result)
    }

    async fn run_wrapper(&self, code: &str, config: &AnalysisConfig) -> Result<AnalysisResult> {
        let script = wrapper_path()?;
        let input = serde_json::to_vec(&serde_json::json!({
            "code": code,
            "config": config,
        }))?;

        let mut child = tokio::process::Command::new(&self.python)
            .arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ScanError::AnalyzerFailed(format!("spawn {}: {e}", self.python)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&input)
                .await
                .map_err(|e| ScanError::AnalyzerFailed(format!("write stdin: {e}")))?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                ScanError::AnalyzerFailed(format!(
                    "analyzer timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| ScanError::AnalyzerFailed(format!("wait: {e}")))?;

        if !output.status.success() {
            let mut stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if stderr.is_empty() {
                stderr = String::from_utf8_lossy(&output.stdout).to_string();
            }
            return Err(ScanError::AnalyzerFailed(format!(
                "analyzer exited with {}: {}",
                output.status,
                truncate(&stderr, STDERR_CAP)
            )));
        }

        parse_wrapper_output(&output.stdout, &output.stderr)
    }
}

fn parse_wrapper_output(stdout: &[u8], stderr: &[u8]) -> Result<AnalysisResult> {
    let response: WrapperResponse = serde_json::from_slice(stdout).map_err(|e| {
        let stderr = truncate(&String::from_utf8_lossy(stderr), STDERR_CAP);
        if stderr.is_empty() {
            ScanError::AnalyzerFailed(format!(
                "non-JSON analyzer output: {e}: {}",
                truncate(&String::from_utf8_lossy(stdout), STDERR_CAP)
            ))
        } else {
            ScanError::AnalyzerFailed(format!("non-JSON analyzer output: {e}: {stderr}"))
        }
    })?;
    if !response.success {
        return Err(ScanError::AnalyzerFailed(
            response.error.unwrap_or_else(|| "unknown analyzer error".to_string()),
        ));
    }
    Ok(response.result.unwrap_or_default())
}

fn truncate(text: &str, cap: usize) -> String {
    if text.len() <= cap {
        return text.trim().to_string();
    }
    let mut end = cap;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...(truncated)", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_successful_wrapper_output() {
        let stdout = br#"{"success":true,"result":{"state_variables":[],"functions":[],"detectors":[{"check":"reentrancy-eth","impact":"High","confidence":"Medium","description":"ext call before write","line_numbers":[12,17]}]}}"#;
        let result = parse_wrapper_output(stdout, b"").unwrap();
        assert_eq!(result.detectors.len(), 1);
        assert_eq!(result.detectors[0].check, "reentrancy-eth");
        assert_eq!(result.detectors[0].line_numbers, vec![12, 17]);
    }

    #[test]
    fn test_parse_wrapper_error() {
        let stdout = br#"{"success":false,"error":"Invalid compilation"}"#;
        let err = parse_wrapper_output(stdout, b"").unwrap_err();
        assert!(err.to_string().contains("Invalid compilation"));
    }

    #[test]
    fn test_parse_non_json_output_carries_stderr() {
        let err = parse_wrapper_output(b"Traceback ...", b"boom").unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_stderr_truncation() {
        let long = "x".repeat(10_000);
        let cut = truncate(&long, STDERR_CAP);
        assert!(cut.len() < 5_000);
        assert!(cut.ends_with("...(truncated)"));
    }

    #[test]
    fn test_cache_key_is_content_addressed() {
        let a = cache_key("0xabc", "contract A {}");
        let b = cache_key("0xabc", "contract A {}");
        let c = cache_key("0xabc", "contract B {}");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("0xabc:"));
    }
}
