//! Block-explorer client: address → verified source metadata.

pub mod resolver;

pub use resolver::{ContractResolver, FetchedContract};

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::KeyRotator;
use crate::error::{Result, ScanError};

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_STEP: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One verified-source item from the explorer.
#[derive(Debug, Clone, Deserialize)]
pub struct VerifiedSource {
    #[serde(rename = "SourceCode", default)]
    pub source_code: String,
    #[serde(rename = "ABI", default)]
    pub abi: String,
    #[serde(rename = "ContractName", default)]
    pub contract_name: String,
    #[serde(rename = "CompilerVersion", default)]
    pub compiler_version: String,
    #[serde(rename = "Proxy", default)]
    pub proxy: String,
    #[serde(rename = "Implementation", default)]
    pub implementation: String,
}

impl VerifiedSource {
    pub fn is_proxy(&self) -> bool {
        self.proxy == "1"
    }

    pub fn implementation_address(&self) -> Option<&str> {
        let impl_addr = self.implementation.trim();
        (!impl_addr.is_empty()).then_some(impl_addr)
    }
}

#[derive(Debug, Deserialize)]
struct ExplorerResponse {
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    result: Value,
}

pub struct ExplorerClient {
    base_url: String,
    keys: KeyRotator,
    chain_id: Option<u64>,
    http: reqwest::Client,
}

impl ExplorerClient {
    pub fn new(
        base_url: &str,
        keys: KeyRotator,
        chain_id: Option<u64>,
        proxy: Option<&str>,
    ) -> Result<Self> {
        if base_url.trim().is_empty() {
            return Err(ScanError::ConfigInvalid(
                "explorer base_url is required".to_string(),
            ));
        }
        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
        if let Some(proxy) = proxy.filter(|p| !p.trim().is_empty()) {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            keys,
            chain_id,
            http: builder.build()?,
        })
    }

    /// `getsourcecode` with rotation across keys and ≤3 attempts with
    /// linear backoff on transient failures.
    pub async fn get_source(&self, address: &str) -> Result<VerifiedSource> {
        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(BACKOFF_STEP * attempt).await;
            }
            match self.get_source_once(address).await {
                Ok(source) => return Ok(source),
                Err(e) if e.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                    warn!(address, attempt, "explorer request failed: {e}");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or(ScanError::ExplorerTransient("exhausted retries".to_string())))
    }

    async fn get_source_once(&self, address: &str) -> Result<VerifiedSource> {
        let key = self.keys.get_next();
        let mut query: Vec<(&str, String)> = vec![
            ("module", "contract".to_string()),
            ("action", "getsourcecode".to_string()),
            ("address", address.to_string()),
            ("apikey", key),
        ];
        if let Some(chain_id) = self.chain_id {
            query.push(("chainid", chain_id.to_string()));
        }

        let response = self
            .http
            .get(&self.base_url)
            .query(&query)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(ScanError::ExplorerTransient(format!(
                "explorer status {status}"
            )));
        }
        if !status.is_success() {
            return Err(ScanError::NotVerified(format!(
                "explorer status {status} for {address}"
            )));
        }

        let body: ExplorerResponse = response.json().await.map_err(classify_transport_error)?;
        if body.status != "1" {
            return Err(ScanError::NotVerified(format!(
                "{address}: {}",
                body.message
            )));
        }

        let items: Vec<VerifiedSource> = serde_json::from_value(body.result)
            .map_err(|e| ScanError::ExplorerTransient(format!("malformed result: {e}")))?;
        let item = items
            .into_iter()
            .next()
            .ok_or_else(|| ScanError::NotVerified(format!("no source entry for {address}")))?;
        if item.source_code.trim().is_empty() {
            return Err(ScanError::NotVerified(format!(
                "empty source for {address}"
            )));
        }
        debug!(address, contract = %item.contract_name, "fetched verified source");
        Ok(item)
    }
}

fn classify_transport_error(e: reqwest::Error) -> ScanError {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() || e.is_decode() {
        ScanError::ExplorerTransient(e.to_string())
    } else {
        ScanError::Http(e)
    }
}

/// A `0x`-prefixed string of nothing but hex digits is deployed bytecode,
/// not source. Very short payloads count as bytecode so downstream skip
/// logic drops them.
pub fn is_bytecode_only(code: &str) -> bool {
    let code = code.trim();
    if code.len() < 10 {
        return true;
    }
    let Some(digits) = code.strip_prefix("0x") else {
        return false;
    };
    digits.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytecode_detection() {
        assert!(is_bytecode_only("0x6060604052deadbeef"));
        assert!(is_bytecode_only("  0x6060604052deadbeef  "));
        assert!(is_bytecode_only("0x")); // too short counts as bytecode
        assert!(!is_bytecode_only("pragma solidity ^0.8.0; contract A {}"));
        assert!(!is_bytecode_only("0x6060zz")); // non-hex tail is not bytecode
    }

    #[test]
    fn test_verified_source_proxy_fields() {
        let item: VerifiedSource = serde_json::from_value(serde_json::json!({
            "SourceCode": "contract A {}",
            "ContractName": "A",
            "Proxy": "1",
            "Implementation": "0xBBB"
        }))
        .unwrap();
        assert!(item.is_proxy());
        assert_eq!(item.implementation_address(), Some("0xBBB"));

        let plain: VerifiedSource = serde_json::from_value(serde_json::json!({
            "SourceCode": "contract A {}",
            "Proxy": "0",
            "Implementation": ""
        }))
        .unwrap();
        assert!(!plain.is_proxy());
        assert_eq!(plain.implementation_address(), None);
    }

    #[test]
    fn test_response_parse_tolerates_missing_fields() {
        let body: ExplorerResponse = serde_json::from_str(
            r#"{"status":"0","message":"NOTOK","result":"Invalid API Key"}"#,
        )
        .unwrap();
        assert_eq!(body.status, "0");
        assert_eq!(body.message, "NOTOK");
    }
}
