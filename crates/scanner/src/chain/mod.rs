//! Redundant JSON-RPC endpoints with health-cached selection.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{Result, ScanError};

const HEALTH_CACHE_WINDOW: Duration = Duration::from_secs(5);
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(5);

/// Thin JSON-RPC client over one endpoint URL.
#[derive(Debug)]
pub struct RpcClient {
    url: String,
    http: reqwest::Client,
}

#[derive(serde::Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

#[derive(serde::Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

impl RpcClient {
    pub fn new(url: &str, timeout: Duration, proxy: Option<&str>) -> Result<Self> {
        let url = url.trim();
        if url.is_empty() {
            return Err(ScanError::ConfigInvalid("empty rpc url".to_string()));
        }
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(proxy) = proxy.filter(|p| !p.trim().is_empty()) {
            let scheme_is_http = url
                .split("://")
                .next()
                .map(|s| s.eq_ignore_ascii_case("http") || s.eq_ignore_ascii_case("https"))
                .unwrap_or(false);
            if scheme_is_http {
                builder = builder.proxy(reqwest::Proxy::all(proxy)?);
            }
        }
        Ok(Self {
            url: url.to_string(),
            http: builder.build()?,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let response: RpcResponse = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if let Some(err) = response.error {
            return Err(ScanError::ExplorerTransient(format!(
                "rpc error {}: {}",
                err.code, err.message
            )));
        }
        let result = response
            .result
            .ok_or_else(|| ScanError::ExplorerTransient("rpc result missing".to_string()))?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn block_number(&self) -> Result<u64> {
        let hex: String = self.call("eth_blockNumber", json!([])).await?;
        parse_hex_quantity(&hex)
    }

    /// Deployed bytecode as the raw `0x…` hex string.
    pub async fn get_code(&self, address: &str) -> Result<String> {
        self.call("eth_getCode", json!([address, "latest"])).await
    }

    pub async fn get_balance(&self, address: &str) -> Result<String> {
        self.call("eth_getBalance", json!([address, "latest"]))
            .await
    }

    pub async fn get_block_by_number(&self, number: u64, full: bool) -> Result<Value> {
        self.call(
            "eth_getBlockByNumber",
            json!([format!("{number:#x}"), full]),
        )
        .await
    }

    pub async fn get_transaction_receipt(&self, tx_hash: &str) -> Result<Value> {
        self.call("eth_getTransactionReceipt", json!([tx_hash])).await
    }
}

pub fn parse_hex_quantity(hex: &str) -> Result<u64> {
    let digits = hex.trim().trim_start_matches("0x");
    u64::from_str_radix(digits, 16)
        .map_err(|_| ScanError::ExplorerTransient(format!("invalid hex quantity: {hex}")))
}

struct PoolState {
    current: usize,
    last_healthy: Vec<Option<Instant>>,
}

/// Ordered endpoint list with a per-endpoint health cache. `get_client`
/// serves the current endpoint while its last liveness probe is fresh,
/// re-probes when stale, and fails over circularly otherwise. The probe
/// runs outside the pool lock.
pub struct RpcPool {
    chain: String,
    clients: Vec<RpcClient>,
    state: Mutex<PoolState>,
    health_window: Duration,
    liveness_timeout: Duration,
}

impl RpcPool {
    pub fn new(chain: &str, urls: &[String], proxy: Option<&str>) -> Result<Self> {
        if urls.is_empty() {
            return Err(ScanError::ConfigInvalid(format!(
                "chain {chain}: at least one rpc url is required"
            )));
        }
        let mut clients = Vec::with_capacity(urls.len());
        for url in urls {
            match RpcClient::new(url, LIVENESS_TIMEOUT, proxy) {
                Ok(client) => clients.push(client),
                Err(e) => warn!(url = %url, "skipping rpc endpoint: {e}"),
            }
        }
        if clients.is_empty() {
            return Err(ScanError::EndpointsUnavailable);
        }
        let start = rand::thread_rng().gen_range(0..clients.len());
        let count = clients.len();
        Ok(Self {
            chain: chain.to_string(),
            clients,
            state: Mutex::new(PoolState {
                current: start,
                last_healthy: vec![None; count],
            }),
            health_window: HEALTH_CACHE_WINDOW,
            liveness_timeout: LIVENESS_TIMEOUT,
        })
    }

    pub fn chain(&self) -> &str {
        &self.chain
    }

    pub async fn get_client(&self) -> Result<&RpcClient> {
        let (current, fresh) = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let fresh = state.last_healthy[state.current]
                .map(|t| t.elapsed() < self.health_window)
                .unwrap_or(false);
            (state.current, fresh)
        };

        if fresh {
            return Ok(&self.clients[current]);
        }

        if self.probe(current).await {
            self.mark_healthy(current);
            return Ok(&self.clients[current]);
        }

        // One circular cycle over the remaining endpoints; retries beyond
        // that belong to the caller's layer.
        for offset in 1..self.clients.len() {
            let idx = (current + offset) % self.clients.len();
            if self.probe(idx).await {
                self.mark_healthy(idx);
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                state.current = idx;
                debug!(chain = %self.chain, url = %self.clients[idx].url(), "switched rpc endpoint");
                return Ok(&self.clients[idx]);
            }
        }

        Err(ScanError::EndpointsUnavailable)
    }

    async fn probe(&self, idx: usize) -> bool {
        matches!(
            tokio::time::timeout(self.liveness_timeout, self.clients[idx].block_number()).await,
            Ok(Ok(_))
        )
    }

    fn mark_healthy(&self, idx: usize) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.last_healthy[idx] = Some(Instant::now());
    }

    #[cfg(test)]
    fn mark_current_healthy(&self) {
        let idx = self.state.lock().unwrap_or_else(|e| e.into_inner()).current;
        self.mark_healthy(idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_quantity() {
        assert_eq!(parse_hex_quantity("0x10").unwrap(), 16);
        assert_eq!(parse_hex_quantity("0x0").unwrap(), 0);
        assert!(parse_hex_quantity("0xzz").is_err());
    }

    #[test]
    fn test_pool_requires_urls() {
        assert!(RpcPool::new("eth", &[], None).is_err());
    }

    #[tokio::test]
    async fn test_fresh_health_cache_skips_probe() {
        let pool = RpcPool::new(
            "eth",
            &["http://127.0.0.1:1/".to_string()],
            None,
        )
        .unwrap();
        pool.mark_current_healthy();
        // The endpoint is unreachable, so only the cache can satisfy this.
        let client = pool.get_client().await.unwrap();
        assert_eq!(client.url(), "http://127.0.0.1:1/");
    }

    #[tokio::test]
    async fn test_all_endpoints_down_reports_unavailable() {
        let pool = RpcPool::new(
            "eth",
            &[
                "http://127.0.0.1:1/".to_string(),
                "http://127.0.0.1:2/".to_string(),
            ],
            None,
        )
        .unwrap();
        let err = pool.get_client().await.unwrap_err();
        assert!(matches!(err, ScanError::EndpointsUnavailable));
    }
}
