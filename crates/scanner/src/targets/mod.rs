//! Target producer: streams addresses from the store, a file, a single
//! input or a live head-poll subscription into a bounded channel.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::chain::RpcPool;
use crate::config::{ScanConfig, TargetSource};
use crate::db::ContractStore;
use crate::error::{Result, ScanError};

/// Bounded producer buffer; workers apply backpressure through it.
pub const TARGET_BUFFER: usize = 100;

const LIVE_POLL_INTERVAL: Duration = Duration::from_secs(12);

/// A 42-character `0x`-prefixed hex address.
pub fn is_valid_address(s: &str) -> bool {
    let s = s.trim();
    s.len() == 42
        && s.starts_with("0x")
        && s[2..].bytes().all(|b| b.is_ascii_hexdigit())
}

/// Parses one-address-per-line text, allowing `#` and `//` comments.
/// Duplicates are dropped case-insensitively, first-seen casing wins.
pub fn parse_address_lines(content: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for raw in content.lines() {
        let line = raw.trim();
        let line = line
            .split_once('#')
            .map(|(head, _)| head)
            .unwrap_or(line)
            .trim();
        let line = line
            .split_once("//")
            .map(|(head, _)| head)
            .unwrap_or(line)
            .trim();
        if line.is_empty() {
            continue;
        }
        if !is_valid_address(line) {
            warn!(line, "skipping invalid address");
            continue;
        }
        if seen.insert(line.to_lowercase()) {
            out.push(line.to_string());
        }
    }
    out
}

/// Reads a target file: a YAML list when the extension says so, plain
/// lines otherwise.
pub fn read_targets_file(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path)?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    if is_yaml {
        let listed: Vec<String> = serde_yaml::from_str(&content)
            .map_err(|e| ScanError::ConfigInvalid(format!("invalid YAML target list: {e}")))?;
        let mut seen = HashSet::new();
        return Ok(listed
            .into_iter()
            .map(|a| a.trim().to_string())
            .filter(|a| {
                if !is_valid_address(a) {
                    warn!(address = %a, "skipping invalid address");
                    return false;
                }
                seen.insert(a.to_lowercase())
            })
            .collect());
    }
    Ok(parse_address_lines(&content))
}

/// Block-ingestion collaborator: invoked once per new head block in live
/// mode before the store is re-queried for fresh open-source rows.
#[async_trait]
pub trait ChainIngestor: Send + Sync {
    async fn ingest_block(&self, block: u64) -> Result<()>;
}

/// Placeholder ingestor for runs without the ingestion collaborator; the
/// store is still polled, so externally inserted rows flow through.
pub struct NoopIngestor;

#[async_trait]
impl ChainIngestor for NoopIngestor {
    async fn ingest_block(&self, _block: u64) -> Result<()> {
        Ok(())
    }
}

/// Resolves the static target list for db / file / single sources.
pub async fn resolve_static_targets(
    config: &ScanConfig,
    store: &ContractStore,
    table: &str,
) -> Result<Vec<String>> {
    match config.target_source {
        TargetSource::Db => store.target_addresses(table, config.block_range).await,
        TargetSource::File => {
            let path = config.target_file.as_ref().ok_or_else(|| {
                ScanError::ConfigInvalid("target file path is required".to_string())
            })?;
            read_targets_file(path)
        }
        TargetSource::Single => {
            let address = config
                .target_address
                .as_deref()
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .ok_or_else(|| {
                    ScanError::ConfigInvalid("missing target address: --addr".to_string())
                })?;
            Ok(vec![address.to_string()])
        }
        TargetSource::Live => Err(ScanError::ConfigInvalid(
            "live mode has no static target list".to_string(),
        )),
    }
}

/// Spawns the producer and returns its bounded output. The channel closes
/// as soon as the source drains or the token fires.
pub fn target_channel(
    cancel: CancellationToken,
    config: &ScanConfig,
    store: ContractStore,
    table: String,
    rpc: Arc<RpcPool>,
    ingestor: Arc<dyn ChainIngestor>,
) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(TARGET_BUFFER);
    let config = config.clone();

    tokio::spawn(async move {
        if config.target_source == TargetSource::Live {
            if let Err(e) = run_live_producer(&cancel, &tx, &store, &table, &rpc, &*ingestor).await
            {
                error!("live target producer stopped: {e}");
            }
            return;
        }

        let targets = match resolve_static_targets(&config, &store, &table).await {
            Ok(targets) => targets,
            Err(e) => {
                error!("failed to resolve targets: {e}");
                return;
            }
        };
        info!(count = targets.len(), "loaded static targets");
        for address in targets {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                sent = tx.send(address) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    });

    rx
}

/// 7x24 monitor: poll the chain head, ingest each new block through the
/// collaborator and emit newly inserted open-source contracts. Historical
/// addresses are never emitted.
async fn run_live_producer(
    cancel: &CancellationToken,
    tx: &mpsc::Sender<String>,
    store: &ContractStore,
    table: &str,
    rpc: &RpcPool,
    ingestor: &dyn ChainIngestor,
) -> Result<()> {
    let mut last_head = rpc.get_client().await?.block_number().await?;
    let mut emitted: HashSet<String> = HashSet::new();
    info!(head = last_head, "live monitor started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(LIVE_POLL_INTERVAL) => {}
        }

        let head = match rpc.get_client().await {
            Ok(client) => match client.block_number().await {
                Ok(head) => head,
                Err(e) => {
                    warn!("head poll failed: {e}");
                    continue;
                }
            },
            Err(e) => {
                warn!("no healthy rpc endpoint: {e}");
                continue;
            }
        };
        if head <= last_head {
            continue;
        }

        for block in last_head + 1..=head {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if let Err(e) = ingestor.ingest_block(block).await {
                warn!(block, "block ingestion failed: {e}");
            }
        }

        match store.open_source_since(table, last_head + 1).await {
            Ok(fresh) => {
                for address in fresh {
                    if !emitted.insert(address.to_lowercase()) {
                        continue;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        sent = tx.send(address) => {
                            if sent.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
            }
            Err(e) => warn!("store query failed: {e}"),
        }
        last_head = head;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR_A: &str = "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48";
    const ADDR_B: &str = "0xdAC17F958D2ee523a2206206994597C13D831ec7";

    #[test]
    fn test_address_validation() {
        assert!(is_valid_address(ADDR_A));
        assert!(is_valid_address(&ADDR_A.to_lowercase()));
        assert!(!is_valid_address("0x1234"));
        assert!(!is_valid_address("A0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"));
        assert!(!is_valid_address("0xZZb86991c6218b36c1d19D4a2e9Eb0cE3606eB48"));
    }

    #[test]
    fn test_parse_lines_with_comments_and_dupes() {
        let content = format!(
            "# header comment\n{ADDR_A}\n{} // inline\n\n// whole line comment\n{ADDR_B} # tail\nnot-an-address\n",
            ADDR_A.to_lowercase()
        );
        let addrs = parse_address_lines(&content);
        // The lowercase duplicate is dropped, first-seen casing preserved.
        assert_eq!(addrs, vec![ADDR_A.to_string(), ADDR_B.to_string()]);
    }

    #[test]
    fn test_read_yaml_target_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targets.yaml");
        std::fs::write(&path, format!("- {ADDR_A}\n- {ADDR_B}\n- {ADDR_A}\n")).unwrap();
        let addrs = read_targets_file(&path).unwrap();
        assert_eq!(addrs, vec![ADDR_A.to_string(), ADDR_B.to_string()]);
    }

    #[tokio::test]
    async fn test_static_single_target() {
        let store = ContractStore::open_in_memory().unwrap();
        let config = ScanConfig {
            target_source: TargetSource::Single,
            target_address: Some(format!("  {ADDR_A}  ")),
            ..Default::default()
        };
        let targets = resolve_static_targets(&config, &store, "eth").await.unwrap();
        assert_eq!(targets, vec![ADDR_A.to_string()]);
    }

    #[tokio::test]
    async fn test_static_single_requires_address() {
        let store = ContractStore::open_in_memory().unwrap();
        let config = ScanConfig {
            target_source: TargetSource::Single,
            ..Default::default()
        };
        assert!(resolve_static_targets(&config, &store, "eth").await.is_err());
    }
}
