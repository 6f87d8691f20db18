//! Contract resolution: store lookup, explorer download, proxy chasing and
//! bytecode fallback.

use tracing::{debug, info, warn};

use crate::chain::RpcPool;
use crate::db::{ContractRecord, ContractStore};
use crate::error::{Result, ScanError};
use crate::explorer::{is_bytecode_only, ExplorerClient};
use crate::flatten::attach_metadata;

/// What a pipeline works with after resolution.
#[derive(Debug, Clone)]
pub struct FetchedContract {
    pub source: String,
    /// The implementation address when the target is a proxy, else the
    /// target itself.
    pub effective_address: String,
    pub is_proxy: bool,
}

impl FetchedContract {
    pub fn is_bytecode(&self) -> bool {
        is_bytecode_only(&self.source)
    }
}

/// Resolves addresses to analyzable source, consulting the store first and
/// downloading through the explorer on a miss. Proxy targets are chased to
/// their implementation once; when every source path fails, reachable
/// bytecode is returned so skip logic can detect it.
pub struct ContractResolver {
    store: ContractStore,
    explorer: ExplorerClient,
    rpc: std::sync::Arc<RpcPool>,
    table: String,
}

impl ContractResolver {
    pub fn new(
        store: ContractStore,
        explorer: ExplorerClient,
        rpc: std::sync::Arc<RpcPool>,
        table: String,
    ) -> Self {
        Self {
            store,
            explorer,
            rpc,
            table,
        }
    }

    pub fn store(&self) -> &ContractStore {
        &self.store
    }

    pub fn rpc(&self) -> &RpcPool {
        &self.rpc
    }

    pub async fn resolve(&self, address: &str) -> Result<FetchedContract> {
        let address = address.trim();
        if address.is_empty() {
            return Err(ScanError::NotVerified("empty address".to_string()));
        }

        if !self.store.contract_exists(&self.table, address).await? {
            debug!(address, "contract not in store, downloading");
            if let Err(e) = self.download(address).await {
                warn!(address, "download failed: {e}");
                return self.bytecode_fallback(address, address, false).await;
            }
        }

        if let Some((true, Some(impl_addr))) =
            self.store.proxy_info(&self.table, address).await?
        {
            let impl_addr = impl_addr.trim().to_string();
            if !impl_addr.is_empty() {
                if !self.store.contract_exists(&self.table, &impl_addr).await? {
                    debug!(address, implementation = %impl_addr, "downloading proxy implementation");
                    if let Err(e) = self.download(&impl_addr).await {
                        warn!(implementation = %impl_addr, "implementation download failed: {e}");
                        if let Ok(fallback) =
                            self.bytecode_fallback(&impl_addr, &impl_addr, true).await
                        {
                            return Ok(fallback);
                        }
                    }
                }
                if let Some(source) = self.store.source_of(&self.table, &impl_addr).await? {
                    info!(address, implementation = %impl_addr, "using implementation source");
                    return Ok(FetchedContract {
                        source,
                        effective_address: impl_addr,
                        is_proxy: true,
                    });
                }
                warn!(address, "implementation source unavailable, trying entry point");
            }
        }

        if let Some(source) = self.store.source_of(&self.table, address).await? {
            return Ok(FetchedContract {
                source,
                effective_address: address.to_string(),
                is_proxy: false,
            });
        }

        self.bytecode_fallback(address, address, false).await
    }

    /// Fetches verified source from the explorer and stores the record. A
    /// `NotVerified` answer is persisted as a closed-source row.
    async fn download(&self, address: &str) -> Result<()> {
        match self.explorer.get_source(address).await {
            Ok(item) => {
                let source = attach_metadata(&item.source_code, &item.contract_name);
                let record = ContractRecord {
                    address: address.to_string(),
                    source,
                    abi: (!item.abi.trim().is_empty()).then(|| item.abi.clone()),
                    is_open_source: true,
                    is_proxy: item.is_proxy(),
                    implementation: item.implementation_address().map(str::to_string),
                    ..Default::default()
                };
                self.store.upsert_contract(&self.table, record).await
            }
            Err(ScanError::NotVerified(reason)) => {
                debug!(address, "not verified: {reason}");
                let record = ContractRecord {
                    address: address.to_string(),
                    ..Default::default()
                };
                self.store.upsert_contract(&self.table, record).await?;
                Err(ScanError::NotVerified(reason))
            }
            Err(e) => Err(e),
        }
    }

    async fn bytecode_fallback(
        &self,
        address: &str,
        effective: &str,
        is_proxy: bool,
    ) -> Result<FetchedContract> {
        let client = self.rpc.get_client().await?;
        let code = client.get_code(address).await?;
        if code.trim_start_matches("0x").is_empty() {
            return Err(ScanError::NotVerified(format!(
                "no source and no code at {address}"
            )));
        }
        Ok(FetchedContract {
            source: code,
            effective_address: effective.to_string(),
            is_proxy,
        })
    }

    /// Download-only mode: fetch and persist one address, reporting whether
    /// the source was verified.
    pub async fn download_only(&self, address: &str) -> Result<bool> {
        match self.download(address).await {
            Ok(()) => Ok(true),
            Err(ScanError::NotVerified(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
