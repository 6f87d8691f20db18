//! Per-chain contract store.
//!
//! One table per chain, named after the chain tag, holding fetched
//! contract records. The store is read-mostly from the scanning core;
//! download mode writes rows through it as well. Queries run on the
//! blocking pool against a shared connection.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};

use crate::config::BlockRange;
use crate::error::{Result, ScanError};

/// Row shape of a chain table.
#[derive(Debug, Clone, Default)]
pub struct ContractRecord {
    pub address: String,
    pub source: String,
    pub abi: Option<String>,
    pub balance: Option<String>,
    pub is_open_source: bool,
    pub is_proxy: bool,
    pub implementation: Option<String>,
    pub created_at: Option<String>,
    pub created_block: Option<u64>,
    pub last_tx_at: Option<String>,
}

#[derive(Clone)]
pub struct ContractStore {
    conn: Arc<Mutex<Connection>>,
}

impl ContractStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&guard)
        })
        .await
        .map_err(|e| ScanError::ConfigInvalid(format!("db task failed: {e}")))?
        .map_err(ScanError::from)
    }

    pub async fn ensure_table(&self, table: &str) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                address TEXT PRIMARY KEY,
                contract TEXT,
                abi TEXT,
                balance TEXT,
                isopensource INTEGER DEFAULT 0,
                isproxy INTEGER DEFAULT 0,
                implementation TEXT,
                createtime TEXT,
                createblock INTEGER,
                txlast TEXT,
                isdecompiled INTEGER DEFAULT 0,
                dedcode TEXT
            )"
        );
        self.with_conn(move |conn| conn.execute(&sql, []).map(|_| ()))
            .await
    }

    pub async fn contract_exists(&self, table: &str, address: &str) -> Result<bool> {
        let sql = format!("SELECT 1 FROM {table} WHERE address = ?1");
        let address = address.to_string();
        self.with_conn(move |conn| {
            conn.query_row(&sql, params![address], |_| Ok(()))
                .optional()
                .map(|row| row.is_some())
        })
        .await
    }

    pub async fn upsert_contract(&self, table: &str, record: ContractRecord) -> Result<()> {
        let sql = format!(
            "INSERT INTO {table}
                (address, contract, abi, balance, isopensource, isproxy,
                 implementation, createtime, createblock, txlast)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(address) DO UPDATE SET
                contract = excluded.contract,
                abi = excluded.abi,
                balance = excluded.balance,
                isopensource = excluded.isopensource,
                isproxy = excluded.isproxy,
                implementation = excluded.implementation,
                txlast = excluded.txlast"
        );
        self.with_conn(move |conn| {
            conn.execute(
                &sql,
                params![
                    record.address,
                    record.source,
                    record.abi,
                    record.balance,
                    record.is_open_source as i64,
                    record.is_proxy as i64,
                    record.implementation,
                    record.created_at,
                    record.created_block.map(|b| b as i64),
                    record.last_tx_at,
                ],
            )
            .map(|_| ())
        })
        .await
    }

    /// Proxy flag and implementation address for a stored contract.
    pub async fn proxy_info(
        &self,
        table: &str,
        address: &str,
    ) -> Result<Option<(bool, Option<String>)>> {
        let sql = format!("SELECT isproxy, implementation FROM {table} WHERE address = ?1");
        let address = address.to_string();
        self.with_conn(move |conn| {
            conn.query_row(&sql, params![address], |row| {
                let is_proxy: i64 = row.get(0)?;
                let implementation: Option<String> = row.get(1)?;
                Ok((is_proxy == 1, implementation))
            })
            .optional()
        })
        .await
    }

    /// Non-empty stored source for an address, if any.
    pub async fn source_of(&self, table: &str, address: &str) -> Result<Option<String>> {
        let sql = format!(
            "SELECT contract FROM {table}
             WHERE address = ?1 AND contract IS NOT NULL AND contract != ''"
        );
        let address = address.to_string();
        self.with_conn(move |conn| {
            conn.query_row(&sql, params![address], |row| row.get::<_, String>(0))
                .optional()
        })
        .await
    }

    /// Open-source scan targets grouped by effective address (the
    /// implementation when the row is a proxy), most recent creation block
    /// first, capped at 1000.
    pub async fn target_addresses(
        &self,
        table: &str,
        range: Option<BlockRange>,
    ) -> Result<Vec<String>> {
        let effective = "CASE WHEN isproxy = 1 AND implementation IS NOT NULL \
                         AND implementation != '' THEN implementation ELSE address END";
        let base = "isopensource = 1 AND contract IS NOT NULL AND contract != ''";
        let sql = match range {
            Some(_) => format!(
                "SELECT effective_address FROM (
                     SELECT {effective} AS effective_address, MAX(createblock) AS max_block
                     FROM {table}
                     WHERE {base} AND createblock BETWEEN ?1 AND ?2
                     GROUP BY effective_address
                 ) ORDER BY max_block DESC LIMIT 1000"
            ),
            None => format!(
                "SELECT effective_address FROM (
                     SELECT {effective} AS effective_address, MAX(createblock) AS max_block
                     FROM {table}
                     WHERE {base}
                     GROUP BY effective_address
                 ) ORDER BY max_block DESC LIMIT 1000"
            ),
        };
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let map_row = |row: &rusqlite::Row<'_>| row.get::<_, String>(0);
            let rows = match range {
                Some(r) => stmt.query_map(params![r.start as i64, r.end as i64], map_row)?,
                None => stmt.query_map([], map_row)?,
            };
            let mut addrs = Vec::new();
            for row in rows {
                let addr = row?;
                if !addr.trim().is_empty() {
                    addrs.push(addr.trim().to_string());
                }
            }
            Ok(addrs)
        })
        .await
    }

    /// Open-source rows inserted at or after a block. Feeds live mode.
    pub async fn open_source_since(&self, table: &str, block: u64) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT address FROM {table}
             WHERE isopensource = 1 AND createblock >= ?1
             ORDER BY createblock ASC"
        );
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![block as i64], |row| row.get::<_, String>(0))?;
            rows.collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(address: &str, block: u64) -> ContractRecord {
        ContractRecord {
            address: address.to_string(),
            source: "contract A {}".to_string(),
            is_open_source: true,
            created_block: Some(block),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_upsert_and_lookup() {
        let store = ContractStore::open_in_memory().unwrap();
        store.ensure_table("eth").await.unwrap();
        store.upsert_contract("eth", record("0xaaa", 1)).await.unwrap();

        assert!(store.contract_exists("eth", "0xaaa").await.unwrap());
        assert!(!store.contract_exists("eth", "0xbbb").await.unwrap());
        assert_eq!(
            store.source_of("eth", "0xaaa").await.unwrap().unwrap(),
            "contract A {}"
        );
    }

    #[tokio::test]
    async fn test_targets_group_by_effective_address() {
        let store = ContractStore::open_in_memory().unwrap();
        store.ensure_table("eth").await.unwrap();

        let mut proxy = record("0xproxy", 10);
        proxy.is_proxy = true;
        proxy.implementation = Some("0ximpl".to_string());
        store.upsert_contract("eth", proxy).await.unwrap();
        store.upsert_contract("eth", record("0ximpl", 5)).await.unwrap();
        store.upsert_contract("eth", record("0xother", 7)).await.unwrap();

        let targets = store.target_addresses("eth", None).await.unwrap();
        // The proxy row collapses onto its implementation.
        assert_eq!(targets, vec!["0ximpl", "0xother"]);
    }

    #[tokio::test]
    async fn test_targets_respect_block_range() {
        let store = ContractStore::open_in_memory().unwrap();
        store.ensure_table("eth").await.unwrap();
        store.upsert_contract("eth", record("0xa", 5)).await.unwrap();
        store.upsert_contract("eth", record("0xb", 50)).await.unwrap();

        let targets = store
            .target_addresses("eth", Some(BlockRange { start: 1, end: 10 }))
            .await
            .unwrap();
        assert_eq!(targets, vec!["0xa"]);
    }

    #[tokio::test]
    async fn test_open_source_since() {
        let store = ContractStore::open_in_memory().unwrap();
        store.ensure_table("eth").await.unwrap();
        store.upsert_contract("eth", record("0xold", 1)).await.unwrap();
        store.upsert_contract("eth", record("0xnew", 100)).await.unwrap();

        let fresh = store.open_source_since("eth", 50).await.unwrap();
        assert_eq!(fresh, vec!["0xnew"]);
    }
}
