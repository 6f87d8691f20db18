//! Verified-pipeline behavior when the static analyzer is unavailable:
//! tasks fail as warnings, the pipeline survives, no report is fabricated.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use solsentry_scanner::ast::AstService;
use solsentry_scanner::chain::RpcPool;
use solsentry_scanner::config::{KeyRotator, ScanConfig, ScanMode, TargetSource};
use solsentry_scanner::db::{ContractRecord, ContractStore};
use solsentry_scanner::explorer::{ContractResolver, ExplorerClient};
use solsentry_scanner::llm::mock::MockAnalyzer;
use solsentry_scanner::llm::LlmManager;
use solsentry_scanner::pipeline::verified::VerifiedDeps;
use solsentry_scanner::pipeline::{run_verified, VersionPolicy};
use solsentry_scanner::report::ReportCollector;
use solsentry_scanner::slither::StaticAnalyzer;

const ADDR: &str = "0xdAC17F958D2ee523a2206206994597C13D831ec7";

#[tokio::test]
async fn verified_scan_survives_missing_analyzer() {
    let store = ContractStore::open_in_memory().unwrap();
    store.ensure_table("eth").await.unwrap();
    store
        .upsert_contract(
            "eth",
            ContractRecord {
                address: ADDR.to_string(),
                source: "pragma solidity ^0.8.0;\ncontract T { function f() public {} }"
                    .to_string(),
                is_open_source: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let rotator = KeyRotator::new(&["key".to_string()], "").unwrap();
    let explorer = ExplorerClient::new("http://127.0.0.1:1/api", rotator, Some(1), None).unwrap();
    let rpc = Arc::new(RpcPool::new("eth", &["http://127.0.0.1:1/".to_string()], None).unwrap());
    let resolver = Arc::new(ContractResolver::new(
        store,
        explorer,
        rpc,
        "eth".to_string(),
    ));

    let out_dir = tempfile::tempdir().unwrap();
    let collector = Arc::new(ReportCollector::new(
        "mode2",
        "default",
        "openai",
        out_dir.path(),
    ));

    let deps = VerifiedDeps {
        config: ScanConfig {
            mode: ScanMode::Verified,
            strategy: "default".to_string(),
            target_source: TargetSource::Single,
            concurrency: 1,
            ..Default::default()
        },
        resolver,
        llm: Arc::new(LlmManager::with_client(
            Arc::new(MockAnalyzer::with_reply(
                r#"{"is_vulnerability":false,"severity":"None","reason":"fp","vuln_type":"x"}"#,
            )),
            Duration::from_secs(30),
        )),
        ast: Arc::new(AstService::new()),
        // Pointing at a binary that cannot run slither forces the
        // per-task analyzer failure path.
        analyzer: Arc::new(StaticAnalyzer::new(Some(
            "/nonexistent/python3".to_string(),
        ))),
        collector: Arc::clone(&collector),
        version_policy: VersionPolicy::default(),
    };

    let (tx, rx) = mpsc::channel(4);
    tx.send(ADDR.to_string()).await.unwrap();
    drop(tx);

    run_verified(CancellationToken::new(), deps, rx)
        .await
        .unwrap();

    // The analyzer failure surfaced as a per-task failure: nothing was
    // appended and no report file exists.
    assert!(collector.is_empty());
    assert_eq!(std::fs::read_dir(out_dir.path()).unwrap().count(), 0);
}
