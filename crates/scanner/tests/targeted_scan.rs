//! End-to-end targeted pipeline against an in-memory store and a canned
//! model, down to the report file on disk.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use solsentry_scanner::ast::AstService;
use solsentry_scanner::chain::RpcPool;
use solsentry_scanner::config::{KeyRotator, ScanConfig, ScanMode, TargetSource};
use solsentry_scanner::db::{ContractRecord, ContractStore};
use solsentry_scanner::explorer::{ContractResolver, ExplorerClient};
use solsentry_scanner::llm::mock::MockAnalyzer;
use solsentry_scanner::llm::LlmManager;
use solsentry_scanner::pipeline::run_targeted;
use solsentry_scanner::pipeline::targeted::TargetedDeps;
use solsentry_scanner::report::{MarkdownRenderer, ReportCollector};

const ADDR: &str = "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48";

const REPLY: &str = r#"{"vulnerabilities":[{"type":"reentrancy","severity":"High","description":"external call before state update","line_numbers":[4]}],"summary":"one real issue","risk_score":7}"#;

async fn seeded_store() -> ContractStore {
    let store = ContractStore::open_in_memory().unwrap();
    store.ensure_table("eth").await.unwrap();
    store
        .upsert_contract(
            "eth",
            ContractRecord {
                address: ADDR.to_string(),
                source: "pragma solidity ^0.8.0;\ncontract Vault {\n    function withdraw() public {}\n}"
                    .to_string(),
                is_open_source: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    store
}

fn deps(store: ContractStore, collector: Arc<ReportCollector>) -> TargetedDeps {
    let rotator = KeyRotator::new(&["key".to_string()], "").unwrap();
    let explorer = ExplorerClient::new("http://127.0.0.1:1/api", rotator, Some(1), None).unwrap();
    let rpc = Arc::new(RpcPool::new("eth", &["http://127.0.0.1:1/".to_string()], None).unwrap());
    let resolver = Arc::new(ContractResolver::new(
        store,
        explorer,
        rpc,
        "eth".to_string(),
    ));
    TargetedDeps {
        config: ScanConfig {
            mode: ScanMode::Targeted,
            strategy: "generic_scan".to_string(),
            target_source: TargetSource::Single,
            concurrency: 2,
            ..Default::default()
        },
        resolver,
        llm: Arc::new(LlmManager::with_client(
            Arc::new(MockAnalyzer::with_reply(REPLY)),
            Duration::from_secs(30),
        )),
        ast: Arc::new(AstService::new()),
        collector,
    }
}

#[tokio::test]
async fn targeted_scan_writes_one_report_with_address_heading() {
    let out_dir = tempfile::tempdir().unwrap();
    let collector = Arc::new(ReportCollector::new(
        "mode1",
        "generic_scan",
        "openai",
        out_dir.path(),
    ));
    let store = seeded_store().await;

    run_targeted(
        CancellationToken::new(),
        deps(store, Arc::clone(&collector)),
        vec![ADDR.to_string()],
    )
    .await
    .unwrap();

    // Exactly one scan result, exactly one report file.
    assert_eq!(collector.len(), 1);
    let files: Vec<_> = std::fs::read_dir(out_dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert_eq!(files.len(), 1);

    let name = files[0].file_name();
    let name = name.to_str().unwrap();
    let pattern = regex::Regex::new(r"^scan_report_mode1_\d+\.md$").unwrap();
    assert!(pattern.is_match(name), "unexpected report name {name}");

    let content = std::fs::read_to_string(files[0].path()).unwrap();
    assert!(content.contains(&format!("# {ADDR}")));
    assert!(content.contains("- 🟠 High: 1"));
    assert!(content.contains("one real issue"));
}

#[tokio::test]
async fn repeated_write_does_not_produce_second_file() {
    let out_dir = tempfile::tempdir().unwrap();
    let collector = Arc::new(ReportCollector::new(
        "mode1",
        "generic_scan",
        "openai",
        out_dir.path(),
    ));
    let store = seeded_store().await;

    run_targeted(
        CancellationToken::new(),
        deps(store, Arc::clone(&collector)),
        vec![ADDR.to_string()],
    )
    .await
    .unwrap();

    assert!(collector.write_once(&MarkdownRenderer).unwrap().is_none());
    assert_eq!(std::fs::read_dir(out_dir.path()).unwrap().count(), 1);
}
