//! Targeted pipeline: a worker pool over (strategy, address) tasks, each
//! driving fetch → preprocess → prompt → parse → report.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ast::AstService;
use crate::config::ScanConfig;
use crate::error::{Result, ScanError};
use crate::explorer::{ContractResolver, FetchedContract};
use crate::flatten;
use crate::llm::{LlmManager, ResponseKind};
use crate::prompt::{
    glob_exploit_library, load_input_file, load_template, template_needs_call_graph,
    PromptBuilder, PromptVariables,
};
use crate::report::{MarkdownRenderer, ReportCollector, ScanRecord};
use crate::ui::{format_vuln_message, Progress};

use super::{preprocess_contract, preprocess_key, Preprocessed, SingleFlight};

const CALLEE_DEPTH: usize = 3;
const CONTEXT_BUDGET: usize = 20_000;

/// Strategies that run standalone, without an exploit-library input.
const STANDALONE_TEMPLATES: &[&str] = &["generic_scan", "callgraph_enhanced"];

pub struct TargetedDeps {
    pub config: ScanConfig,
    pub resolver: Arc<ContractResolver>,
    pub llm: Arc<LlmManager>,
    pub ast: Arc<AstService>,
    pub collector: Arc<ReportCollector>,
}

#[derive(Debug, Clone)]
struct Strategy {
    name: String,
    input_content: String,
}

#[derive(Debug, Clone)]
struct Task {
    strategy: usize,
    address: String,
}

struct Shared {
    config: ScanConfig,
    resolver: Arc<ContractResolver>,
    llm: Arc<LlmManager>,
    ast: Arc<AstService>,
    collector: Arc<ReportCollector>,
    template: String,
    need_call_graph: bool,
    strategies: Vec<Strategy>,
    builder: PromptBuilder,
    progress: Progress,
    contract_cache: SingleFlight<FetchedContract>,
    preprocess_cache: SingleFlight<Preprocessed>,
    timings: std::sync::Mutex<Vec<Duration>>,
}

pub async fn run_targeted(
    cancel: CancellationToken,
    deps: TargetedDeps,
    addresses: Vec<String>,
) -> Result<()> {
    info!("🎯 starting targeted vulnerability scan");

    let template_name = select_template_name(&deps.config);
    let template = load_template(deps.config.mode, &template_name)?;
    let need_call_graph = template_needs_call_graph(&template);
    let strategies = resolve_strategies(&deps.config, &template_name)?;

    if addresses.is_empty() {
        warn!("no target contracts found to scan");
        return Ok(());
    }
    info!(
        targets = addresses.len(),
        strategies = strategies.len(),
        "scan plan ready"
    );

    if let Err(e) = deps.llm.test_connection().await {
        warn!("ai connection test failed (non-fatal): {e}");
    }

    let total = strategies.len() * addresses.len();
    let shared = Arc::new(Shared {
        template,
        need_call_graph,
        strategies,
        builder: PromptBuilder::new(),
        progress: Progress::new(total, "🚀 Scanning"),
        contract_cache: SingleFlight::new(),
        preprocess_cache: SingleFlight::new(),
        timings: std::sync::Mutex::new(Vec::new()),
        config: deps.config,
        resolver: deps.resolver,
        llm: deps.llm,
        ast: deps.ast,
        collector: deps.collector,
    });

    // Flush a partial report the moment the run is cancelled; the write
    // gate keeps this from double-writing with the completion path.
    {
        let cancel = cancel.clone();
        let collector = Arc::clone(&shared.collector);
        tokio::spawn(async move {
            cancel.cancelled().await;
            match collector.write_once(&MarkdownRenderer) {
                Ok(Some(path)) => info!(path = %path.display(), "partial report generated (interrupted)"),
                Ok(None) => {}
                Err(e) => warn!("failed to generate partial report: {e}"),
            }
        });
    }

    let (tx, rx) = mpsc::channel::<Task>(total.max(1));
    let rx = Arc::new(Mutex::new(rx));

    let worker_count = shared.config.concurrency.max(1);
    let mut workers = Vec::with_capacity(worker_count);
    for worker_id in 0..worker_count {
        let shared = Arc::clone(&shared);
        let rx = Arc::clone(&rx);
        let cancel = cancel.clone();
        workers.push(tokio::spawn(async move {
            worker_loop(worker_id, shared, rx, cancel).await;
        }));
    }

    'feed: for (strategy_idx, _) in shared.strategies.iter().enumerate() {
        for address in &addresses {
            let task = Task {
                strategy: strategy_idx,
                address: address.clone(),
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'feed,
                sent = tx.send(task) => {
                    if sent.is_err() {
                        break 'feed;
                    }
                }
            }
        }
    }
    drop(tx);

    for worker in workers {
        let _ = worker.await;
    }
    shared.progress.finish();

    let success = shared.collector.len();
    info!(
        total,
        success,
        failed = total.saturating_sub(success),
        vulnerable = shared.progress.vulnerable(),
        "scan completed"
    );
    if shared.config.benchmark {
        print_benchmark_summary(&shared);
    }

    match shared.collector.write_once(&MarkdownRenderer) {
        Ok(Some(path)) => info!(path = %path.display(), "report saved"),
        Ok(None) => {}
        Err(e) => warn!("failed to generate report: {e}"),
    }

    if cancel.is_cancelled() {
        return Err(ScanError::Cancelled);
    }
    Ok(())
}

/// Mode1 without an input file forces the generic template unless the
/// strategy is standalone.
fn select_template_name(config: &ScanConfig) -> String {
    let mut name = config.strategy.clone();
    if config.input.is_none() {
        if name.is_empty() || name == "default" || name == "all" {
            info!("no input file specified, using generic scan template");
            name = "generic_scan".to_string();
        } else if !STANDALONE_TEMPLATES.contains(&name.as_str()) {
            warn!(template = %name, "template specified without input file; it may require TOML input");
        }
    }
    name
}

fn resolve_strategies(config: &ScanConfig, template_name: &str) -> Result<Vec<Strategy>> {
    match config.input.as_deref() {
        Some("all") => {
            let files = glob_exploit_library();
            if files.is_empty() {
                warn!("no toml files found in the exploit library");
                return Ok(vec![Strategy {
                    name: template_name.to_string(),
                    input_content: String::new(),
                }]);
            }
            info!(count = files.len(), "loaded exploit library strategies");
            let mut strategies = Vec::with_capacity(files.len());
            for file in files {
                let name = file
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("strategy")
                    .to_string();
                match load_input_file(&file.to_string_lossy()) {
                    Ok(input_content) => strategies.push(Strategy {
                        name,
                        input_content,
                    }),
                    Err(e) => warn!(file = %file.display(), "failed to load input file: {e}"),
                }
            }
            Ok(strategies)
        }
        Some(input) => Ok(vec![Strategy {
            name: template_name.to_string(),
            input_content: load_input_file(input)?,
        }]),
        None => Ok(vec![Strategy {
            name: template_name.to_string(),
            input_content: String::new(),
        }]),
    }
}

async fn worker_loop(
    worker_id: usize,
    shared: Arc<Shared>,
    rx: Arc<Mutex<mpsc::Receiver<Task>>>,
    cancel: CancellationToken,
) {
    loop {
        let task = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            task = async { rx.lock().await.recv().await } => task,
        };
        let Some(task) = task else {
            return;
        };
        let started = Instant::now();
        process_task(worker_id, &shared, &task, &cancel).await;
        if shared.config.benchmark {
            shared
                .timings
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(started.elapsed());
        }
        shared.progress.inc();
    }
}

async fn process_task(
    worker_id: usize,
    shared: &Shared,
    task: &Task,
    cancel: &CancellationToken,
) {
    let strategy = &shared.strategies[task.strategy];
    let address = task.address.as_str();

    let contract = match shared
        .contract_cache
        .get_or_try_init(address, || shared.resolver.resolve(address))
        .await
    {
        Ok(contract) => contract,
        Err(e) => {
            warn!(worker_id, address, "failed to get contract: {e}");
            return;
        }
    };

    if contract.is_bytecode() {
        info!(worker_id, address, "contract not open source (bytecode only), skipping");
        return;
    }

    let key = preprocess_key(&contract);
    let pre = match shared
        .preprocess_cache
        .get_or_try_init(&key, || {
            preprocess_contract(
                &shared.ast,
                &contract,
                shared.need_call_graph,
                CALLEE_DEPTH,
                CONTEXT_BUDGET,
            )
        })
        .await
    {
        Ok(pre) => pre,
        Err(e) => {
            warn!(worker_id, address, "preprocess failed: {e}");
            return;
        }
    };

    if shared.config.verbose
        && flatten::is_json_source(&contract.source)
        && !flatten::is_json_source(&pre.final_code)
    {
        save_flattened_copy(address, &pre.final_code);
    }
    if pre.final_code.len() < pre.original_len && pre.original_len > 0 {
        let saved = pre.original_len - pre.final_code.len();
        info!(
            worker_id,
            address,
            saved_chars = saved,
            "source reduced by preprocessing"
        );
    }

    let mut vars = PromptVariables {
        contract_address: address.to_string(),
        contract_code: pre.final_code.clone(),
        strategy: strategy.name.clone(),
        input_file_content: strategy.input_content.clone(),
        ..Default::default()
    };
    if let Some(ctx) = &pre.call_graph {
        vars.apply_call_graph(ctx);
    }

    let prompt = match shared.builder.build(&shared.template, &vars) {
        Ok(prompt) => prompt,
        Err(e) => {
            warn!(worker_id, address, "prompt build failed: {e}");
            return;
        }
    };

    let analysis = match shared
        .llm
        .analyze_contract(cancel, &pre.final_code, &prompt, ResponseKind::Analysis)
        .await
    {
        Ok(analysis) => analysis,
        Err(e) => {
            warn!(worker_id, address, "ai analysis failed: {e}");
            return;
        }
    };

    let record = ScanRecord {
        address: address.to_string(),
        resolved_address: contract.effective_address.clone(),
        is_proxy: contract.is_proxy,
        timestamp: chrono::Local::now(),
        mode: shared.config.mode.as_str().to_string(),
        strategy: strategy.name.clone(),
        analysis,
    };

    if !record.analysis.vulnerabilities.is_empty() {
        shared.progress.add_vulnerable();
        let types: Vec<String> = record
            .analysis
            .vulnerabilities
            .iter()
            .map(|v| v.vuln_type.clone())
            .collect();
        let display = if contract.effective_address != address {
            format!("{address} -> {}", contract.effective_address)
        } else {
            address.to_string()
        };
        shared
            .progress
            .message(&format_vuln_message(&display, &types));
    }

    shared.collector.append(record);
}

fn save_flattened_copy(address: &str, code: &str) {
    let dir = std::path::Path::new("flattened_contracts");
    if std::fs::create_dir_all(dir).is_ok() {
        let _ = std::fs::write(dir.join(format!("{address}.sol")), code);
    }
}

fn print_benchmark_summary(shared: &Shared) {
    let timings = shared.timings.lock().unwrap_or_else(|e| e.into_inner());
    if timings.is_empty() {
        return;
    }
    let min = timings.iter().min().copied().unwrap_or_default();
    let max = timings.iter().max().copied().unwrap_or_default();
    let mean = timings.iter().sum::<Duration>() / timings.len() as u32;
    info!(
        tasks = timings.len(),
        min_ms = min.as_millis() as u64,
        mean_ms = mean.as_millis() as u64,
        max_ms = max.as_millis() as u64,
        "benchmark summary"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::RpcPool;
    use crate::config::{ScanMode, TargetSource};
    use crate::db::{ContractRecord, ContractStore};
    use crate::explorer::ExplorerClient;
    use crate::llm::mock::MockAnalyzer;
    use crate::report::ReportCollector;

    const ADDR: &str = "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48";
    const PROXY: &str = "0xdAC17F958D2ee523a2206206994597C13D831ec7";
    const IMPL: &str = "0x6B175474E89094C44Da98b954EedeAC495271d0F";

    async fn deps_with_store(reply: &str, concurrency: usize) -> (TargetedDeps, ContractStore) {
        let store = ContractStore::open_in_memory().unwrap();
        store.ensure_table("eth").await.unwrap();
        let rotator = crate::config::KeyRotator::new(&["k".to_string()], "").unwrap();
        let explorer =
            ExplorerClient::new("http://127.0.0.1:1/api", rotator, None, None).unwrap();
        let rpc = Arc::new(RpcPool::new("eth", &["http://127.0.0.1:1/".to_string()], None).unwrap());
        let resolver = Arc::new(ContractResolver::new(
            store.clone(),
            explorer,
            rpc,
            "eth".to_string(),
        ));
        let llm = Arc::new(LlmManager::with_client(
            Arc::new(MockAnalyzer::with_reply(reply)),
            Duration::from_secs(30),
        ));
        let dir = tempfile::tempdir().unwrap();
        let collector = Arc::new(ReportCollector::new(
            "mode1",
            "generic_scan",
            "openai",
            dir.path(),
        ));
        // Leak the tempdir so the report path stays valid for the test.
        std::mem::forget(dir);
        let config = ScanConfig {
            mode: ScanMode::Targeted,
            strategy: "generic_scan".to_string(),
            target_source: TargetSource::Single,
            concurrency,
            ..Default::default()
        };
        (
            TargetedDeps {
                config,
                resolver,
                llm,
                ast: Arc::new(AstService::new()),
                collector,
            },
            store,
        )
    }

    fn verified_row(address: &str) -> ContractRecord {
        ContractRecord {
            address: address.to_string(),
            source: "pragma solidity ^0.8.0;\ncontract Vault { function f() public {} }"
                .to_string(),
            is_open_source: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_single_target_produces_one_record() {
        let reply = r#"{"vulnerabilities":[{"type":"reentrancy","severity":"High","description":"d"}],"summary":"s"}"#;
        let (deps, store) = deps_with_store(reply, 1).await;
        store.upsert_contract("eth", verified_row(ADDR)).await.unwrap();

        let collector = Arc::clone(&deps.collector);
        run_targeted(CancellationToken::new(), deps, vec![ADDR.to_string()])
            .await
            .unwrap();

        assert_eq!(collector.len(), 1);
        let report = collector.snapshot();
        assert_eq!(report.results[0].address, ADDR);
        assert_eq!(report.results[0].analysis.vulnerabilities.len(), 1);
    }

    #[tokio::test]
    async fn test_bytecode_only_contract_is_skipped_without_ai_call() {
        let mock = Arc::new(MockAnalyzer::with_reply("{}"));
        let (mut deps, store) = deps_with_store("{}", 1).await;
        deps.llm = Arc::new(LlmManager::with_client(
            mock.clone(),
            Duration::from_secs(5),
        ));
        let mut row = verified_row(ADDR);
        row.source = "0x6060604052aabbccddeeff".to_string();
        store.upsert_contract("eth", row).await.unwrap();

        let collector = Arc::clone(&deps.collector);
        run_targeted(CancellationToken::new(), deps, vec![ADDR.to_string()])
            .await
            .unwrap();

        assert_eq!(collector.len(), 0);
        assert_eq!(mock.calls(), 1); // connection test only
    }

    #[tokio::test]
    async fn test_proxy_record_resolves_to_implementation() {
        let reply = r#"{"vulnerabilities":[],"summary":"clean"}"#;
        let (deps, store) = deps_with_store(reply, 1).await;

        let mut proxy = verified_row(PROXY);
        proxy.is_proxy = true;
        proxy.implementation = Some(IMPL.to_string());
        store.upsert_contract("eth", proxy).await.unwrap();
        store.upsert_contract("eth", verified_row(IMPL)).await.unwrap();

        let collector = Arc::clone(&deps.collector);
        run_targeted(CancellationToken::new(), deps, vec![PROXY.to_string()])
            .await
            .unwrap();

        let report = collector.snapshot();
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].resolved_address, IMPL);
        assert!(report.results[0]
            .display_address()
            .contains(&format!("(Implementation: {IMPL})")));
    }

    #[tokio::test]
    async fn test_empty_target_set_writes_no_report() {
        let (deps, _store) = deps_with_store("{}", 1).await;
        let collector = Arc::clone(&deps.collector);
        run_targeted(CancellationToken::new(), deps, Vec::new())
            .await
            .unwrap();
        assert!(collector.is_empty());
        assert!(collector.write_once(&MarkdownRenderer).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancellation_before_any_completion_writes_no_report() {
        let (deps, store) = deps_with_store("{}", 1).await;
        store.upsert_contract("eth", verified_row(ADDR)).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let collector = Arc::clone(&deps.collector);
        let result = run_targeted(cancel, deps, vec![ADDR.to_string()]).await;

        assert!(matches!(result, Err(ScanError::Cancelled)));
        assert!(collector.is_empty());
    }

    #[tokio::test]
    async fn test_shared_address_hits_contract_cache_once() {
        let reply = r#"{"vulnerabilities":[],"summary":"clean"}"#;
        let (deps, store) = deps_with_store(reply, 2).await;
        store.upsert_contract("eth", verified_row(ADDR)).await.unwrap();

        let collector = Arc::clone(&deps.collector);
        // The same address twice: the single-flight caches dedupe the
        // fetch and preprocessing while both tasks report.
        run_targeted(
            CancellationToken::new(),
            deps,
            vec![ADDR.to_string(), ADDR.to_string()],
        )
        .await
        .unwrap();
        assert_eq!(collector.len(), 2);
    }
}
