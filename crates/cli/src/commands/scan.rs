//! Scan command: wires a scan-run object out of the configured resources
//! and dispatches into the requested pipeline.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use solsentry_scanner::ast::AstService;
use solsentry_scanner::chain::RpcPool;
use solsentry_scanner::config::{
    AppConfig, BlockRange, KeyRotator, ScanConfig, ScanMode, TargetSource,
};
use solsentry_scanner::db::ContractStore;
use solsentry_scanner::explorer::{ContractResolver, ExplorerClient};
use solsentry_scanner::llm::{LlmManager, ManagerConfig};
use solsentry_scanner::pipeline::targeted::TargetedDeps;
use solsentry_scanner::pipeline::verified::VerifiedDeps;
use solsentry_scanner::pipeline::{run_targeted, run_verified, VersionPolicy};
use solsentry_scanner::report::ReportCollector;
use solsentry_scanner::slither::StaticAnalyzer;
use solsentry_scanner::targets::{
    resolve_static_targets, target_channel, NoopIngestor,
};

pub struct ScanArgs {
    pub mode: String,
    pub strategy: String,
    pub input: Option<String>,
    pub target: String,
    pub addr: Option<String>,
    pub file: Option<PathBuf>,
    pub range: Option<String>,
    pub chain: String,
    pub provider: String,
    pub concurrency: usize,
    pub timeout_secs: u64,
    pub proxy: Option<String>,
    pub report_dir: PathBuf,
    pub verbose: bool,
    pub download_only: bool,
    pub benchmark: bool,
}

/// Resources owned by one scan run; everything is torn down when the run
/// object drops.
struct ScanRun {
    config: ScanConfig,
    store: ContractStore,
    table: String,
    rpc: Arc<RpcPool>,
    resolver: Arc<ContractResolver>,
    llm: Arc<LlmManager>,
}

pub async fn execute(args: ScanArgs, cancel: CancellationToken) -> Result<()> {
    print_banner();

    let config = build_scan_config(&args)?;
    let app = AppConfig::load().context("loading settings.yaml")?;
    let run = build_run(&app, config).await?;

    let result = if run.config.download_only {
        run_download_only(&run).await
    } else {
        match run.config.mode {
            ScanMode::Targeted => run_mode1(&run, cancel).await,
            ScanMode::Verified => run_mode2(&run, cancel).await,
        }
    };

    run.llm.close();
    result.map_err(Into::into)
}

fn print_banner() {
    println!(
        "{} {}",
        "solsentry".bright_cyan().bold(),
        env!("CARGO_PKG_VERSION").dimmed()
    );
}

fn build_scan_config(args: &ScanArgs) -> Result<ScanConfig> {
    let range = args
        .range
        .as_deref()
        .map(BlockRange::parse)
        .transpose()?;
    Ok(ScanConfig {
        mode: ScanMode::parse(&args.mode)?,
        strategy: args.strategy.clone(),
        input: args.input.clone(),
        target_source: TargetSource::parse(&args.target)?,
        target_file: args.file.clone(),
        target_address: args.addr.clone(),
        block_range: range,
        chain: args.chain.clone(),
        provider: args.provider.clone(),
        concurrency: args.concurrency.max(1),
        timeout: Duration::from_secs(args.timeout_secs.max(1)),
        proxy: args.proxy.clone(),
        report_dir: args.report_dir.clone(),
        verbose: args.verbose,
        download_only: args.download_only,
        benchmark: args.benchmark,
    })
}

async fn build_run(app: &AppConfig, config: ScanConfig) -> Result<ScanRun> {
    let chain = app.chain(&config.chain)?;
    let table = app.table_name(&config.chain)?;

    let store = ContractStore::open(&app.database.name)
        .with_context(|| format!("opening contract store {}", app.database.name))?;
    store.ensure_table(&table).await?;

    let rpc = Arc::new(RpcPool::new(
        &config.chain,
        &chain.rpc_urls,
        config.proxy.as_deref(),
    )?);

    let keys = chain.explorer.all_keys();
    let rotator = KeyRotator::new(&keys, "").ok_or_else(|| {
        anyhow::anyhow!("chain {}: no explorer api key configured", config.chain)
    })?;
    let explorer = ExplorerClient::new(
        &chain.explorer.base_url,
        rotator,
        chain.chain_id,
        config.proxy.as_deref(),
    )?;
    let resolver = Arc::new(ContractResolver::new(
        store.clone(),
        explorer,
        Arc::clone(&rpc),
        table.clone(),
    ));

    let provider_config = app.ai_provider(&config.provider)?;
    let llm = Arc::new(LlmManager::new(ManagerConfig::from_provider_config(
        &config.provider,
        provider_config,
        config.timeout,
        config.proxy.as_deref(),
        config.verbose,
    ))?);

    Ok(ScanRun {
        config,
        store,
        table,
        rpc,
        resolver,
        llm,
    })
}

async fn run_download_only(run: &ScanRun) -> Result<(), solsentry_scanner::ScanError> {
    let targets =
        resolve_static_targets(&run.config, &run.store, &run.table).await?;
    info!(count = targets.len(), "downloading contracts");
    let mut verified = 0usize;
    for address in &targets {
        match run.resolver.download_only(address).await {
            Ok(true) => verified += 1,
            Ok(false) => info!(address, "not source-verified"),
            Err(e) => warn!(address, "download failed: {e}"),
        }
    }
    info!(total = targets.len(), verified, "download finished");
    Ok(())
}

async fn run_mode1(
    run: &ScanRun,
    cancel: CancellationToken,
) -> Result<(), solsentry_scanner::ScanError> {
    let addresses =
        resolve_static_targets(&run.config, &run.store, &run.table).await?;
    let collector = Arc::new(ReportCollector::new(
        run.config.mode.as_str(),
        &run.config.strategy,
        &run.config.provider,
        &run.config.report_dir,
    ));
    let deps = TargetedDeps {
        config: run.config.clone(),
        resolver: Arc::clone(&run.resolver),
        llm: Arc::clone(&run.llm),
        ast: Arc::new(AstService::new()),
        collector,
    };
    run_targeted(cancel, deps, addresses).await
}

async fn run_mode2(
    run: &ScanRun,
    cancel: CancellationToken,
) -> Result<(), solsentry_scanner::ScanError> {
    let targets = target_channel(
        cancel.clone(),
        &run.config,
        run.store.clone(),
        run.table.clone(),
        Arc::clone(&run.rpc),
        Arc::new(NoopIngestor),
    );
    let collector = Arc::new(ReportCollector::new(
        run.config.mode.as_str(),
        &run.config.strategy,
        &run.config.provider,
        &run.config.report_dir,
    ));
    let deps = VerifiedDeps {
        config: run.config.clone(),
        resolver: Arc::clone(&run.resolver),
        llm: Arc::clone(&run.llm),
        ast: Arc::new(AstService::new()),
        analyzer: Arc::new(StaticAnalyzer::new(None)),
        collector,
        version_policy: VersionPolicy::default(),
    };
    run_verified(cancel, deps, targets).await
}
