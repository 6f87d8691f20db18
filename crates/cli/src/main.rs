use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::error;

use solsentry_scanner::ScanError;

mod commands;

#[derive(Parser, Debug)]
#[command(name = "solsentry")]
#[command(about = "EVM smart-contract vulnerability scanner")]
#[command(version)]
struct Cli {
    /// Scan mode: mode1 (targeted) or mode2 (slither-verified)
    #[arg(short = 'm', long, default_value = "mode1")]
    mode: String,

    /// Strategy / template name
    #[arg(short = 's', long, default_value = "default")]
    strategy: String,

    /// Exploit-library input file, or "all" for the whole library
    #[arg(short = 'i', long)]
    input: Option<String>,

    /// Target source: db, file, contract, last
    #[arg(short = 't', long, default_value = "db")]
    target: String,

    /// Single target address (with -t contract)
    #[arg(long)]
    addr: Option<String>,

    /// Address list file (with -t file)
    #[arg(long)]
    file: Option<PathBuf>,

    /// Block range filter for db targets: <start>-<end>
    #[arg(long)]
    range: Option<String>,

    /// Chain tag from settings.yaml
    #[arg(short = 'c', long, default_value = "eth")]
    chain: String,

    /// AI provider: openai, deepseek, gemini, local-llm
    #[arg(long = "ai", default_value = "openai")]
    provider: String,

    /// Worker pool size
    #[arg(long, default_value_t = 5)]
    concurrency: usize,

    /// Per-request model timeout in seconds
    #[arg(long, default_value_t = 120)]
    timeout: u64,

    /// HTTP proxy for explorer / model traffic
    #[arg(long)]
    proxy: Option<String>,

    /// Report output directory
    #[arg(short = 'r', long, default_value = "reports")]
    report_dir: PathBuf,

    #[arg(short = 'v', long)]
    verbose: bool,

    /// Fetch and store contracts without analysis
    #[arg(short = 'd', long)]
    download_only: bool,

    /// Collect and print per-task timing statistics
    #[arg(short = 'b', long)]
    benchmark: bool,
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "solsentry=debug,solsentry_scanner=debug"
    } else {
        "solsentry=info,solsentry_scanner=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// First interrupt cancels the run for a graceful flush; a second one
/// forces an immediate exit with code 130.
fn install_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let interrupted = AtomicBool::new(false);
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            if interrupted.swap(true, Ordering::SeqCst) {
                eprintln!("{}", "force exit".bright_red());
                std::process::exit(130);
            }
            eprintln!(
                "{}",
                "interrupt received, finishing in-flight tasks (press again to force exit)"
                    .bright_yellow()
            );
            cancel.cancel();
        }
    });
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cancel = CancellationToken::new();
    install_signal_handler(cancel.clone());

    match run(cli, cancel).await {
        Ok(()) => {}
        Err(e) => {
            if matches!(
                e.downcast_ref::<ScanError>(),
                Some(ScanError::Cancelled)
            ) {
                std::process::exit(130);
            }
            error!("{e}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli, cancel: CancellationToken) -> Result<()> {
    let args = commands::scan::ScanArgs {
        mode: cli.mode,
        strategy: cli.strategy,
        input: cli.input,
        target: cli.target,
        addr: cli.addr,
        file: cli.file,
        range: cli.range,
        chain: cli.chain,
        provider: cli.provider,
        concurrency: cli.concurrency,
        timeout_secs: cli.timeout,
        proxy: cli.proxy,
        report_dir: cli.report_dir,
        verbose: cli.verbose,
        download_only: cli.download_only,
        benchmark: cli.benchmark,
    };
    commands::scan::execute(args, cancel).await
}
