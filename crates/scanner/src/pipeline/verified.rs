//! Verified pipeline: slither detectors first, then one AI verification
//! prompt per finding; only confirmed findings survive.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ast::{build_context, AstService, CallGraph};
use crate::config::ScanConfig;
use crate::error::{Result, ScanError};
use crate::explorer::ContractResolver;
use crate::llm::{AnalysisReport, LlmManager, ResponseKind, ResponseParser, Vulnerability};
use crate::prompt::{load_template, DetectorVariables, PromptBuilder, PromptVariables};
use crate::report::{MarkdownRenderer, ReportCollector, ScanRecord};
use crate::slither::{AnalysisConfig, StaticAnalyzer};

use super::{number_lines, normalize_solidity_version, VersionPolicy};

const CALLEE_DEPTH: usize = 5;
const CONTEXT_BUDGET: usize = 12_000;

/// Compiler complaints that mean the source cannot be analyzed statically
/// at all; the task fails as a warning rather than an error.
const COMPILATION_MARKERS: &[&str] = &["constructor()", "emit", "Invalid compilation"];

pub struct VerifiedDeps {
    pub config: ScanConfig,
    pub resolver: Arc<ContractResolver>,
    pub llm: Arc<LlmManager>,
    pub ast: Arc<AstService>,
    pub analyzer: Arc<StaticAnalyzer>,
    pub collector: Arc<ReportCollector>,
    pub version_policy: VersionPolicy,
}

#[derive(Debug, Default)]
struct Stats {
    success: usize,
    failed: usize,
    vulnerabilities: usize,
}

pub async fn run_verified(
    cancel: CancellationToken,
    deps: VerifiedDeps,
    mut targets: mpsc::Receiver<String>,
) -> Result<()> {
    info!("🧪 starting verified scan (slither + ai)");

    deps.llm.test_connection().await.map_err(|e| {
        ScanError::ConfigInvalid(format!("ai connection test failed: {e}"))
    })?;

    let strategy = if deps.config.strategy.is_empty() || deps.config.strategy == "all" {
        "default".to_string()
    } else {
        deps.config.strategy.clone()
    };
    let template = load_template(deps.config.mode, &strategy)?;

    {
        let cancel = cancel.clone();
        let collector = Arc::clone(&deps.collector);
        tokio::spawn(async move {
            cancel.cancelled().await;
            match collector.write_once(&MarkdownRenderer) {
                Ok(Some(path)) => info!(path = %path.display(), "partial report generated (interrupted)"),
                Ok(None) => {}
                Err(e) => warn!("failed to generate partial report: {e}"),
            }
        });
    }

    let deps = Arc::new(deps);
    let template = Arc::new(template);
    let builder = Arc::new(PromptBuilder::new());
    let stats = Arc::new(std::sync::Mutex::new(Stats::default()));
    let semaphore = Arc::new(Semaphore::new(deps.config.concurrency.max(1)));
    let mut tasks: JoinSet<()> = JoinSet::new();
    let mut task_index = 0usize;

    loop {
        // Reap finished workers so panics are counted as failures and the
        // pipeline continues.
        while let Some(joined) = tasks.try_join_next() {
            reap(joined, &stats);
        }

        let address = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            address = targets.recv() => address,
        };
        let Some(address) = address else {
            break;
        };
        task_index += 1;

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let deps = Arc::clone(&deps);
        let template = Arc::clone(&template);
        let builder = Arc::clone(&builder);
        let stats = Arc::clone(&stats);
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let _permit = permit;
            debug!(task = task_index, address, "task started");
            match process_address(&deps, &template, &builder, &cancel, &address).await {
                Ok(Some(record)) => {
                    let vulns = record.analysis.vulnerabilities.len();
                    {
                        let mut stats = stats.lock().unwrap_or_else(|e| e.into_inner());
                        stats.success += 1;
                        stats.vulnerabilities += vulns;
                    }
                    if vulns > 0 {
                        info!(address, vulns, "confirmed vulnerabilities");
                    }
                    deps.collector.append(record);
                }
                Ok(None) => {
                    debug!(task = task_index, address, "task skipped");
                    stats.lock().unwrap_or_else(|e| e.into_inner()).failed += 1;
                }
                Err(e) => {
                    warn!(task = task_index, address, "task failed: {e}");
                    stats.lock().unwrap_or_else(|e| e.into_inner()).failed += 1;
                }
            }
        });
    }

    while let Some(joined) = tasks.join_next().await {
        reap(joined, &stats);
    }

    {
        let stats = stats.lock().unwrap_or_else(|e| e.into_inner());
        info!(
            success = stats.success,
            failed = stats.failed,
            vulnerabilities = stats.vulnerabilities,
            "verified scan finished"
        );
    }

    match deps.collector.write_once(&MarkdownRenderer) {
        Ok(Some(path)) => info!(path = %path.display(), "report saved"),
        Ok(None) => {}
        Err(e) => {
            error!("report generation failed: {e}");
            return Err(e);
        }
    }

    if cancel.is_cancelled() {
        return Err(ScanError::Cancelled);
    }
    Ok(())
}

fn reap(
    joined: std::result::Result<(), tokio::task::JoinError>,
    stats: &Arc<std::sync::Mutex<Stats>>,
) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("worker panicked: {e}");
            stats.lock().unwrap_or_else(|err| err.into_inner()).failed += 1;
        }
    }
}

async fn process_address(
    deps: &VerifiedDeps,
    template: &str,
    builder: &PromptBuilder,
    cancel: &CancellationToken,
    address: &str,
) -> Result<Option<ScanRecord>> {
    let contract = deps.resolver.resolve(address).await?;
    if contract.is_bytecode() {
        info!(address, "contract is bytecode only, skipping");
        return Ok(None);
    }

    let code = crate::flatten::clean_code(&contract.source)
        .await
        .unwrap_or_else(|_| {
            let (raw, _) = crate::flatten::detach_metadata(&contract.source);
            raw.to_string()
        });

    let solc_version = match deps.version_policy.detect(&code) {
        Some(version) => normalize_solidity_version(&version),
        None => {
            warn!(address, "no pragma found, defaulting to 0.8.0");
            "0.8.0".to_string()
        }
    };
    debug!(address, solc_version, "running static analysis");

    let static_result = match deps
        .analyzer
        .analyze(
            &code,
            &AnalysisConfig {
                contract_name: "Contract".to_string(),
                solc_version,
                address: contract.effective_address.clone(),
                optimization: false,
                via_ir: false,
            },
        )
        .await
    {
        Ok(result) => result,
        Err(e) => {
            let message = e.to_string();
            if COMPILATION_MARKERS.iter().any(|m| message.contains(m)) {
                warn!(address, "slither compilation failed: {message}");
            } else {
                warn!(address, "slither analysis failed: {message}");
            }
            return Ok(None);
        }
    };
    info!(
        address,
        detectors = static_result.detectors.len(),
        "slither finished"
    );

    let (verified, false_positives) = verify_detectors(
        deps,
        template,
        builder,
        cancel,
        &contract.effective_address,
        &code,
        &static_result.detectors,
    )
    .await?;

    let summary = format!(
        "Slither: {} | Verified: {} | FP: {}",
        static_result.detectors.len(),
        verified.len(),
        false_positives
    );
    let raw_response = format!(
        "Slither Results: {}\nAI Verified: {}",
        static_result.detectors.len(),
        verified.len()
    );

    Ok(Some(ScanRecord {
        address: address.to_string(),
        resolved_address: contract.effective_address.clone(),
        is_proxy: contract.is_proxy,
        timestamp: chrono::Local::now(),
        mode: deps.config.mode.as_str().to_string(),
        strategy: "slither_scan".to_string(),
        analysis: AnalysisReport {
            vulnerabilities: verified,
            summary,
            raw_response,
            ..Default::default()
        },
    }))
}

/// One verification prompt per detector finding; the confirmed list takes
/// its severity from the model, not the detector.
async fn verify_detectors(
    deps: &VerifiedDeps,
    template: &str,
    builder: &PromptBuilder,
    cancel: &CancellationToken,
    address: &str,
    code: &str,
    detectors: &[crate::slither::Detector],
) -> Result<(Vec<Vulnerability>, usize)> {
    let mut verified = Vec::new();
    let mut false_positives = 0usize;

    if detectors.is_empty() {
        info!(address, "no static issues found, skipping ai verification");
        return Ok((verified, false_positives));
    }

    let mut vars = PromptVariables {
        contract_address: address.to_string(),
        contract_code: number_lines(code),
        ..Default::default()
    };
    if let Ok(parsed) = deps.ast.parse_source(code).await {
        let graph = CallGraph::build(&parsed);
        if !graph.functions.is_empty() {
            vars.apply_call_graph(&build_context(
                &graph,
                &parsed,
                CALLEE_DEPTH,
                CONTEXT_BUDGET,
            ));
        }
    }

    let parser = ResponseParser::new(ResponseKind::Verification);
    for (i, detector) in detectors.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(ScanError::Cancelled);
        }
        debug!(
            address,
            check = %detector.check,
            "verifying issue {}/{}",
            i + 1,
            detectors.len()
        );

        let prompt = builder.build_verification(
            template,
            &vars,
            &DetectorVariables {
                check: detector.check.clone(),
                impact: detector.impact.clone(),
                confidence: detector.confidence.clone(),
                description: detector.description.clone(),
                line_numbers: detector.line_numbers.clone(),
            },
        )?;

        let analysis = match deps
            .llm
            .analyze_contract(cancel, code, &prompt, ResponseKind::Verification)
            .await
        {
            Ok(analysis) => analysis,
            Err(e) => {
                warn!(address, check = %detector.check, "ai verification failed: {e}");
                continue;
            }
        };

        let verdict = match parser.parse_verification(&analysis.raw_response) {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(address, check = %detector.check, "failed to parse ai response: {e}");
                continue;
            }
        };
        info!(
            address,
            check = %detector.check,
            real = verdict.is_vulnerability,
            severity = %verdict.severity,
            "ai decision"
        );

        if verdict.is_vulnerability {
            verified.push(Vulnerability {
                vuln_type: detector.check.clone(),
                severity: verdict.severity,
                description: format!(
                    "Slither: {}\nAI: Confirmed\nReason: {}",
                    detector.description, verdict.reason
                ),
                location: address.to_string(),
                line_numbers: detector.line_numbers.clone(),
                references: vec![format!("Slither Detector: {}", detector.check)],
                ..Default::default()
            });
        } else {
            false_positives += 1;
        }
    }

    Ok((verified, false_positives))
}
