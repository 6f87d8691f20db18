//! The two scan pipelines and their shared plumbing: single-flight
//! memoization, preprocessing and run statistics.

pub mod targeted;
pub mod verified;
pub mod version;

pub use targeted::run_targeted;
pub use verified::run_verified;
pub use version::{normalize_solidity_version, VersionPolicy};

use std::sync::Arc;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::ast::{build_context, AstService, CallGraph, CallGraphContext};
use crate::error::Result;
use crate::explorer::FetchedContract;
use crate::flatten;

/// Single-flight memoization: N concurrent callers of the same key share
/// one computation; failed attempts are not cached so a transient miss can
/// be retried. Values are content-shared behind `Arc`.
pub(crate) struct SingleFlight<T> {
    cells: DashMap<String, Arc<OnceCell<Arc<T>>>>,
}

impl<T> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            cells: DashMap::new(),
        }
    }

    pub async fn get_or_try_init<F, Fut>(&self, key: &str, init: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let cell = self
            .cells
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        cell.get_or_try_init(|| async { init().await.map(Arc::new) })
            .await
            .cloned()
    }
}

pub(crate) fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Cache key of derived artifacts: effective address plus source digest,
/// so upstream normalization cannot alias distinct sources.
pub(crate) fn preprocess_key(contract: &FetchedContract) -> String {
    format!(
        "{}:{}",
        contract.effective_address,
        content_hash(&contract.source)
    )
}

/// Preprocessing output shared between strategies of one contract.
pub struct Preprocessed {
    pub final_code: String,
    pub original_len: usize,
    pub call_graph: Option<CallGraphContext>,
}

/// Normalizes and enriches one contract: flatten, optional call graph,
/// dead-code pruning. Flatten and compiler failures degrade to the raw
/// source rather than failing the task.
pub(crate) async fn preprocess_contract(
    ast: &AstService,
    contract: &FetchedContract,
    need_call_graph: bool,
    callee_depth: usize,
    context_budget: usize,
) -> Result<Preprocessed> {
    let original_len = contract.source.len();

    let clean = match flatten::clean_code(&contract.source).await {
        Ok(clean) => clean,
        Err(e) => {
            warn!(address = %contract.effective_address, "normalization failed, using raw source: {e}");
            let (raw, _) = flatten::detach_metadata(&contract.source);
            return Ok(Preprocessed {
                final_code: raw.to_string(),
                original_len,
                call_graph: None,
            });
        }
    };

    let mut final_code = clean.clone();
    let mut call_graph = None;

    match ast.parse_source(&clean).await {
        Ok(parsed) => {
            if need_call_graph {
                let graph = CallGraph::build(&parsed);
                if !graph.functions.is_empty() {
                    call_graph = Some(build_context(&graph, &parsed, callee_depth, context_budget));
                }
            }
            if let Some(pruned) = crate::ast::prune_dead_code(&parsed, "", true) {
                final_code = pruned;
            }
        }
        Err(e) => {
            debug!(address = %contract.effective_address, "ast parse unavailable, keeping source: {e}");
        }
    }

    Ok(Preprocessed {
        final_code,
        original_len,
        call_graph,
    })
}

/// Prefixes every line with its 1-based number, the shape verification
/// prompts reference detector line numbers against.
pub fn number_lines(code: &str) -> String {
    code.lines()
        .enumerate()
        .map(|(i, line)| format!("{}: {line}\n", i + 1))
        .collect()
}
