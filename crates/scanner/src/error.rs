//! Core error taxonomy.
//!
//! Each variant carries a fixed disposition: transient kinds are retried at
//! their own layer, per-task kinds fail the task and surface as warnings,
//! `ConfigInvalid` and terminal `Cancelled` abort the run.

use thiserror::Error;

use crate::llm::LlmError;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Every RPC endpoint failed the liveness probe.
    #[error("all rpc endpoints are unavailable")]
    EndpointsUnavailable,

    #[error("explorer transient error: {0}")]
    ExplorerTransient(String),

    /// The explorer answered but the contract is not source-verified.
    #[error("contract not verified: {0}")]
    NotVerified(String),

    #[error("source flattening failed: {0}")]
    FlattenFailed(String),

    #[error("compiler invocation failed: {0}")]
    CompilerFailed(String),

    #[error("static analyzer failed: {0}")]
    AnalyzerFailed(String),

    #[error("response parse failed: {0}")]
    ParseFailed(String),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Db(#[from] rusqlite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ScanError {
    /// Transient kinds are safe to retry at the caller's layer.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ExplorerTransient(_) | Self::Llm(LlmError::Transient { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
