//! Solsentry scanning core.
//!
//! Resolves a stream of target addresses, acquires and canonicalizes
//! contract source, and drives two analysis pipelines — a template-driven
//! targeted pipeline and a static-analyzer-verified pipeline — under
//! shared rate, concurrency and cancellation discipline. Results are
//! aggregated into a single markdown report per run.

pub mod ast;
pub mod chain;
pub mod config;
pub mod db;
pub mod error;
pub mod explorer;
pub mod flatten;
pub mod limits;
pub mod llm;
pub mod pipeline;
pub mod prompt;
pub mod report;
pub mod slither;
pub mod targets;
pub mod ui;

pub use config::{AppConfig, ScanConfig, ScanMode, TargetSource};
pub use error::{Result, ScanError};
pub use llm::{Analyzer, LlmManager};
pub use pipeline::{run_targeted, run_verified};
pub use report::{Report, ScanRecord};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
