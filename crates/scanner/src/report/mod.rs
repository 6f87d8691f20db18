//! Report aggregation: mutex-guarded append during the run, one atomic
//! markdown write at completion or cancellation.

pub mod markdown;
pub mod storage;

pub use markdown::{Generator, MarkdownRenderer};
pub use storage::FileStorage;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Local};

use crate::error::Result;
use crate::llm::AnalysisReport;

/// One completed task.
#[derive(Debug, Clone)]
pub struct ScanRecord {
    pub address: String,
    pub resolved_address: String,
    pub is_proxy: bool,
    pub timestamp: DateTime<Local>,
    pub mode: String,
    pub strategy: String,
    pub analysis: AnalysisReport,
}

impl ScanRecord {
    /// `0xAAA… (Implementation: 0xBBB…)` when the scan followed a proxy.
    pub fn display_address(&self) -> String {
        if !self.resolved_address.is_empty() && self.resolved_address != self.address {
            if self.is_proxy {
                format!("{} (Implementation: {})", self.address, self.resolved_address)
            } else {
                format!("{} (Scanned Address: {})", self.address, self.resolved_address)
            }
        } else {
            self.address.clone()
        }
    }
}

#[derive(Debug, Clone)]
pub struct Report {
    pub mode: String,
    pub strategy: String,
    pub provider: String,
    pub scan_time: DateTime<Local>,
    pub results: Vec<ScanRecord>,
}

impl Report {
    pub fn total_contracts(&self) -> usize {
        self.results.len()
    }

    pub fn vulnerable_contracts(&self) -> usize {
        self.results
            .iter()
            .filter(|r| !r.analysis.vulnerabilities.is_empty())
            .count()
    }

    pub fn severity_histogram(&self) -> BTreeMap<String, usize> {
        let mut histogram = BTreeMap::new();
        for record in &self.results {
            for vuln in &record.analysis.vulnerabilities {
                *histogram.entry(vuln.severity.clone()).or_insert(0) += 1;
            }
        }
        histogram
    }
}

/// Append-only result sink shared by all workers. The write gate
/// guarantees at most one report file per run, whichever of completion or
/// cancellation flushes first.
pub struct ReportCollector {
    mode: String,
    strategy: Mutex<String>,
    provider: String,
    scan_time: DateTime<Local>,
    out_dir: PathBuf,
    results: Mutex<Vec<ScanRecord>>,
    written: AtomicBool,
}

impl ReportCollector {
    pub fn new(mode: &str, strategy: &str, provider: &str, out_dir: &Path) -> Self {
        Self {
            mode: mode.to_string(),
            strategy: Mutex::new(strategy.to_string()),
            provider: provider.to_string(),
            scan_time: Local::now(),
            out_dir: out_dir.to_path_buf(),
            results: Mutex::new(Vec::new()),
            written: AtomicBool::new(false),
        }
    }

    pub fn append(&self, record: ScanRecord) {
        let mut results = self.results.lock().unwrap_or_else(|e| e.into_inner());
        if results.is_empty() && !record.strategy.is_empty() {
            let mut strategy = self.strategy.lock().unwrap_or_else(|e| e.into_inner());
            *strategy = record.strategy.clone();
        }
        results.push(record);
    }

    pub fn len(&self) -> usize {
        self.results.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the current state; rendering never holds the append
    /// lock across I/O.
    pub fn snapshot(&self) -> Report {
        let results = self
            .results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        Report {
            mode: self.mode.clone(),
            strategy: self
                .strategy
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            provider: self.provider.clone(),
            scan_time: self.scan_time,
            results,
        }
    }

    /// Renders and persists the report exactly once. Returns the path of
    /// the written file, or `None` when a flush already happened or there
    /// is nothing to write.
    pub fn write_once(&self, generator: &dyn Generator) -> Result<Option<PathBuf>> {
        let report = self.snapshot();
        if report.results.is_empty() {
            return Ok(None);
        }
        if self.written.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }
        let content = generator.generate(&report);
        let storage = FileStorage::new(&self.out_dir);
        storage.save(&report.mode, &content).map(Some)
    }
}
