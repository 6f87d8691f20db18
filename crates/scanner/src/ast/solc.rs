//! Version-matched solc resolution.
//!
//! Compilers live in the per-user caches that solc-select and py-solc-x
//! maintain; a missing version is installed through solc-select at most
//! once per process, so concurrent scans race cleanly on the installer.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::error::{Result, ScanError};

/// Highest concrete `x.y.z` mentioned in any pragma constraint, the
/// version most likely to satisfy all of them.
pub fn extract_pragma_version(source: &str) -> Option<String> {
    let pragma_re = Regex::new(r"pragma\s+solidity\s+([^;]+);").ok()?;
    let version_re = Regex::new(r"(\d+)\.(\d+)\.(\d+)").ok()?;

    let mut highest: Option<(u32, u32, u32)> = None;
    for caps in pragma_re.captures_iter(source) {
        for v in version_re.captures_iter(&caps[1]) {
            let version = (
                v[1].parse().unwrap_or(0),
                v[2].parse().unwrap_or(0),
                v[3].parse().unwrap_or(0),
            );
            if highest.map(|h| version > h).unwrap_or(true) {
                highest = Some(version);
            }
        }
    }
    highest.map(|(a, b, c)| format!("{a}.{b}.{c}"))
}

pub fn normalize_version(version: &str) -> String {
    let mut v = version.trim().trim_start_matches('v');
    for prefix in ["^", ">=", "<=", ">", "<", "~", "="] {
        v = v.trim_start_matches(prefix);
    }
    v.trim().to_string()
}

pub struct SolcManager {
    path_cache: DashMap<String, PathBuf>,
    install_once: DashMap<String, Arc<OnceCell<Option<PathBuf>>>>,
}

impl SolcManager {
    pub fn new() -> Self {
        Self {
            path_cache: DashMap::new(),
            install_once: DashMap::new(),
        }
    }

    /// Resolves the binary for a version: cache, then the solc-select and
    /// solcx artifact directories, then a one-shot install attempt.
    pub async fn solc_path(&self, version: &str) -> Result<PathBuf> {
        let version = normalize_version(version);
        if version.is_empty() {
            return Err(ScanError::CompilerFailed("version is empty".to_string()));
        }

        if let Some(path) = self.path_cache.get(&version) {
            if path.exists() {
                return Ok(path.clone());
            }
        }

        if let Some(path) = installed_path(&version) {
            self.path_cache.insert(version.clone(), path.clone());
            return Ok(path);
        }

        let cell = self
            .install_once
            .entry(version.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        let installed = cell
            .get_or_init(|| {
                let version = version.clone();
                async move {
                    debug!(version, "installing solc");
                    match install_version(&version).await {
                        Ok(()) => installed_path(&version),
                        Err(e) => {
                            warn!(version, "solc install failed: {e}");
                            None
                        }
                    }
                }
            })
            .await;

        match installed {
            Some(path) => {
                self.path_cache.insert(version, path.clone());
                Ok(path.clone())
            }
            None => Err(ScanError::CompilerFailed(format!(
                "solc {version} unavailable; install manually with: solc-select install {version}"
            ))),
        }
    }
}

impl Default for SolcManager {
    fn default() -> Self {
        Self::new()
    }
}

fn installed_path(version: &str) -> Option<PathBuf> {
    let home = dirs::home_dir()?;
    let candidates = [
        home.join(".solc-select")
            .join("artifacts")
            .join(format!("solc-{version}"))
            .join(format!("solc-{version}")),
        home.join(".solc-select")
            .join("artifacts")
            .join(version)
            .join(format!("solc-{version}")),
        home.join(".solcx").join(format!("solc-v{version}")),
        home.join(".solcx").join(format!("solc-{version}")),
        home.join(".solcx")
            .join(format!("solc-v{version}"))
            .join("bin")
            .join("solc"),
    ];
    candidates.into_iter().find(|p| p.is_file())
}

async fn install_version(version: &str) -> Result<()> {
    let output = tokio::process::Command::new("solc-select")
        .arg("install")
        .arg(version)
        .output()
        .await
        .map_err(|e| ScanError::CompilerFailed(format!("solc-select not available: {e}")))?;
    if !output.status.success() {
        return Err(ScanError::CompilerFailed(format!(
            "solc-select install {version} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}
