//! Configuration: the `settings.yaml` application config and the runtime
//! scan configuration assembled by the CLI.

pub mod keys;

pub use keys::KeyRotator;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScanError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub ai: HashMap<String, AiProviderConfig>,
    #[serde(default)]
    pub chains: HashMap<String, ChainConfig>,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AiProviderConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub proxy: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainConfig {
    #[serde(default)]
    pub chain_id: Option<u64>,
    #[serde(default)]
    pub rpc_urls: Vec<String>,
    #[serde(default)]
    pub explorer: ExplorerConfig,
    #[serde(default)]
    pub table_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExplorerConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_keys: Vec<String>,
    #[serde(default)]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_db_name")]
    pub name: String,
}

fn default_db_name() -> String {
    "contracts.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: String::new(),
            user: String::new(),
            password: String::new(),
            name: default_db_name(),
        }
    }
}

const CONFIG_CANDIDATES: &[&str] = &[
    "config/settings.yaml",
    "settings.yaml",
    "src/config/settings.yaml",
    "../config/settings.yaml",
];

impl AppConfig {
    /// Loads `settings.yaml` from the conventional locations. A missing
    /// config file is fatal at startup.
    pub fn load() -> Result<Self> {
        let path = CONFIG_CANDIDATES
            .iter()
            .map(Path::new)
            .find(|p| p.exists())
            .ok_or_else(|| {
                ScanError::ConfigInvalid("settings.yaml not found".to_string())
            })?;
        Self::load_from(path)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ScanError::ConfigInvalid(format!(
                "failed to read {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let config: Self = serde_yaml::from_str(&content)
            .map_err(|e| ScanError::ConfigInvalid(format!("failed to parse settings.yaml: {e}")))?;
        Ok(config)
    }

    /// Looks up a provider section, accepting common aliases.
    pub fn ai_provider(&self, provider: &str) -> Result<&AiProviderConfig> {
        let key = canonical_provider(provider);
        self.ai
            .get(key)
            .or_else(|| self.ai.get(provider))
            .ok_or_else(|| {
                ScanError::ConfigInvalid(format!("unsupported AI provider: {provider}"))
            })
    }

    pub fn chain(&self, tag: &str) -> Result<&ChainConfig> {
        self.chains
            .get(tag)
            .ok_or_else(|| ScanError::ConfigInvalid(format!("unsupported chain: {tag}")))
    }

    /// Table name for a chain, defaulting to the chain tag itself.
    pub fn table_name(&self, tag: &str) -> Result<String> {
        let chain = self.chain(tag)?;
        let name = chain
            .table_name
            .clone()
            .unwrap_or_else(|| tag.to_string());
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ScanError::ConfigInvalid(format!(
                "invalid table name: {name}"
            )));
        }
        Ok(name)
    }
}

pub fn canonical_provider(provider: &str) -> &'static str {
    match provider {
        "openai" | "gpt4" | "chatgpt" => "openai",
        "deepseek" => "deepseek",
        "gemini" => "gemini",
        "local-llm" | "local_llm" | "ollama" => "local_llm",
        _ => "openai",
    }
}

impl ExplorerConfig {
    /// All configured keys: the `api_keys` list plus the single `api_key`
    /// fallback, each entry possibly holding several keys separated by
    /// commas or whitespace.
    pub fn all_keys(&self) -> Vec<String> {
        let mut out = Vec::new();
        for raw in self.api_keys.iter().chain(std::iter::once(&self.api_key)) {
            out.extend(split_keys(raw));
        }
        out
    }
}

/// Splits a raw key string on commas, semicolons and whitespace, dropping
/// blanks and duplicates while preserving first-seen order.
pub fn split_keys(raw: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    raw.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .filter(|k| seen.insert(k.to_string()))
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    Targeted,
    Verified,
}

impl ScanMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mode1" | "targeted" => Ok(Self::Targeted),
            "mode2" | "verified" | "fuzzy" => Ok(Self::Verified),
            other => Err(ScanError::ConfigInvalid(format!("unknown mode: {other}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Targeted => "mode1",
            Self::Verified => "mode2",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetSource {
    Db,
    File,
    Single,
    Live,
}

impl TargetSource {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "db" => Ok(Self::Db),
            "file" | "filepath" => Ok(Self::File),
            "contract" | "address" | "single" => Ok(Self::Single),
            "last" | "live" => Ok(Self::Live),
            other => Err(ScanError::ConfigInvalid(format!(
                "unsupported target source: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub start: u64,
    pub end: u64,
}

impl BlockRange {
    /// Parses `<start>-<end>`.
    pub fn parse(s: &str) -> Result<Self> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| ScanError::ConfigInvalid(format!("invalid block range: {s}")))?;
        let start = start
            .trim()
            .parse()
            .map_err(|_| ScanError::ConfigInvalid(format!("invalid block range: {s}")))?;
        let end = end
            .trim()
            .parse()
            .map_err(|_| ScanError::ConfigInvalid(format!("invalid block range: {s}")))?;
        if start > end {
            return Err(ScanError::ConfigInvalid(format!(
                "block range start after end: {s}"
            )));
        }
        Ok(Self { start, end })
    }
}

/// Runtime configuration of one scan run, assembled by the CLI layer.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub mode: ScanMode,
    pub strategy: String,
    /// `-i`: an exploit-library file, the literal "all", or empty.
    pub input: Option<String>,
    pub target_source: TargetSource,
    pub target_file: Option<PathBuf>,
    pub target_address: Option<String>,
    pub block_range: Option<BlockRange>,
    pub chain: String,
    pub provider: String,
    pub concurrency: usize,
    pub timeout: Duration,
    pub proxy: Option<String>,
    pub report_dir: PathBuf,
    pub verbose: bool,
    pub download_only: bool,
    pub benchmark: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            mode: ScanMode::Targeted,
            strategy: "all".to_string(),
            input: None,
            target_source: TargetSource::Db,
            target_file: None,
            target_address: None,
            block_range: None,
            chain: "eth".to_string(),
            provider: "openai".to_string(),
            concurrency: 5,
            timeout: Duration::from_secs(120),
            proxy: None,
            report_dir: PathBuf::from("reports"),
            verbose: false,
            download_only: false,
            benchmark: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_keys_dedupes_and_trims() {
        let keys = split_keys("a, b;c\nc  a\t d");
        assert_eq!(keys, vec!["a", "b", "c", "d"]);
        assert!(split_keys("   ").is_empty());
    }

    #[test]
    fn test_explorer_all_keys_merges_list_and_fallback() {
        let explorer = ExplorerConfig {
            api_key: "k3".to_string(),
            api_keys: vec!["k1,k2".to_string()],
            base_url: String::new(),
        };
        assert_eq!(explorer.all_keys(), vec!["k1", "k2", "k3"]);
    }

    #[test]
    fn test_parse_config_yaml() {
        let yaml = r#"
ai:
  openai:
    api_key: sk-test
    base_url: https://api.openai.com/v1
    model: gpt-4-turbo
chains:
  eth:
    chain_id: 1
    rpc_urls:
      - https://eth.llamarpc.com
    explorer:
      api_key: ABC
      base_url: https://api.etherscan.io/api
database:
  name: contracts.db
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.ai_provider("gpt4").unwrap().model, "gpt-4-turbo");
        assert_eq!(config.chain("eth").unwrap().chain_id, Some(1));
        assert_eq!(config.table_name("eth").unwrap(), "eth");
    }

    #[test]
    fn test_table_name_rejects_injection() {
        let mut config = AppConfig::default();
        config.chains.insert(
            "bad".to_string(),
            ChainConfig {
                table_name: Some("x; drop table".to_string()),
                ..Default::default()
            },
        );
        assert!(config.table_name("bad").is_err());
    }

    #[test]
    fn test_block_range_parse() {
        let range = BlockRange::parse("100-200").unwrap();
        assert_eq!(range.start, 100);
        assert_eq!(range.end, 200);
        assert!(BlockRange::parse("200-100").is_err());
        assert!(BlockRange::parse("abc").is_err());
    }

    #[test]
    fn test_mode_and_source_parse() {
        assert_eq!(ScanMode::parse("mode1").unwrap(), ScanMode::Targeted);
        assert_eq!(ScanMode::parse("MODE2").unwrap(), ScanMode::Verified);
        assert!(ScanMode::parse("mode3").is_err());
        assert_eq!(TargetSource::parse("filepath").unwrap(), TargetSource::File);
        assert_eq!(TargetSource::parse("last").unwrap(), TargetSource::Live);
    }
}
