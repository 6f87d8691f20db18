//! Prompt templates and exploit-library inputs.
//!
//! Strategy templates are tera documents loaded from the strategy
//! directory when present, with embedded fallbacks so a bare checkout
//! still scans. Compiled templates are cached by content hash.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tera::Tera;
use tracing::debug;

use crate::ast::CallGraphContext;
use crate::config::ScanMode;
use crate::error::{Result, ScanError};

const EMBEDDED_GENERIC_SCAN: &str = include_str!("templates/generic_scan.tmpl");
const EMBEDDED_VERIFY_FINDING: &str = include_str!("templates/verify_finding.tmpl");

const TEMPLATE_CACHE_CAP: usize = 64;

/// Variables a strategy template can interpolate.
#[derive(Debug, Clone, Default)]
pub struct PromptVariables {
    pub contract_address: String,
    pub contract_code: String,
    pub strategy: String,
    pub input_file_content: String,

    pub enable_call_graph: bool,
    pub call_graph_info: String,
    pub callers_code: String,
    pub callees_code: String,
    pub enriched_context: String,

    pub total_functions: usize,
    pub public_functions: usize,
    pub internal_functions: usize,
}

impl PromptVariables {
    pub fn apply_call_graph(&mut self, ctx: &CallGraphContext) {
        self.enable_call_graph = true;
        self.call_graph_info = ctx.info.clone();
        self.callees_code = ctx.callees_code.clone();
        self.enriched_context = ctx.tree.clone();
        self.total_functions = ctx.total_functions;
        self.public_functions = ctx.public_functions;
        self.internal_functions = ctx.internal_functions;
    }

    fn context(&self) -> tera::Context {
        let mut ctx = tera::Context::new();
        ctx.insert("contract_address", &self.contract_address);
        ctx.insert("contract_code", &self.contract_code);
        ctx.insert("strategy", &self.strategy);
        ctx.insert("input_file_content", &self.input_file_content);
        ctx.insert("enable_call_graph", &self.enable_call_graph);
        ctx.insert("call_graph_info", &self.call_graph_info);
        ctx.insert("callers_code", &self.callers_code);
        ctx.insert("callees_code", &self.callees_code);
        ctx.insert("enriched_context", &self.enriched_context);
        ctx.insert("total_functions", &self.total_functions);
        ctx.insert("public_functions", &self.public_functions);
        ctx.insert("internal_functions", &self.internal_functions);
        ctx
    }
}

/// Extra variables of a verification prompt.
#[derive(Debug, Clone, Default)]
pub struct DetectorVariables {
    pub check: String,
    pub impact: String,
    pub confidence: String,
    pub description: String,
    pub line_numbers: Vec<u64>,
}

const CALL_GRAPH_VARIABLES: &[&str] = &[
    "enable_call_graph",
    "call_graph_info",
    "callers_code",
    "callees_code",
    "enriched_context",
];

/// Whether a template interpolates any call-graph variable; preprocessing
/// builds the graph only when it does.
pub fn template_needs_call_graph(template: &str) -> bool {
    CALL_GRAPH_VARIABLES.iter().any(|v| template.contains(v))
}

pub struct PromptBuilder {
    cache: DashMap<String, Arc<Tera>>,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self {
            cache: DashMap::new(),
        }
    }

    pub fn build(&self, template: &str, vars: &PromptVariables) -> Result<String> {
        self.render(template, vars.context())
    }

    pub fn build_verification(
        &self,
        template: &str,
        vars: &PromptVariables,
        detector: &DetectorVariables,
    ) -> Result<String> {
        let mut ctx = vars.context();
        ctx.insert("detector_check", &detector.check);
        ctx.insert("detector_impact", &detector.impact);
        ctx.insert("detector_confidence", &detector.confidence);
        ctx.insert("detector_description", &detector.description);
        ctx.insert(
            "line_numbers",
            &detector
                .line_numbers
                .iter()
                .map(u64::to_string)
                .collect::<Vec<_>>()
                .join(", "),
        );
        self.render(template, ctx)
    }

    fn render(&self, template: &str, ctx: tera::Context) -> Result<String> {
        let key = hex::encode(Sha256::digest(template.as_bytes()));
        let tera = match self.cache.get(&key) {
            Some(entry) => Arc::clone(entry.value()),
            None => {
                let mut tera = Tera::default();
                tera.add_raw_template("prompt", template)
                    .map_err(|e| ScanError::ConfigInvalid(format!("template parse: {e}")))?;
                let tera = Arc::new(tera);
                if self.cache.len() >= TEMPLATE_CACHE_CAP {
                    self.cache.clear();
                }
                self.cache.insert(key, Arc::clone(&tera));
                tera
            }
        };
        tera.render("prompt", &ctx)
            .map_err(|e| ScanError::ConfigInvalid(format!("template render: {e}")))
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn template_search_paths(mode: ScanMode, strategy: &str) -> Vec<PathBuf> {
    let mode = mode.as_str();
    vec![
        PathBuf::from("strategy")
            .join("prompts")
            .join(mode)
            .join(format!("{strategy}.tmpl")),
        PathBuf::from("src")
            .join("strategy")
            .join("prompts")
            .join(mode)
            .join(format!("{strategy}.tmpl")),
    ]
}

/// Loads a strategy template from the strategy directory, falling back to
/// the embedded defaults.
pub fn load_template(mode: ScanMode, strategy: &str) -> Result<String> {
    let strategy = match (mode, strategy) {
        (ScanMode::Targeted, "" | "default" | "all") => "generic_scan",
        (ScanMode::Verified, "" | "all") => "default",
        (_, other) => other,
    };

    for path in template_search_paths(mode, strategy) {
        if let Ok(content) = std::fs::read_to_string(&path) {
            debug!(path = %path.display(), "loaded strategy template");
            return Ok(content);
        }
    }

    match (mode, strategy) {
        (ScanMode::Targeted, "generic_scan") => Ok(EMBEDDED_GENERIC_SCAN.to_string()),
        (ScanMode::Verified, "default") => Ok(EMBEDDED_VERIFY_FINDING.to_string()),
        _ => Err(ScanError::ConfigInvalid(format!(
            "template not found for strategy: {strategy}"
        ))),
    }
}

const EXPLOIT_SECTIONS: &[(&str, &str)] = &[
    ("vulnerable_contract", "[Vulnerable Contract Source]"),
    ("vulnerability_description", "[Vulnerability Description]"),
    ("foundry_reproduction", "[Foundry Reproduction]"),
];

/// Extracts the code blocks of an exploit-library TOML snippet into
/// prompt-ready text. Files without the known sections pass through
/// verbatim.
pub fn extract_exploit_sections(content: &str) -> String {
    let Ok(value) = content.parse::<toml::Value>() else {
        return content.to_string();
    };
    let mut out = String::new();
    for (section, label) in EXPLOIT_SECTIONS {
        if let Some(code) = value
            .get(section)
            .and_then(|table| table.get("code"))
            .and_then(toml::Value::as_str)
        {
            out.push_str(label);
            out.push('\n');
            out.push_str(code.trim());
            out.push_str("\n\n");
        }
    }
    if out.is_empty() {
        content.to_string()
    } else {
        out
    }
}

/// Loads an `-i` input file, resolving bare names against the exploit
/// library directory and processing TOML snippets.
pub fn load_input_file(input: &str) -> Result<String> {
    let path = resolve_input_path(input)
        .ok_or_else(|| ScanError::ConfigInvalid(format!("input file not found: {input}")))?;
    let content = std::fs::read_to_string(&path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("sol") => Ok(content),
        _ => Ok(extract_exploit_sections(&content)),
    }
}

fn resolve_input_path(input: &str) -> Option<PathBuf> {
    let direct = PathBuf::from(input);
    if direct.exists() {
        return Some(direct);
    }
    if input.contains('/') || input.contains('\\') {
        return None;
    }
    for base in [
        Path::new("strategy").join("exp_libs").join("mode1"),
        Path::new("src").join("strategy").join("exp_libs").join("mode1"),
    ] {
        for candidate in [base.join(input), base.join(format!("{input}.toml"))] {
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }
    None
}

/// `-i all`: every exploit-library snippet, one strategy per file.
pub fn glob_exploit_library() -> Vec<PathBuf> {
    for base in [
        Path::new("strategy").join("exp_libs").join("mode1"),
        Path::new("src").join("strategy").join("exp_libs").join("mode1"),
    ] {
        let Ok(entries) = std::fs::read_dir(&base) else {
            continue;
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("toml"))
            .collect();
        if !files.is_empty() {
            files.sort();
            return files;
        }
    }
    Vec::new()
}
