//! Source normalization: multi-file standard-JSON detection, flattening
//! through `forge`, pragma unification and library-section cleanup.

use std::collections::HashMap;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Result, ScanError};

const METADATA_PREFIX: &str = "// Contract-Metadata: ";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub contract_name: String,
}

/// Prepends a one-line metadata header naming the main contract. The
/// header survives storage and lets the flattener score the declared main
/// file.
pub fn attach_metadata(source: &str, contract_name: &str) -> String {
    if contract_name.trim().is_empty() {
        return source.to_string();
    }
    let meta = SourceMetadata {
        contract_name: contract_name.trim().to_string(),
    };
    match serde_json::to_string(&meta) {
        Ok(json) => format!("{METADATA_PREFIX}{json}\n{source}"),
        Err(_) => source.to_string(),
    }
}

pub fn detach_metadata(source: &str) -> (&str, Option<SourceMetadata>) {
    if let Some(rest) = source.strip_prefix(METADATA_PREFIX) {
        if let Some(newline) = rest.find('\n') {
            if let Ok(meta) = serde_json::from_str::<SourceMetadata>(&rest[..newline]) {
                return (&rest[newline + 1..], Some(meta));
            }
        }
    }
    (source, None)
}

/// Multi-file standard-input JSON: a top-level object with a `"content"`
/// key somewhere inside.
pub fn is_json_source(source: &str) -> bool {
    let (clean, _) = detach_metadata(source);
    let trimmed = clean.trim_start();
    trimmed.starts_with('{') && trimmed.contains("\"content\"")
}

/// Explorers wrap some payloads in a second pair of braces.
fn normalize_json_payload(source: &str) -> &str {
    let trimmed = source.trim();
    if trimmed.starts_with("{{") && trimmed.ends_with("}}") {
        &trimmed[1..trimmed.len() - 1]
    } else {
        trimmed
    }
}

#[derive(Debug, Deserialize)]
struct StandardJsonInput {
    #[serde(default)]
    sources: HashMap<String, SourceFile>,
    #[serde(default)]
    settings: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct SourceFile {
    content: String,
}

/// Flattens a multi-file JSON payload into single-file Solidity. Plain
/// single-file source passes through untouched, so normalization is a
/// no-op on already-flat input.
pub async fn flatten_json_source(source: &str) -> Result<String> {
    let (clean, meta) = detach_metadata(source);
    if !is_json_source(clean) {
        return Ok(clean.to_string());
    }
    let main_name = meta.map(|m| m.contract_name).unwrap_or_default();
    flatten_with_forge(clean, &main_name).await
}

async fn flatten_with_forge(json_source: &str, main_contract: &str) -> Result<String> {
    let payload = normalize_json_payload(json_source);

    let input: StandardJsonInput = match serde_json::from_str(payload) {
        Ok(input) => input,
        Err(_) => {
            // Some explorers return the bare sources map without the
            // standard-input wrapper.
            let sources: HashMap<String, SourceFile> = serde_json::from_str(payload)
                .map_err(|_| {
                    ScanError::FlattenFailed("invalid multi-file JSON format".to_string())
                })?;
            StandardJsonInput {
                sources,
                settings: None,
            }
        }
    };
    if input.sources.is_empty() {
        return Err(ScanError::FlattenFailed(
            "multi-file JSON has no sources".to_string(),
        ));
    }

    // Ephemeral project directory, removed on every exit path when the
    // guard drops.
    let workdir = TempDir::with_prefix("forge_flatten_")
        .map_err(|e| ScanError::FlattenFailed(format!("tempdir: {e}")))?;

    let mut candidates: Vec<String> = Vec::new();
    let mut file_sizes: HashMap<String, usize> = HashMap::new();
    let mut all_files: Vec<String> = Vec::new();

    for (rel_path, file) in &input.sources {
        let clean_path = sanitize_rel_path(rel_path);
        let abs = workdir.path().join(&clean_path);
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ScanError::FlattenFailed(format!("mkdir: {e}")))?;
        }
        let content = file.content.replace("\r\n", "\n");
        std::fs::write(&abs, &content)
            .map_err(|e| ScanError::FlattenFailed(format!("write source: {e}")))?;

        all_files.push(clean_path.clone());
        if !clean_path.starts_with('@') && !clean_path.contains("node_modules") {
            file_sizes.insert(clean_path.clone(), content.len());
            candidates.push(clean_path);
        }
    }

    let main_file = pick_main_file(&candidates, &file_sizes, main_contract)
        .or_else(|| {
            all_files.sort();
            all_files.first().cloned()
        })
        .ok_or_else(|| ScanError::FlattenFailed("no source files".to_string()))?;

    write_project_file(workdir.path(), &input)?;

    let output = Command::new("forge")
        .arg("flatten")
        .arg(&main_file)
        .current_dir(workdir.path())
        .output()
        .await
        .map_err(|e| ScanError::FlattenFailed(format!("forge not available: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ScanError::FlattenFailed(format!(
            "forge flatten failed: {}",
            stderr.trim()
        )));
    }

    let flattened = String::from_utf8_lossy(&output.stdout).to_string();
    if !flattened.contains("pragma solidity") {
        return Err(ScanError::FlattenFailed(
            "forge flatten output has no pragma".to_string(),
        ));
    }

    debug!(main_file, "flattened multi-file source");
    Ok(cleanup_pragmas(&flattened))
}

fn sanitize_rel_path(rel_path: &str) -> String {
    let mut clean = rel_path.trim_start_matches("./").trim_start_matches('/');
    // Path traversal out of the ephemeral project is never legitimate.
    while clean.starts_with("../") {
        clean = &clean[3..];
    }
    let mut clean = clean.replace("/../", "/");
    if !clean.ends_with(".sol") {
        clean.push_str(".sol");
    }
    clean
}

/// Scores candidate files for the flatten entry point. Interface, abstract,
/// test and mock paths lose points; a file named after the declared main
/// contract wins outright; capped file size breaks the remaining ties.
fn pick_main_file(
    candidates: &[String],
    file_sizes: &HashMap<String, usize>,
    main_contract: &str,
) -> Option<String> {
    let mut best: Option<(i64, &String)> = None;
    for cand in candidates {
        let mut score: i64 = 100;

        if !main_contract.is_empty() {
            let base = Path::new(cand)
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("");
            if base.eq_ignore_ascii_case(main_contract) {
                score += 10_000;
            } else if base.to_lowercase().contains(&main_contract.to_lowercase()) {
                score += 5_000;
            }
        }

        let lower = cand.to_lowercase();
        if lower.contains("interface") {
            score -= 50;
        }
        if lower.contains("abstract") {
            score -= 30;
        }
        if lower.contains("test") {
            score -= 80;
        }
        if lower.contains("mock") {
            score -= 80;
        }

        score += (file_sizes.get(cand).copied().unwrap_or(0) as i64 / 100).min(50);

        match best {
            Some((best_score, best_cand))
                if score < best_score || (score == best_score && cand >= best_cand) => {}
            _ => best = Some((score, cand)),
        }
    }
    best.map(|(_, cand)| cand.clone())
}

/// Minimal foundry project file: source root, lib path, the solc version
/// elected from the sources, and the remappings carried by the JSON
/// settings.
fn write_project_file(dir: &Path, input: &StandardJsonInput) -> Result<()> {
    let mut config = String::from("[profile.default]\nsrc = \".\"\nout = \"out\"\nlibs = [\"lib\"]\n");

    if let Some(version) = extract_version_from_sources(&input.sources) {
        config.push_str(&format!("solc_version = \"{}\"\n", clamp_solc_version(&version)));
    }

    let mut remappings: Vec<String> = Vec::new();
    if let Some(settings) = &input.settings {
        if let Some(list) = settings.get("remappings").and_then(Value::as_array) {
            remappings.extend(list.iter().filter_map(Value::as_str).map(str::to_string));
        }
        if settings.get("viaIR").and_then(Value::as_bool) == Some(true) {
            config.push_str("via_ir = true\n");
        }
        if let Some(evm) = settings.get("evmVersion").and_then(Value::as_str) {
            if !evm.is_empty() {
                config.push_str(&format!("evm_version = \"{evm}\"\n"));
            }
        }
    }
    if !remappings.is_empty() {
        config.push_str("remappings = [\n");
        for r in &remappings {
            config.push_str(&format!("    \"{r}\",\n"));
        }
        config.push_str("]\n");
    }

    std::fs::write(dir.join("foundry.toml"), config)
        .map_err(|e| ScanError::FlattenFailed(format!("write foundry.toml: {e}")))
}

fn extract_version_from_sources(sources: &HashMap<String, SourceFile>) -> Option<String> {
    let pragma_re = Regex::new(r"pragma\s+solidity\s+([^;]+);").ok()?;
    let version_re = Regex::new(r"(\d+\.\d+\.\d+)").ok()?;
    for file in sources.values() {
        if let Some(caps) = pragma_re.captures(&file.content) {
            if let Some(v) = version_re.captures(&caps[1]) {
                return Some(v[1].to_string());
            }
        }
    }
    None
}

/// Forge rejects 0.9.x pragmas; clamp to the newest supported 0.8 release.
fn clamp_solc_version(version: &str) -> String {
    let mut parts = version.split('.');
    let major: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minor: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    if major == 0 && minor >= 9 {
        "0.8.26".to_string()
    } else {
        version.to_string()
    }
}

/// Collapses every `pragma solidity` line into a single `^X.Y.Z` pragma
/// carrying the highest version mentioned anywhere, placed directly after
/// the SPDX line (or at the top when there is none).
pub fn cleanup_pragmas(source: &str) -> String {
    let pragma_re = match Regex::new(r"pragma\s+solidity\s+[^;]+;") {
        Ok(re) => re,
        Err(_) => return source.to_string(),
    };
    let version_re = match Regex::new(r"(\d+)\.(\d+)\.(\d+)") {
        Ok(re) => re,
        Err(_) => return source.to_string(),
    };

    let mut highest: Option<(u32, u32, u32)> = None;
    for pragma in pragma_re.find_iter(source) {
        for caps in version_re.captures_iter(pragma.as_str()) {
            let version = (
                caps[1].parse().unwrap_or(0),
                caps[2].parse().unwrap_or(0),
                caps[3].parse().unwrap_or(0),
            );
            if highest.map(|h| version > h).unwrap_or(true) {
                highest = Some(version);
            }
        }
    }
    let Some((major, minor, patch)) = highest else {
        return source.to_string();
    };

    let cleaned = pragma_re.replace_all(source, "");
    let final_pragma = format!("pragma solidity ^{major}.{minor}.{patch};");

    let lines: Vec<&str> = cleaned.lines().collect();
    let spdx_index = lines
        .iter()
        .position(|line| line.contains("SPDX-License-Identifier"));

    let mut out: Vec<String> = Vec::with_capacity(lines.len() + 1);
    match spdx_index {
        Some(idx) => {
            out.extend(lines[..=idx].iter().map(|s| s.to_string()));
            out.push(final_pragma);
            out.extend(lines[idx + 1..].iter().map(|s| s.to_string()));
        }
        None => {
            out.push(final_pragma);
            out.extend(lines.iter().map(|s| s.to_string()));
        }
    }
    out.join("\n")
}

const LIBRARY_PATH_PATTERNS: &[&str] = &[
    "@openzeppelin",
    "node_modules",
    "lib/openzeppelin",
    "lib/solmate",
    "lib/forge-std",
    "test/",
    "mock/",
];

fn is_library_path(path: &str) -> bool {
    let lower = path.to_lowercase();
    if LIBRARY_PATH_PATTERNS.iter().any(|p| lower.contains(p)) {
        return true;
    }
    let file_name = path.rsplit('/').next().unwrap_or(path);
    let token_re = Regex::new(r"(?i)^(ERC|BEP)\d{2,}.*\.sol$|^I?ERC20\.sol$");
    match token_re {
        Ok(re) => re.is_match(file_name),
        Err(_) => false,
    }
}

/// Normalizes a stored source for analysis. Multi-file JSON goes through
/// forge flattening; already-flattened sources carrying `// File:` section
/// markers get their external-library sections commented out to save
/// prompt tokens.
pub async fn clean_code(source: &str) -> Result<String> {
    if is_json_source(source) {
        match flatten_json_source(source).await {
            Ok(flattened) => return Ok(flattened),
            Err(e) => {
                warn!("flatten failed, using raw source: {e}");
                return Err(e);
            }
        }
    }
    let (clean, _) = detach_metadata(source);
    Ok(comment_out_library_sections(clean))
}

fn comment_out_library_sections(source: &str) -> String {
    let file_re = match Regex::new(r"(?m)^//\s*File:?\s+(.*)$") {
        Ok(re) => re,
        Err(_) => return source.to_string(),
    };
    let markers: Vec<(usize, usize, String)> = file_re
        .captures_iter(source)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some((whole.start(), whole.end(), caps[1].trim().to_string()))
        })
        .collect();
    if markers.is_empty() {
        return source.to_string();
    }

    let mut out = String::with_capacity(source.len());
    out.push_str(&source[..markers[0].0]);
    for (i, (start, header_end, path)) in markers.iter().enumerate() {
        let section_end = markers
            .get(i + 1)
            .map(|next| next.0)
            .unwrap_or(source.len());
        if is_library_path(path) {
            out.push_str(&source[*start..*header_end]);
            out.push_str("\n/* --- external library section omitted ---\n");
            out.push_str(&source[*header_end..section_end].replace("*/", "* /"));
            out.push_str("\n*/\n\n");
        } else {
            out.push_str(&source[*start..section_end]);
        }
    }
    out
}
