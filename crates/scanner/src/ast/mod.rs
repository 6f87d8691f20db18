//! AST service: version-matched compact-AST parsing, call-graph
//! construction, dead-code pruning and prompt-context enrichment.

pub mod call_graph;
pub mod context;
pub mod pruner;
pub mod solc;
pub mod types;

pub use call_graph::{CallGraph, FunctionRef};
pub use context::{build_context, CallGraphContext};
pub use pruner::{prune_dead_code, MIN_PRUNED_LEN};
pub use solc::{extract_pragma_version, SolcManager};
pub use types::{AstNode, ParsedSource};

use std::io::Write;

use tracing::debug;

use crate::error::{Result, ScanError};
use crate::flatten;

/// Parses flattened Solidity with a version-matched compiler. One service
/// instance is scoped to a scan run and shares the solc path cache.
pub struct AstService {
    solc: SolcManager,
}

impl AstService {
    pub fn new() -> Self {
        Self {
            solc: SolcManager::new(),
        }
    }

    /// Parses source text into a compact AST. Multi-file JSON payloads are
    /// flattened first; the compiler binary is elected from the pragma.
    pub async fn parse_source(&self, source: &str) -> Result<ParsedSource> {
        let source = if flatten::is_json_source(source) {
            flatten::flatten_json_source(source).await?
        } else {
            let (clean, _) = flatten::detach_metadata(source);
            clean.to_string()
        };

        let mut tmp = tempfile::Builder::new()
            .suffix(".sol")
            .tempfile()
            .map_err(|e| ScanError::CompilerFailed(format!("tempfile: {e}")))?;
        tmp.write_all(source.as_bytes())
            .map_err(|e| ScanError::CompilerFailed(format!("write source: {e}")))?;
        let path = tmp.path().to_path_buf();

        let solc_bin = match extract_pragma_version(&source) {
            Some(version) => match self.solc.solc_path(&version).await {
                Ok(path) => path,
                Err(e) => {
                    debug!("falling back to system solc: {e}");
                    std::path::PathBuf::from("solc")
                }
            },
            None => std::path::PathBuf::from("solc"),
        };

        let output = tokio::process::Command::new(&solc_bin)
            .arg("--ast-compact-json")
            .arg(&path)
            .output()
            .await
            .map_err(|e| ScanError::CompilerFailed(format!("solc spawn failed: {e}")))?;
        if !output.status.success() {
            return Err(ScanError::CompilerFailed(format!(
                "solc exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        parse_ast_output(&output.stdout, source)
    }
}

impl Default for AstService {
    fn default() -> Self {
        Self::new()
    }
}

/// The compiler prefixes the JSON with human-readable headers; the AST is
/// everything from the first brace on.
pub fn parse_ast_output(output: &[u8], source: String) -> Result<ParsedSource> {
    let text = String::from_utf8_lossy(output);
    let json_start = text
        .find('{')
        .ok_or_else(|| ScanError::CompilerFailed("no JSON in solc output".to_string()))?;

    let ast: AstNode = match serde_json::from_str(&text[json_start..]) {
        Ok(ast) => ast,
        Err(first_err) => text
            .lines()
            .find(|line| line.starts_with("{\"absolutePath\""))
            .and_then(|line| serde_json::from_str(line).ok())
            .ok_or_else(|| {
                ScanError::CompilerFailed(format!("failed to parse AST JSON: {first_err}"))
            })?,
    };

    Ok(ParsedSource::new(ast, source))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ast_output_skips_header_noise() {
        let payload = br#"JSON AST (compact format):

======= input.sol =======
{"absolutePath":"input.sol","id":3,"nodeType":"SourceUnit","nodes":[{"id":2,"nodeType":"PragmaDirective","src":"0:23:0","nodes":[]}],"src":"0:24:0"}"#;
        let ps = parse_ast_output(payload, "pragma solidity ^0.8.0;".to_string()).unwrap();
        assert_eq!(ps.ast.node_type, "SourceUnit");
        assert_eq!(ps.ast.nodes.len(), 1);
        assert!(ps.node(2).is_some());
    }

    #[test]
    fn test_parse_ast_output_rejects_non_json() {
        assert!(parse_ast_output(b"no ast here", String::new()).is_err());
    }
}
