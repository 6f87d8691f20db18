//! Dead-code pruning: re-emit the source keeping only code reachable from
//! the main contract's entry points (plus, conservatively, every state
//! variable, modifier, event, error and using-directive and what they
//! reference).

use std::collections::HashMap;

use super::types::{AstNode, ParsedSource};

/// A pruned emission shorter than this keeps the original instead; it is
/// the safety floor against over-pruning.
pub const MIN_PRUNED_LEN: usize = 100;

const CONSERVATIVE_KINDS: &[&str] = &[
    "VariableDeclaration",
    "ModifierDefinition",
    "EventDefinition",
    "ErrorDefinition",
    "UsingForDirective",
];

/// Prunes unreachable code from the main contract (the named contract, or
/// the last contract definition when `main_contract` is empty). Returns
/// `None` when no contract definition exists.
pub fn prune_dead_code(
    ps: &ParsedSource,
    main_contract: &str,
    conservative: bool,
) -> Option<String> {
    let main = if main_contract.is_empty() {
        ps.ast.nodes.iter().rev().find(|n| n.is_contract())?
    } else {
        ps.ast
            .nodes
            .iter()
            .find(|n| n.is_contract() && n.name == main_contract)?
    };

    let mut visited: HashMap<i64, ()> = HashMap::new();
    for child in &main.nodes {
        if child.is_function() && child.is_entry_point() && child.implemented {
            visited.insert(child.id, ());
            collect_dependencies(ps, child, &mut visited);
        }
        if conservative && CONSERVATIVE_KINDS.contains(&child.node_type.as_str()) {
            visited.insert(child.id, ());
            collect_dependencies(ps, child, &mut visited);
        }
    }

    let mut out = String::new();
    for root in &ps.ast.nodes {
        match root.node_type.as_str() {
            "PragmaDirective" | "ImportDirective" => {
                out.push_str(ps.source_range(&root.src));
                out.push('\n');
            }
            "ContractDefinition" => {
                let contract_src = ps.source_range(&root.src);
                let Some(body_start) = contract_src.find('{') else {
                    continue;
                };
                out.push('\n');
                out.push_str(&contract_src[..=body_start]);
                out.push('\n');
                for child in &root.nodes {
                    if visited.contains_key(&child.id)
                        || (!child.is_function() && !conservative)
                    {
                        out.push_str(ps.source_range(&child.src));
                        out.push('\n');
                    }
                }
                out.push_str("}\n");
            }
            _ => {
                out.push_str(ps.source_range(&root.src));
                out.push('\n');
            }
        }
    }

    if out.len() < MIN_PRUNED_LEN {
        return Some(ps.source.clone());
    }
    Some(out)
}

fn collect_dependencies(ps: &ParsedSource, node: &AstNode, visited: &mut HashMap<i64, ()>) {
    node.for_each_child(&mut |child| collect_dependencies(ps, child, visited));

    let reference = node.referenced_declaration;
    if reference != 0 && !visited.contains_key(&reference) {
        if let Some(target) = ps.node(reference) {
            visited.insert(reference, ());
            let target = target.clone();
            collect_dependencies(ps, &target, visited);
        }
    }
}
