//! Call-graph context strings for prompt enrichment.

use super::call_graph::CallGraph;
use super::types::ParsedSource;

/// Strings a call-graph-aware template can interpolate.
#[derive(Debug, Clone, Default)]
pub struct CallGraphContext {
    /// Summary line counts.
    pub info: String,
    /// Call tree rooted at each entry point.
    pub tree: String,
    /// Source of functions reachable from entry points, up to the budget.
    pub callees_code: String,
    pub total_functions: usize,
    pub public_functions: usize,
    pub internal_functions: usize,
}

/// Builds the enriched context. `callee_depth` bounds the reachable-set
/// walk and `budget` caps the concatenated source characters; the targeted
/// pipeline uses (5, 20000), the verified pipeline (3, 12000).
pub fn build_context(
    graph: &CallGraph,
    ps: &ParsedSource,
    callee_depth: usize,
    budget: usize,
) -> CallGraphContext {
    let entry_points = graph.entry_points();
    let total = graph.functions.len();
    let public = entry_points.len();
    let internal = total.saturating_sub(public);

    let info = format!(
        "// Call Graph Summary:\n// - Total Functions: {total}\n// - Public Entry Points: {public}\n// - Internal Functions: {internal}\n"
    );

    let mut tree = graph.call_tree();
    if tree.len() > budget {
        tree.truncate(floor_char_boundary(&tree, budget));
    }

    let mut callees_code = String::new();
    for node in graph.related_functions(callee_depth) {
        if callees_code.len() >= budget {
            break;
        }
        let header = match graph.function_refs.get(&node.id) {
            Some(r) => format!(
                "// Internal/Called Function: {}.{}\n",
                r.contract_name, r.function_name
            ),
            None => format!("// Internal/Called Function: {}\n", node.name),
        };
        callees_code.push_str(&header);

        let mut body = ps.source_range(&node.src).to_string();
        let remaining = budget.saturating_sub(callees_code.len());
        if remaining <= 2 {
            break;
        }
        if body.len() + 2 > remaining {
            body.truncate(floor_char_boundary(&body, remaining - 2));
        }
        callees_code.push_str(&body);
        callees_code.push_str("\n\n");
    }

    CallGraphContext {
        info,
        tree,
        callees_code,
        total_functions: total,
        public_functions: public,
        internal_functions: internal,
    }
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::test_fixtures::sample_parsed_source;

    #[test]
    fn test_context_counts_and_sections() {
        let ps = sample_parsed_source();
        let graph = CallGraph::build(&ps);
        let ctx = build_context(&graph, &ps, 5, 20_000);

        assert_eq!(ctx.total_functions, 4);
        assert_eq!(ctx.public_functions, 1);
        assert_eq!(ctx.internal_functions, 3);
        assert!(ctx.info.contains("Total Functions: 4"));
        assert!(ctx.tree.contains("Vault.withdraw"));
        assert!(ctx.callees_code.contains("Vault._transfer"));
        assert!(ctx.callees_code.contains("function _log"));
    }

    #[test]
    fn test_budget_caps_callees_code() {
        let ps = sample_parsed_source();
        let graph = CallGraph::build(&ps);
        let ctx = build_context(&graph, &ps, 5, 60);
        assert!(ctx.callees_code.len() <= 62);
    }
}
