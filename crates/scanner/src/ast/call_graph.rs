//! Bidirectional call graph over implemented function definitions.

use std::collections::HashMap;

use super::types::{AstNode, ParsedSource};

/// Names a function across contracts.
#[derive(Debug, Clone)]
pub struct FunctionRef {
    pub contract_name: String,
    pub function_name: String,
    pub node_id: i64,
}

pub struct CallGraph {
    /// function -> functions it calls
    pub callees: HashMap<i64, Vec<i64>>,
    /// function -> functions calling it
    pub callers: HashMap<i64, Vec<i64>>,
    pub functions: HashMap<i64, AstNode>,
    pub function_refs: HashMap<i64, FunctionRef>,
}

impl CallGraph {
    /// Two passes: collect every implemented function definition under a
    /// contract, then follow `referencedDeclaration` edges out of each
    /// body and invert them into `callers`.
    pub fn build(ps: &ParsedSource) -> Self {
        let mut graph = Self {
            callees: HashMap::new(),
            callers: HashMap::new(),
            functions: HashMap::new(),
            function_refs: HashMap::new(),
        };

        for contract in ps.ast.nodes.iter().filter(|n| n.is_contract()) {
            for child in &contract.nodes {
                if child.is_function() && child.implemented {
                    graph.functions.insert(child.id, child.clone());
                    graph.function_refs.insert(
                        child.id,
                        FunctionRef {
                            contract_name: contract.name.clone(),
                            function_name: child.name.clone(),
                            node_id: child.id,
                        },
                    );
                }
            }
        }

        let ids: Vec<i64> = graph.functions.keys().copied().collect();
        for id in ids {
            let node = graph.functions[&id].clone();
            let callees = graph.extract_callees(&node);
            for &callee in &callees {
                graph.callers.entry(callee).or_default().push(id);
            }
            graph.callees.insert(id, callees);
        }

        graph
    }

    fn extract_callees(&self, node: &AstNode) -> Vec<i64> {
        let mut callees = Vec::new();
        let mut seen = std::collections::HashSet::new();
        self.collect_callees(node, &mut callees, &mut seen);
        callees
    }

    fn collect_callees(
        &self,
        node: &AstNode,
        callees: &mut Vec<i64>,
        seen: &mut std::collections::HashSet<i64>,
    ) {
        let reference = node.referenced_declaration;
        if reference != 0 && self.functions.contains_key(&reference) && seen.insert(reference) {
            callees.push(reference);
        }
        node.for_each_child(&mut |child| self.collect_callees(child, callees, seen));
    }

    pub fn entry_points(&self) -> Vec<&AstNode> {
        let mut entries: Vec<&AstNode> =
            self.functions.values().filter(|n| n.is_entry_point()).collect();
        entries.sort_by_key(|n| n.id);
        entries
    }

    /// Transitive callees of a function up to a depth cap.
    pub fn callees_recursive(&self, id: i64, max_depth: usize) -> Vec<&AstNode> {
        let mut out = Vec::new();
        let mut visited = std::collections::HashSet::new();
        self.callees_recursive_inner(id, 0, max_depth, &mut visited, &mut out);
        out
    }

    fn callees_recursive_inner<'a>(
        &'a self,
        id: i64,
        depth: usize,
        max_depth: usize,
        visited: &mut std::collections::HashSet<i64>,
        out: &mut Vec<&'a AstNode>,
    ) {
        if depth >= max_depth {
            return;
        }
        let Some(callees) = self.callees.get(&id) else {
            return;
        };
        for &callee in callees {
            if visited.insert(callee) {
                if let Some(node) = self.functions.get(&callee) {
                    out.push(node);
                    self.callees_recursive_inner(callee, depth + 1, max_depth, visited, out);
                }
            }
        }
    }

    /// Every function reachable from any entry point, deduplicated and in
    /// stable id order.
    pub fn related_functions(&self, max_depth: usize) -> Vec<&AstNode> {
        let mut unique: HashMap<i64, &AstNode> = HashMap::new();
        for entry in self.entry_points() {
            for node in self.callees_recursive(entry.id, max_depth) {
                unique.insert(node.id, node);
            }
        }
        let mut out: Vec<&AstNode> = unique.into_values().collect();
        out.sort_by_key(|n| n.id);
        out
    }

    pub fn node_name(&self, id: i64) -> String {
        if let Some(r) = self.function_refs.get(&id) {
            return format!("{}.{}", r.contract_name, r.function_name);
        }
        if let Some(node) = self.functions.get(&id) {
            return node.name.clone();
        }
        format!("Node_{id}")
    }

    /// Tree rendering of the call relation rooted at each entry point.
    /// A path-visited set labels back edges instead of recursing into
    /// them, and a depth cap bounds pathological chains.
    pub fn call_tree(&self) -> String {
        const MAX_DEPTH: usize = 10;
        let mut out = String::from("Global Call Graph Tree:\n");
        let mut path = std::collections::HashSet::new();
        for entry in self.entry_points() {
            out.push_str(&format!("- Entry: {}\n", self.node_name(entry.id)));
            path.insert(entry.id);
            self.print_tree(entry.id, 1, MAX_DEPTH, &mut path, &mut out);
            path.remove(&entry.id);
            out.push('\n');
        }
        out
    }

    fn print_tree(
        &self,
        id: i64,
        depth: usize,
        max_depth: usize,
        path: &mut std::collections::HashSet<i64>,
        out: &mut String,
    ) {
        if depth > max_depth {
            out.push_str(&format!("{}-> ... (max depth)\n", "  ".repeat(depth)));
            return;
        }
        let Some(callees) = self.callees.get(&id) else {
            return;
        };
        for &callee in callees {
            let prefix = "  ".repeat(depth);
            let name = self.node_name(callee);
            if path.contains(&callee) {
                out.push_str(&format!("{prefix}-> {name} (Recursive Cycle)\n"));
                continue;
            }
            out.push_str(&format!("{prefix}-> {name}\n"));
            path.insert(callee);
            self.print_tree(callee, depth + 1, max_depth, path, out);
            path.remove(&callee);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::test_fixtures::sample_parsed_source;

    #[test]
    fn test_callers_are_inverse_of_callees() {
        let ps = sample_parsed_source();
        let graph = CallGraph::build(&ps);

        for (&caller, callees) in &graph.callees {
            for callee in callees {
                assert!(
                    graph.callers[callee].contains(&caller),
                    "edge {caller}->{callee} missing inverse"
                );
            }
        }
        for (&callee, callers) in &graph.callers {
            for caller in callers {
                assert!(
                    graph.callees[caller].contains(&callee),
                    "inverse edge {callee}<-{caller} missing forward"
                );
            }
        }
    }

    #[test]
    fn test_entry_points_and_refs() {
        let ps = sample_parsed_source();
        let graph = CallGraph::build(&ps);

        let entries: Vec<String> = graph
            .entry_points()
            .iter()
            .map(|n| n.name.clone())
            .collect();
        assert!(entries.contains(&"withdraw".to_string()));
        assert!(!entries.contains(&"_transfer".to_string()));
        assert_eq!(graph.node_name(20), "Vault.withdraw");
    }

    #[test]
    fn test_recursive_callees_and_cycle_rendering() {
        let ps = sample_parsed_source();
        let graph = CallGraph::build(&ps);

        // withdraw -> _transfer -> _log, plus the self-recursive _log edge.
        let reachable: Vec<&str> = graph
            .callees_recursive(20, 5)
            .iter()
            .map(|n| n.name.as_str())
            .collect();
        assert_eq!(reachable, vec!["_transfer", "_log"]);

        let tree = graph.call_tree();
        assert!(tree.contains("- Entry: Vault.withdraw"));
        assert!(tree.contains("Recursive Cycle"));
    }

    #[test]
    fn test_depth_cap_limits_collection() {
        let ps = sample_parsed_source();
        let graph = CallGraph::build(&ps);
        let shallow: Vec<&str> = graph
            .callees_recursive(20, 1)
            .iter()
            .map(|n| n.name.as_str())
            .collect();
        assert_eq!(shallow, vec!["_transfer"]);
    }
}
