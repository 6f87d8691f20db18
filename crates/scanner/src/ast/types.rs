//! Compact-AST node shape, deserialized from `solc --ast-compact-json`.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer};

fn null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// One node of the compact AST. Only the fields the call-graph builder and
/// pruner consume are modeled; everything else is ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AstNode {
    pub id: i64,
    pub node_type: String,
    #[serde(deserialize_with = "null_default")]
    pub name: String,
    #[serde(deserialize_with = "null_default")]
    pub src: String,
    #[serde(deserialize_with = "null_default")]
    pub visibility: String,
    #[serde(deserialize_with = "null_default")]
    pub kind: String,
    #[serde(deserialize_with = "null_default")]
    pub implemented: bool,
    #[serde(deserialize_with = "null_default")]
    pub referenced_declaration: i64,
    #[serde(deserialize_with = "null_default")]
    pub nodes: Vec<AstNode>,
    pub body: Option<Box<AstNode>>,
    #[serde(deserialize_with = "null_default")]
    pub statements: Vec<AstNode>,
    pub expression: Option<Box<AstNode>>,
    #[serde(deserialize_with = "null_default")]
    pub arguments: Vec<AstNode>,
    #[serde(deserialize_with = "null_default")]
    pub modifiers: Vec<AstNode>,
}

impl AstNode {
    pub fn is_contract(&self) -> bool {
        self.node_type == "ContractDefinition"
    }

    pub fn is_function(&self) -> bool {
        self.node_type == "FunctionDefinition"
    }

    /// Entry points are externally reachable: public/external visibility or
    /// one of the dispatch hooks.
    pub fn is_entry_point(&self) -> bool {
        self.visibility == "public"
            || self.visibility == "external"
            || self.kind == "constructor"
            || self.kind == "fallback"
            || self.kind == "receive"
    }

    /// Depth-first walk over every child position the compact AST uses.
    pub fn for_each_child<'a>(&'a self, f: &mut impl FnMut(&'a AstNode)) {
        if let Some(body) = &self.body {
            f(body);
        }
        if let Some(expression) = &self.expression {
            f(expression);
        }
        for child in self
            .nodes
            .iter()
            .chain(self.statements.iter())
            .chain(self.arguments.iter())
            .chain(self.modifiers.iter())
        {
            f(child);
        }
    }
}

/// A parsed compilation unit: the AST, the exact source text the `src`
/// ranges index into, and a node index by id.
#[derive(Debug, Clone)]
pub struct ParsedSource {
    pub ast: AstNode,
    pub source: String,
    nodes_by_id: HashMap<i64, AstNode>,
}

impl ParsedSource {
    pub fn new(ast: AstNode, source: String) -> Self {
        let mut nodes_by_id = HashMap::new();
        index_nodes(&ast, &mut nodes_by_id);
        Self {
            ast,
            source,
            nodes_by_id,
        }
    }

    pub fn node(&self, id: i64) -> Option<&AstNode> {
        self.nodes_by_id.get(&id)
    }

    /// Resolves a `byte_offset:byte_length[:file]` range against the source
    /// text. Out-of-bounds ranges yield an empty slice.
    pub fn source_range(&self, src: &str) -> &str {
        let mut parts = src.split(':');
        let (Some(offset), Some(length)) = (parts.next(), parts.next()) else {
            return "";
        };
        let (Ok(offset), Ok(length)) = (offset.parse::<usize>(), length.parse::<usize>()) else {
            return "";
        };
        let end = offset.saturating_add(length);
        if offset >= self.source.len() || end > self.source.len() {
            return "";
        }
        if !self.source.is_char_boundary(offset) || !self.source.is_char_boundary(end) {
            return "";
        }
        &self.source[offset..end]
    }
}

fn index_nodes(node: &AstNode, index: &mut HashMap<i64, AstNode>) {
    index.insert(node.id, node.clone());
    node.for_each_child(&mut |child| index_nodes(child, index));
}
