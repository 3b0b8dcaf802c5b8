//! Undirected routing graph built from edge declarations.
//!
//! `"A -- B"` declares one edge; `"A -- B -- C"` declares one edge per
//! adjacent pair. The graph is the only source of "may send to".

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{PostmanError, Result};

const EDGE_SEPARATOR: &str = "--";

/// Node name → neighbours, both directions recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Adjacency {
    neighbors: BTreeMap<String, BTreeSet<String>>,
}

impl Adjacency {
    /// Build a graph from edge declarations.
    pub fn parse<S: AsRef<str>>(edges: &[S]) -> Result<Self> {
        let mut graph = Self::default();
        for declaration in edges {
            let declaration = declaration.as_ref();
            let names: Vec<&str> = declaration.split(EDGE_SEPARATOR).map(str::trim).collect();

            if names.len() < 2 || names.iter().any(|n| n.is_empty()) {
                return Err(PostmanError::InvalidEdge(declaration.to_string()));
            }

            for pair in names.windows(2) {
                graph.add_edge(pair[0], pair[1]);
            }
        }
        Ok(graph)
    }

    /// Record an undirected edge.
    pub fn add_edge(&mut self, a: &str, b: &str) {
        self.neighbors
            .entry(a.to_string())
            .or_default()
            .insert(b.to_string());
        self.neighbors
            .entry(b.to_string())
            .or_default()
            .insert(a.to_string());
    }

    /// Neighbours of `node`, sorted; empty when the node is not in the graph.
    pub fn neighbors(&self, node: &str) -> Vec<String> {
        self.neighbors
            .get(node)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_edge(&self, a: &str, b: &str) -> bool {
        self.neighbors.get(a).is_some_and(|set| set.contains(b))
    }

    /// Each undirected edge once, endpoints in lexicographic order.
    pub fn edges(&self) -> Vec<(String, String)> {
        self.neighbors
            .iter()
            .flat_map(|(a, set)| {
                set.iter()
                    .filter(move |b| a.as_str() < b.as_str())
                    .map(move |b| (a.clone(), b.clone()))
            })
            .collect()
    }
}
