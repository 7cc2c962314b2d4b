//! Graph - Dependency edges between resources of one batch

use std::collections::{HashMap, HashSet};

/// Dependency graph over a fixed set of nodes
///
/// Edges that point outside the node set are not part of the graph; callers
/// decide separately what a dangling reference means.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Nodes in insertion order
    nodes: Vec<String>,
    /// Node -> nodes it depends on
    edges: HashMap<String, Vec<String>>,
    /// Node -> nodes that depend on it
    reverse_edges: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Build from `(node, depends_on)` pairs
    pub fn build<'a, I>(nodes: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a [String])>,
    {
        let nodes: Vec<(&str, &[String])> = nodes.into_iter().collect();
        let names: HashSet<&str> = nodes.iter().map(|(name, _)| *name).collect();

        let mut graph = Self::default();
        for (name, depends_on) in nodes {
            if graph.edges.contains_key(name) {
                continue;
            }
            graph.nodes.push(name.to_string());
            let deps = graph.edges.entry(name.to_string()).or_default();
            for dep in depends_on {
                if names.contains(dep.as_str()) && !deps.contains(dep) {
                    deps.push(dep.clone());
                    graph
                        .reverse_edges
                        .entry(dep.clone())
                        .or_default()
                        .push(name.to_string());
                }
            }
        }
        graph
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn contains(&self, node: &str) -> bool {
        self.edges.contains_key(node)
    }

    /// Get direct dependencies of a node
    pub fn dependencies_of(&self, node: &str) -> &[String] {
        self.edges.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Get nodes that depend on this node
    pub fn dependents_of(&self, node: &str) -> &[String] {
        self.reverse_edges.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Nodes with no dependencies; creation starts here
    pub fn roots(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| self.dependencies_of(n).is_empty())
            .map(String::as_str)
            .collect()
    }

    /// Nodes nothing depends on; destruction starts here
    pub fn leaves(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| self.dependents_of(n).is_empty())
            .map(String::as_str)
            .collect()
    }

    /// First cycle found, as the path of nodes that closes it
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut stack = Vec::new();

        for node in &self.nodes {
            if let Some(cycle) = self.find_cycle_from(node, &mut visited, &mut stack) {
                return Some(cycle);
            }
        }
        None
    }

    fn find_cycle_from(
        &self,
        node: &str,
        visited: &mut HashSet<String>,
        stack: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        if let Some(start) = stack.iter().position(|n| n == node) {
            let mut cycle = stack[start..].to_vec();
            cycle.push(node.to_string());
            return Some(cycle);
        }
        if visited.contains(node) {
            return None;
        }

        visited.insert(node.to_string());
        stack.push(node.to_string());
        for dep in self.dependencies_of(node) {
            if let Some(cycle) = self.find_cycle_from(dep, visited, stack) {
                return Some(cycle);
            }
        }
        stack.pop();
        None
    }
}
