//! Code graph — directed, labeled relations between element ids.
//!
//! Edges are built during indexing by a best-effort symbol resolver, so the
//! graph may be sparse; expansion degrades to a no-op rather than failing.
//! Cycles are expected (mutual recursion, circular imports) — traversal is
//! breadth-limited and visited-set deduplicated, never acyclic-by-assumption.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    Calls,
    Inherits,
    Contains,
    Imports,
}

impl RelationKind {
    pub fn label(&self) -> &'static str {
        match self {
            RelationKind::Calls => "calls",
            RelationKind::Inherits => "inherits",
            RelationKind::Contains => "contains",
            RelationKind::Imports => "imports",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    pub kind: RelationKind,
}

/// Element relation graph with forward and reverse adjacency indices.
#[derive(Default)]
pub struct CodeGraph {
    edges: Vec<GraphEdge>,
    /// from id -> edge indices
    by_source: HashMap<String, Vec<usize>>,
    /// to id -> edge indices
    by_target: HashMap<String, Vec<usize>>,
}

#[derive(Serialize, Deserialize)]
struct PersistedGraph {
    edges: Vec<GraphEdge>,
}

impl CodeGraph {
    pub fn new() -> Self {
        CodeGraph::default()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn clear(&mut self) {
        self.edges.clear();
        self.by_source.clear();
        self.by_target.clear();
    }

    /// Add an edge. Both endpoints must be known element ids; the caller
    /// (the indexer's symbol resolver) guarantees no dangling ids.
    pub fn add_edge(&mut self, from: String, to: String, kind: RelationKind) {
        if from == to {
            return;
        }
        let idx = self.edges.len();
        self.by_source.entry(from.clone()).or_default().push(idx);
        self.by_target.entry(to.clone()).or_default().push(idx);
        self.edges.push(GraphEdge { from, to, kind });
    }

    pub fn edges_from(&self, id: &str) -> Vec<&GraphEdge> {
        self.by_source
            .get(id)
            .map(|v| v.iter().map(|&i| &self.edges[i]).collect())
            .unwrap_or_default()
    }

    pub fn edges_to(&self, id: &str) -> Vec<&GraphEdge> {
        self.by_target
            .get(id)
            .map(|v| v.iter().map(|&i| &self.edges[i]).collect())
            .unwrap_or_default()
    }

    /// Breadth-limited neighborhood: distinct element ids within `max_hops`
    /// of `id`, traversing edges in both directions. The start id itself is
    /// not included.
    pub fn neighbors(&self, id: &str, max_hops: usize) -> Vec<String> {
        if max_hops == 0 || (self.by_source.is_empty() && self.by_target.is_empty()) {
            return Vec::new();
        }

        let mut visited: HashSet<&str> = HashSet::new();
        let mut out: Vec<String> = Vec::new();
        let mut queue: VecDeque<(&str, usize)> = VecDeque::new();
        visited.insert(id);
        queue.push_back((id, 0));

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= max_hops {
                continue;
            }
            let forward = self
                .by_source
                .get(current)
                .into_iter()
                .flatten()
                .map(|&i| self.edges[i].to.as_str());
            let backward = self
                .by_target
                .get(current)
                .into_iter()
                .flatten()
                .map(|&i| self.edges[i].from.as_str());
            for next in forward.chain(backward) {
                if visited.insert(next) {
                    out.push(next.to_string());
                    queue.push_back((next, depth + 1));
                }
            }
        }

        out
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    fn graph_path(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{name}.graph.json"))
    }

    pub fn save(&self, dir: &Path, name: &str) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let payload = PersistedGraph { edges: self.edges.clone() };
        let path = Self::graph_path(dir, name);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(&payload)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn load(dir: &Path, name: &str) -> Result<CodeGraph> {
        let path = Self::graph_path(dir, name);
        if !path.exists() {
            return Err(CoreError::IndexMissing(name.to_string()));
        }
        let bytes = std::fs::read(&path)?;
        let payload: PersistedGraph = serde_json::from_slice(&bytes)?;
        let mut graph = CodeGraph::new();
        for e in payload.edges {
            graph.add_edge(e.from, e.to, e.kind);
        }
        Ok(graph)
    }

    /// Append a persisted per-repo graph; missing files merge nothing.
    pub fn merge_from(&mut self, dir: &Path, name: &str) -> Result<usize> {
        match Self::load(dir, name) {
            Ok(other) => {
                let added = other.edges.len();
                for e in other.edges {
                    self.add_edge(e.from, e.to, e.kind);
                }
                Ok(added)
            }
            Err(CoreError::IndexMissing(_)) => {
                tracing::warn!("graph '{name}' not found in {}", dir.display());
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_graph() -> CodeGraph {
        let mut g = CodeGraph::new();
        g.add_edge("a".into(), "b".into(), RelationKind::Calls);
        g.add_edge("b".into(), "c".into(), RelationKind::Calls);
        g.add_edge("c".into(), "d".into(), RelationKind::Calls);
        g
    }

    #[test]
    fn test_neighbors_hop_limited() {
        let g = linear_graph();
        let one = g.neighbors("a", 1);
        assert_eq!(one, vec!["b".to_string()]);

        let two = g.neighbors("a", 2);
        assert!(two.contains(&"b".to_string()));
        assert!(two.contains(&"c".to_string()));
        assert!(!two.contains(&"d".to_string()));
    }

    #[test]
    fn test_neighbors_undirected() {
        let g = linear_graph();
        // "c" reaches "b" against edge direction
        let n = g.neighbors("c", 1);
        assert!(n.contains(&"b".to_string()));
        assert!(n.contains(&"d".to_string()));
    }

    #[test]
    fn test_cycle_terminates() {
        let mut g = CodeGraph::new();
        g.add_edge("x".into(), "y".into(), RelationKind::Imports);
        g.add_edge("y".into(), "x".into(), RelationKind::Imports);
        let n = g.neighbors("x", 10);
        assert_eq!(n, vec!["y".to_string()]);
    }

    #[test]
    fn test_empty_graph_noop() {
        let g = CodeGraph::new();
        assert!(g.neighbors("anything", 2).is_empty());
    }

    #[test]
    fn test_save_load_merge() {
        let dir = tempfile::tempdir().unwrap();
        let g = linear_graph();
        g.save(dir.path(), "r").unwrap();

        let loaded = CodeGraph::load(dir.path(), "r").unwrap();
        assert_eq!(loaded.edge_count(), 3);

        let mut other = CodeGraph::new();
        other.add_edge("z".into(), "a".into(), RelationKind::Inherits);
        assert_eq!(other.merge_from(dir.path(), "r").unwrap(), 3);
        assert_eq!(other.edge_count(), 4);
        assert_eq!(other.merge_from(dir.path(), "ghost").unwrap(), 0);
    }

    #[test]
    fn test_self_edge_dropped() {
        let mut g = CodeGraph::new();
        g.add_edge("a".into(), "a".into(), RelationKind::Calls);
        assert_eq!(g.edge_count(), 0);
    }
}
