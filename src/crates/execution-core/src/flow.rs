//! Minimal, concrete `Flow` representation.
//!
//! The execution core treats flow definitions as mostly opaque — real node
//! business logic lives behind [`crate::engine::NodeRuntime`] — but needs a
//! concrete shape to drive the default engine's topological scheduling and
//! to let tests build fixtures without a real graph editor.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single computation vertex in a [`Flow`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// A directed, typed-port connection between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Edge {
    pub from: String,
    #[serde(default)]
    pub from_port: String,
    pub to: String,
    #[serde(default)]
    pub to_port: String,
}

/// A dataflow DAG: nodes, edges, and each node's initial port values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Flow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    /// Initial values for each node's ports, keyed by node id.
    #[serde(default)]
    pub initial_state: HashMap<String, serde_json::Value>,
}

impl Flow {
    /// Build a minimal, nameless flow shell — used when the execution store
    /// must reconstruct a read-only instance but cannot locate any ancestor
    /// with a serialized flow.
    pub fn shell(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
            initial_state: HashMap::new(),
        }
    }

    /// Structural deep clone. Distinct from `Clone::clone` mainly in
    /// documenting intent: every field here is owned data, so this is
    /// exactly `.clone()`, but call sites in the service use this name to
    /// make clear they're taking a working copy or a seed snapshot, not
    /// sharing state.
    pub fn clone_deep(&self) -> Self {
        self.clone()
    }

    /// Serialize to the wire/storage representation.
    pub fn serialize(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Deserialize from the wire/storage representation.
    pub fn deserialize(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }

    /// Whether `node_id` names a node in this flow — used to validate
    /// breakpoint targets.
    pub fn has_node(&self, node_id: &str) -> bool {
        self.nodes.iter().any(|n| n.id == node_id)
    }

    /// Kahn's-algorithm topological order over the node ids. Returns `None`
    /// if the graph contains a cycle.
    pub fn topological_order(&self) -> Option<Vec<String>> {
        let mut indegree: HashMap<&str, usize> =
            self.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &self.edges {
            *indegree.entry(edge.to.as_str()).or_insert(0) += 1;
            adjacency
                .entry(edge.from.as_str())
                .or_default()
                .push(edge.to.as_str());
        }

        let mut ready: std::collections::VecDeque<&str> = indegree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&id, _)| id)
            .collect();
        // Deterministic order for nodes with no predecessors.
        let mut ready: Vec<&str> = ready.drain(..).collect();
        ready.sort();
        let mut ready: std::collections::VecDeque<&str> = ready.into();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(node) = ready.pop_front() {
            order.push(node.to_string());
            if let Some(next) = adjacency.get(node) {
                let mut newly_ready = Vec::new();
                for &succ in next {
                    let deg = indegree.get_mut(succ).unwrap();
                    *deg -= 1;
                    if *deg == 0 {
                        newly_ready.push(succ);
                    }
                }
                newly_ready.sort();
                for n in newly_ready {
                    ready.push_back(n);
                }
            }
        }

        if order.len() == self.nodes.len() {
            Some(order)
        } else {
            None
        }
    }
}
