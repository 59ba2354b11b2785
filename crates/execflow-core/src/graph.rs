//! In-memory task graph edited by the front-end.
//!
//! Nodes are kept in registration order with an id index beside them; edges
//! are kept in insertion order and may repeat. The compiler never sees the
//! model itself, only a [`GraphSnapshot`] taken from it.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ExecflowError, GraphError, Result};
use crate::types::{Edge, Node, NodeCategory, NodeId, Position, ScriptType};

/// Owned, read-only copy of a graph at one point in time.
///
/// Also the on-disk graph file format (JSON or TOML).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl GraphSnapshot {
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self { nodes, edges }
    }

    /// Load a graph file. `.toml` files are parsed as TOML, anything else as JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let is_toml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("toml"));

        if is_toml {
            toml::from_str(&content).map_err(|e| ExecflowError::Config(e.to_string()))
        } else {
            Ok(serde_json::from_str(&content)?)
        }
    }
}

/// Partial update applied by [`GraphModel::update_node`].
#[derive(Debug, Clone, Default)]
pub struct NodeUpdate {
    pub label: Option<String>,
    pub script: Option<String>,
    pub script_type: Option<ScriptType>,
    pub category: Option<NodeCategory>,
    pub position: Option<Position>,
}

/// Mutable graph owned by the editing surface.
#[derive(Debug, Clone, Default)]
pub struct GraphModel {
    nodes: Vec<Node>,
    index: HashMap<NodeId, usize>,
    edges: Vec<Edge>,
}

impl GraphModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a model from a snapshot, enforcing the same rules as the edit operations.
    pub fn from_snapshot(snapshot: GraphSnapshot) -> std::result::Result<Self, GraphError> {
        let mut model = Self::new();
        for node in snapshot.nodes {
            model.add_node(node)?;
        }
        for edge in snapshot.edges {
            model.add_edge(edge.source, edge.target)?;
        }
        Ok(model)
    }

    pub fn add_node(&mut self, node: Node) -> std::result::Result<(), GraphError> {
        if self.index.contains_key(&node.id) {
            return Err(GraphError::DuplicateNode(node.id));
        }
        debug!(node_id = %node.id, "Adding node");
        self.index.insert(node.id.clone(), self.nodes.len());
        self.nodes.push(node);
        Ok(())
    }

    /// Add a `Node N` placeholder with the next free numeric id.
    ///
    /// Once the largest numeric id is `u64::MAX`, falls back to the smallest
    /// unused one.
    pub fn add_default_node(&mut self) -> NodeId {
        let largest = self
            .nodes
            .iter()
            .filter_map(|n| n.id.as_str().parse::<u64>().ok())
            .max();
        let next = match largest {
            None => 1,
            Some(n) => n.checked_add(1).unwrap_or_else(|| self.lowest_free_numeric_id()),
        };
        let id = NodeId(next.to_string());
        let node = Node::new(id.clone(), format!("Node {}", next));
        self.index.insert(id.clone(), self.nodes.len());
        self.nodes.push(node);
        id
    }

    fn lowest_free_numeric_id(&self) -> u64 {
        // There are fewer nodes than ids, so one of 1..=len+1 is free.
        (1..=self.nodes.len() as u64 + 1)
            .find(|n| !self.index.contains_key(&NodeId(n.to_string())))
            .unwrap_or(1)
    }

    pub fn update_node(
        &mut self,
        id: &NodeId,
        update: NodeUpdate,
    ) -> std::result::Result<(), GraphError> {
        let idx = *self
            .index
            .get(id)
            .ok_or_else(|| GraphError::UnknownNode(id.clone()))?;
        let node = &mut self.nodes[idx];

        if let Some(label) = update.label {
            node.label = label;
        }
        if let Some(script) = update.script {
            node.script = script;
        }
        if let Some(script_type) = update.script_type {
            node.script_type = script_type;
        }
        if let Some(category) = update.category {
            node.category = category;
        }
        if let Some(position) = update.position {
            node.position = position;
        }
        Ok(())
    }

    /// Remove a node together with every edge touching it.
    pub fn remove_node(&mut self, id: &NodeId) -> std::result::Result<Node, GraphError> {
        let idx = self
            .index
            .remove(id)
            .ok_or_else(|| GraphError::UnknownNode(id.clone()))?;
        let node = self.nodes.remove(idx);

        for slot in self.index.values_mut() {
            if *slot > idx {
                *slot -= 1;
            }
        }

        let before = self.edges.len();
        self.edges.retain(|e| &e.source != id && &e.target != id);
        debug!(
            node_id = %id,
            edges_removed = before - self.edges.len(),
            "Removed node"
        );
        Ok(node)
    }

    /// Connect `source` to `target`. Parallel edges are kept as-is.
    pub fn add_edge(
        &mut self,
        source: impl Into<NodeId>,
        target: impl Into<NodeId>,
    ) -> std::result::Result<(), GraphError> {
        let edge = Edge::new(source, target);
        if edge.source == edge.target {
            return Err(GraphError::SelfLoop(edge.source));
        }
        for id in [&edge.source, &edge.target] {
            if !self.index.contains_key(id) {
                return Err(GraphError::UnknownNode(id.clone()));
            }
        }
        self.edges.push(edge);
        Ok(())
    }

    /// Remove every edge from `source` to `target`, returning how many were removed.
    pub fn remove_edge(&mut self, source: &NodeId, target: &NodeId) -> usize {
        let before = self.edges.len();
        self.edges
            .retain(|e| !(&e.source == source && &e.target == target));
        before - self.edges.len()
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.index.get(id).map(|&idx| &self.nodes[idx])
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Direct successors of `id`, in edge insertion order.
    pub fn children(&self, id: &NodeId) -> Vec<&NodeId> {
        self.edges
            .iter()
            .filter(|e| &e.source == id)
            .map(|e| &e.target)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            nodes: self.nodes.clone(),
            edges: self.edges.clone(),
        }
    }
}
