use serde::{Deserialize, Serialize};

use execflow_core::types::{Node, NodeCategory, NodeId, ScriptType};

/// Canonical serialized form of a task graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSetDocument {
    pub task_set_nodes: Vec<TaskRecord>,
}

/// A task with its direct successors embedded by value.
///
/// A task reachable from several parents appears once under each of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: NodeId,
    pub label: String,
    pub script: String,
    pub script_type: ScriptType,
    pub category: NodeCategory,
    #[serde(default)]
    pub children: Vec<TaskRecord>,
}

impl TaskRecord {
    /// Snapshot of a node's compiled fields, without children. Position is dropped.
    pub fn from_node(node: &Node) -> Self {
        Self {
            id: node.id.clone(),
            label: node.label.clone(),
            script: node.script.clone(),
            script_type: node.script_type,
            category: node.category,
            children: Vec::new(),
        }
    }
}

/// Every record in the document, embedded copies included, without recursion.
fn walk<'a>(roots: &'a [TaskRecord]) -> impl Iterator<Item = &'a TaskRecord> {
    let mut stack: Vec<&TaskRecord> = roots.iter().rev().collect();
    std::iter::from_fn(move || {
        let record = stack.pop()?;
        stack.extend(record.children.iter().rev());
        Some(record)
    })
}

impl TaskSetDocument {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// How many times `id` is embedded anywhere in the document.
    pub fn occurrences(&self, id: &NodeId) -> usize {
        walk(&self.task_set_nodes).filter(|r| &r.id == id).count()
    }

    /// Total number of task records, counting every embedded copy.
    pub fn record_count(&self) -> usize {
        walk(&self.task_set_nodes).count()
    }

    pub fn is_empty(&self) -> bool {
        self.task_set_nodes.is_empty()
    }
}
