use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use execflow_core::config::{CompilerConfig, DuplicateEdgePolicy, RootSelection, DEFAULT_MAX_DEPTH};
use execflow_core::error::CompileError;
use execflow_core::graph::GraphSnapshot;
use execflow_core::types::{Edge, Node, NodeId};

use crate::document::{TaskRecord, TaskSetDocument};

/// Knobs for [`Compiler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileOptions {
    pub allow_empty: bool,
    pub duplicate_edges: DuplicateEdgePolicy,
    pub root_selection: RootSelection,
    /// Longest chain accepted, counted in nodes. Nested rendering and
    /// serialization recurse once per level.
    pub max_depth: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            allow_empty: false,
            duplicate_edges: DuplicateEdgePolicy::default(),
            root_selection: RootSelection::default(),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl From<&CompilerConfig> for CompileOptions {
    fn from(config: &CompilerConfig) -> Self {
        Self {
            allow_empty: config.allow_empty,
            duplicate_edges: config.duplicate_edges,
            root_selection: config.root_selection,
            max_depth: config.max_depth,
        }
    }
}

/// Output of a successful compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledTaskSet {
    pub document: TaskSetDocument,
    /// Parent-first linear order of every node.
    pub order: Vec<NodeId>,
}

/// Compile with default options, returning only the document.
pub fn compile(nodes: &[Node], edges: &[Edge]) -> Result<TaskSetDocument, CompileError> {
    let snapshot = GraphSnapshot::new(nodes.to_vec(), edges.to_vec());
    Compiler::default()
        .compile(&snapshot)
        .map(|compiled| compiled.document)
}

#[derive(Debug, Clone, Default)]
pub struct Compiler {
    options: CompileOptions,
}

impl Compiler {
    pub fn new(options: CompileOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    /// Validate, cycle-check, order, and serialize a snapshot.
    ///
    /// Fails closed: no document is produced unless every check passes.
    pub fn compile(&self, snapshot: &GraphSnapshot) -> Result<CompiledTaskSet, CompileError> {
        let graph = IndexedGraph::build(snapshot, &self.options)?;
        graph.check_acyclic()?;

        let order = graph.topological_order();
        let depth = graph.depth(&order);
        if depth > self.options.max_depth {
            return Err(CompileError::TooDeep {
                depth,
                limit: self.options.max_depth,
            });
        }

        let document = graph.render(self.options.root_selection);

        info!(
            nodes = snapshot.nodes.len(),
            edges = graph.edge_count(),
            depth,
            records = document.record_count(),
            "Compiled task set"
        );

        Ok(CompiledTaskSet {
            document,
            order: order.into_iter().map(|i| graph.nodes[i].id.clone()).collect(),
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Index-based view of a snapshot. Node `i` is `nodes[i]`; `adjacency[i]`
/// lists its children in edge order.
///
/// Walks use explicit stacks of `(node, next child cursor)` so graph depth
/// never turns into call-stack depth.
struct IndexedGraph<'a> {
    nodes: &'a [Node],
    adjacency: Vec<Vec<usize>>,
    indegree: Vec<usize>,
}

impl<'a> IndexedGraph<'a> {
    fn build(snapshot: &'a GraphSnapshot, options: &CompileOptions) -> Result<Self, CompileError> {
        let nodes = snapshot.nodes.as_slice();

        let mut index: HashMap<&NodeId, usize> = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(&node.id, i).is_some() {
                return Err(CompileError::DuplicateNodeId(node.id.clone()));
            }
        }

        let mut adjacency = vec![Vec::new(); nodes.len()];
        let mut indegree = vec![0; nodes.len()];
        let mut seen: HashSet<(usize, usize)> = HashSet::new();

        for edge in &snapshot.edges {
            let (Some(&from), Some(&to)) = (index.get(&edge.source), index.get(&edge.target))
            else {
                return Err(CompileError::DanglingEdge(edge.clone()));
            };

            if !seen.insert((from, to)) {
                match options.duplicate_edges {
                    DuplicateEdgePolicy::Reject => {
                        return Err(CompileError::DuplicateEdge(edge.clone()));
                    }
                    DuplicateEdgePolicy::Collapse => {
                        warn!(edge = %edge, "Collapsing duplicate edge");
                        continue;
                    }
                }
            }

            adjacency[from].push(to);
            indegree[to] += 1;
        }

        if nodes.is_empty() && !options.allow_empty {
            return Err(CompileError::EmptyGraph);
        }

        Ok(Self {
            nodes,
            adjacency,
            indegree,
        })
    }

    fn edge_count(&self) -> usize {
        self.adjacency.iter().map(Vec::len).sum()
    }

    /// Three-color DFS. A back-edge to an in-progress node is a cycle; the
    /// reported path starts and ends at that node.
    fn check_acyclic(&self) -> Result<(), CompileError> {
        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut stack: Vec<(usize, usize)> = Vec::new();

        for start in 0..self.nodes.len() {
            if marks[start] != Mark::Unvisited {
                continue;
            }
            marks[start] = Mark::InProgress;
            stack.push((start, 0));

            while let Some(top) = stack.last_mut() {
                let (node, cursor) = *top;
                let Some(&next) = self.adjacency[node].get(cursor) else {
                    marks[node] = Mark::Done;
                    stack.pop();
                    continue;
                };
                top.1 += 1;

                match marks[next] {
                    Mark::Unvisited => {
                        marks[next] = Mark::InProgress;
                        stack.push((next, 0));
                    }
                    Mark::InProgress => {
                        let pos = stack.iter().position(|&(n, _)| n == next).unwrap_or(0);
                        let mut path: Vec<NodeId> = stack[pos..]
                            .iter()
                            .map(|&(n, _)| self.nodes[n].id.clone())
                            .collect();
                        path.push(self.nodes[next].id.clone());
                        debug!(len = path.len(), "Cycle found during compilation");
                        return Err(CompileError::CycleDetected(path));
                    }
                    Mark::Done => {}
                }
            }
        }
        Ok(())
    }

    /// Reverse DFS post-order. Roots and children are walked back to front so
    /// that unconstrained nodes come out in registration order.
    fn topological_order(&self) -> Vec<usize> {
        let mut visited = vec![false; self.nodes.len()];
        let mut post = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<(usize, usize)> = Vec::new();

        for start in (0..self.nodes.len()).rev() {
            if visited[start] {
                continue;
            }
            visited[start] = true;
            stack.push((start, 0));

            while let Some(top) = stack.last_mut() {
                let (node, cursor) = *top;
                let children = &self.adjacency[node];
                if cursor == children.len() {
                    post.push(node);
                    stack.pop();
                    continue;
                }
                top.1 += 1;

                let next = children[children.len() - 1 - cursor];
                if !visited[next] {
                    visited[next] = true;
                    stack.push((next, 0));
                }
            }
        }

        post.reverse();
        post
    }

    /// Number of nodes on the longest chain. `order` must be parent-first.
    fn depth(&self, order: &[usize]) -> usize {
        let mut level = vec![1usize; self.nodes.len()];
        for &node in order {
            for &child in &self.adjacency[node] {
                level[child] = level[child].max(level[node] + 1);
            }
        }
        level.into_iter().max().unwrap_or(0)
    }

    fn render(&self, roots: RootSelection) -> TaskSetDocument {
        let task_set_nodes = (0..self.nodes.len())
            .filter(|&i| roots == RootSelection::All || self.indegree[i] == 0)
            .map(|i| self.render_task(i))
            .collect();
        TaskSetDocument { task_set_nodes }
    }

    fn render_task(&self, node: usize) -> TaskRecord {
        let mut record = TaskRecord::from_node(&self.nodes[node]);
        record.children = self.adjacency[node]
            .iter()
            .map(|&child| self.render_task(child))
            .collect();
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use execflow_test_utils::fixtures;

    fn ids(records: &[TaskRecord]) -> Vec<&str> {
        records.iter().map(|r| r.id.as_str()).collect()
    }

    fn order_of(compiled: &CompiledTaskSet) -> Vec<&str> {
        compiled.order.iter().map(NodeId::as_str).collect()
    }

    #[test]
    fn test_fan_out_embeds_children_under_single_root() {
        let snap = fixtures::snapshot(&["A", "B", "C"], &[("A", "B"), ("A", "C")]);
        let doc = compile(&snap.nodes, &snap.edges).unwrap();

        assert_eq!(ids(&doc.task_set_nodes), vec!["A"]);
        let a = &doc.task_set_nodes[0];
        assert_eq!(ids(&a.children), vec!["B", "C"]);
        assert!(a.children.iter().all(|c| c.children.is_empty()));
    }

    #[test]
    fn test_chain_nests_recursively() {
        let snap = fixtures::chain(&["A", "B", "C"]);
        let doc = compile(&snap.nodes, &snap.edges).unwrap();

        assert_eq!(ids(&doc.task_set_nodes), vec!["A"]);
        let b = &doc.task_set_nodes[0].children[0];
        assert_eq!(b.id.as_str(), "B");
        assert_eq!(ids(&b.children), vec!["C"]);
        assert!(b.children[0].children.is_empty());
    }

    #[test]
    fn test_shared_child_embedded_once_per_parent() {
        let snap = fixtures::diamond();
        let doc = compile(&snap.nodes, &snap.edges).unwrap();

        assert_eq!(doc.occurrences(&"d".into()), 2);
        assert_eq!(doc.occurrences(&"b".into()), 1);
        assert_eq!(doc.occurrences(&"c".into()), 1);
        assert_eq!(doc.occurrences(&"a".into()), 1);
    }

    #[test]
    fn test_occurrences_match_indegree() {
        let snap = fixtures::snapshot(
            &["a", "b", "c", "d", "lonely"],
            &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d"), ("a", "d")],
        );
        let doc = compile(&snap.nodes, &snap.edges).unwrap();

        for node in &snap.nodes {
            let indegree = snap.edges.iter().filter(|e| e.target == node.id).count();
            assert_eq!(doc.occurrences(&node.id), indegree.max(1), "node {}", node.id);
        }
    }

    #[test]
    fn test_parallel_edges_count_distinct_parents() {
        let nodes = ["a", "b", "c", "d"];
        let edges = [("a", "b"), ("a", "b"), ("a", "c"), ("b", "d"), ("c", "d"), ("c", "d")];
        let snap = fixtures::snapshot(&nodes, &edges);
        let doc = Compiler::default().compile(&snap).unwrap().document;

        for node in &snap.nodes {
            let parents: HashSet<&NodeId> = snap
                .edges
                .iter()
                .filter(|e| e.target == node.id)
                .map(|e| &e.source)
                .collect();
            let raw = snap.edges.iter().filter(|e| e.target == node.id).count();
            assert_eq!(doc.occurrences(&node.id), parents.len().max(1), "node {}", node.id);
            assert!(raw >= parents.len());
        }
        assert_eq!(doc.occurrences(&"b".into()), 1);
        assert_eq!(doc.occurrences(&"d".into()), 2);

        let strict = Compiler::new(CompileOptions {
            duplicate_edges: DuplicateEdgePolicy::Reject,
            ..Default::default()
        });
        assert_eq!(
            strict.compile(&snap).unwrap_err(),
            CompileError::DuplicateEdge(Edge::new("a", "b"))
        );
    }

    #[test]
    fn test_root_selection_all_lists_every_node() {
        let snap = fixtures::snapshot(&["A", "B", "C"], &[("A", "B"), ("A", "C")]);
        let compiler = Compiler::new(CompileOptions {
            root_selection: RootSelection::All,
            ..Default::default()
        });
        let doc = compiler.compile(&snap).unwrap().document;

        assert_eq!(ids(&doc.task_set_nodes), vec!["A", "B", "C"]);
        assert_eq!(doc.occurrences(&"B".into()), 2);
    }

    #[test]
    fn test_cycle_reports_path() {
        let snap = fixtures::snapshot(&["a", "b", "c"], &[("a", "b"), ("b", "c"), ("c", "a")]);
        let err = Compiler::default().compile(&snap).unwrap_err();
        assert_eq!(
            err,
            CompileError::CycleDetected(vec!["a".into(), "b".into(), "c".into(), "a".into()])
        );
    }

    #[test]
    fn test_cycle_not_reachable_from_first_node() {
        let snap = fixtures::snapshot(&["x", "a", "b"], &[("a", "b"), ("b", "a")]);
        let err = Compiler::default().compile(&snap).unwrap_err();
        assert_eq!(
            err,
            CompileError::CycleDetected(vec!["a".into(), "b".into(), "a".into()])
        );
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let snap = fixtures::snapshot(&["a"], &[("a", "a")]);
        let err = Compiler::default().compile(&snap).unwrap_err();
        assert_eq!(err, CompileError::CycleDetected(vec!["a".into(), "a".into()]));
    }

    #[test]
    fn test_dangling_edge_rejected() {
        let snap = fixtures::snapshot(&["a"], &[("a", "ghost")]);
        let err = Compiler::default().compile(&snap).unwrap_err();
        assert_eq!(err, CompileError::DanglingEdge(Edge::new("a", "ghost")));
    }

    #[test]
    fn test_dangling_checked_before_cycles() {
        let snap = fixtures::snapshot(&["a", "b"], &[("a", "b"), ("b", "a"), ("ghost", "a")]);
        let err = Compiler::default().compile(&snap).unwrap_err();
        assert!(matches!(err, CompileError::DanglingEdge(_)));
    }

    #[test]
    fn test_duplicate_node_ids_rejected() {
        let snap = fixtures::snapshot(&["a", "a"], &[]);
        let err = Compiler::default().compile(&snap).unwrap_err();
        assert_eq!(err, CompileError::DuplicateNodeId("a".into()));
    }

    #[test]
    fn test_empty_graph_policy() {
        let snap = GraphSnapshot::default();
        assert_eq!(
            Compiler::default().compile(&snap).unwrap_err(),
            CompileError::EmptyGraph
        );

        let lenient = Compiler::new(CompileOptions {
            allow_empty: true,
            ..Default::default()
        });
        let compiled = lenient.compile(&snap).unwrap();
        assert!(compiled.document.is_empty());
        assert!(compiled.order.is_empty());
        assert_eq!(compiled.document.to_json().unwrap(), r#"{"task_set_nodes":[]}"#);
    }

    #[test]
    fn test_duplicate_edges_collapse_by_default() {
        let snap = fixtures::snapshot(&["a", "b"], &[("a", "b"), ("a", "b")]);
        let doc = Compiler::default().compile(&snap).unwrap().document;
        assert_eq!(doc.task_set_nodes[0].children.len(), 1);
        assert_eq!(doc.occurrences(&"b".into()), 1);
    }

    #[test]
    fn test_duplicate_edges_rejected_when_configured() {
        let snap = fixtures::snapshot(&["a", "b"], &[("a", "b"), ("a", "b")]);
        let strict = Compiler::new(CompileOptions {
            duplicate_edges: DuplicateEdgePolicy::Reject,
            ..Default::default()
        });
        assert_eq!(
            strict.compile(&snap).unwrap_err(),
            CompileError::DuplicateEdge(Edge::new("a", "b"))
        );
    }

    #[test]
    fn test_topological_order_is_parent_first() {
        let snap = fixtures::snapshot(
            &["d", "c", "b", "a"],
            &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
        );
        let compiled = Compiler::default().compile(&snap).unwrap();
        let order = order_of(&compiled);

        let pos = |id: &str| order.iter().position(|o| *o == id).unwrap();
        for edge in &snap.edges {
            assert!(pos(edge.source.as_str()) < pos(edge.target.as_str()), "{}", edge);
        }
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn test_unconstrained_nodes_keep_registration_order() {
        let snap = fixtures::snapshot(&["n3", "n1", "n2"], &[]);
        let compiled = Compiler::default().compile(&snap).unwrap();
        assert_eq!(order_of(&compiled), vec!["n3", "n1", "n2"]);

        let snap = fixtures::snapshot(&["A", "B", "C"], &[("A", "B"), ("A", "C")]);
        let compiled = Compiler::default().compile(&snap).unwrap();
        assert_eq!(order_of(&compiled), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_compilation_is_deterministic() {
        let snap = fixtures::diamond();
        let first = Compiler::default().compile(&snap).unwrap();
        let second = Compiler::default().compile(&snap).unwrap();

        assert_eq!(
            first.document.to_json().unwrap().into_bytes(),
            second.document.to_json().unwrap().into_bytes()
        );
        assert_eq!(first.order, second.order);
    }

    #[test]
    fn test_options_from_config() {
        let config = CompilerConfig {
            allow_empty: true,
            duplicate_edges: DuplicateEdgePolicy::Reject,
            root_selection: RootSelection::All,
            max_depth: 8,
        };
        let options = CompileOptions::from(&config);
        assert!(options.allow_empty);
        assert_eq!(options.duplicate_edges, DuplicateEdgePolicy::Reject);
        assert_eq!(options.root_selection, RootSelection::All);
        assert_eq!(options.max_depth, 8);
        assert_eq!(CompileOptions::default().max_depth, DEFAULT_MAX_DEPTH);
    }

    fn long_chain(len: usize) -> Vec<String> {
        (0..len).map(|i| format!("n{}", i)).collect()
    }

    #[test]
    fn test_long_chain_rejected_as_too_deep() {
        let ids = long_chain(10_000);
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let snap = fixtures::chain(&refs);

        assert_eq!(
            Compiler::default().compile(&snap).unwrap_err(),
            CompileError::TooDeep {
                depth: 10_000,
                limit: DEFAULT_MAX_DEPTH,
            }
        );
    }

    #[test]
    fn test_long_chain_walks_use_explicit_stack() {
        let ids = long_chain(10_000);
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let snap = fixtures::chain(&refs);

        let graph = IndexedGraph::build(&snap, &CompileOptions::default()).unwrap();
        graph.check_acyclic().unwrap();
        let order = graph.topological_order();
        assert_eq!(order, (0..10_000).collect::<Vec<_>>());
        assert_eq!(graph.depth(&order), 10_000);
    }

    #[test]
    fn test_long_cycle_reports_full_path() {
        let ids = long_chain(10_000);
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let mut edges: Vec<(&str, &str)> = refs.windows(2).map(|w| (w[0], w[1])).collect();
        edges.push(("n9999", "n0"));
        let snap = fixtures::snapshot(&refs, &edges);

        match Compiler::default().compile(&snap).unwrap_err() {
            CompileError::CycleDetected(path) => {
                assert_eq!(path.len(), 10_001);
                assert_eq!(path[0].as_str(), "n0");
                assert_eq!(path[9_999].as_str(), "n9999");
                assert_eq!(path[10_000].as_str(), "n0");
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_depth_limit_is_inclusive() {
        let compiler = Compiler::new(CompileOptions {
            max_depth: 64,
            ..Default::default()
        });

        let ids = long_chain(64);
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let compiled = compiler.compile(&fixtures::chain(&refs)).unwrap();
        assert_eq!(compiled.document.record_count(), 64);
        assert_eq!(compiled.order.len(), 64);
        assert!(compiled.document.to_json().is_ok());

        let ids = long_chain(65);
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        assert_eq!(
            compiler.compile(&fixtures::chain(&refs)).unwrap_err(),
            CompileError::TooDeep {
                depth: 65,
                limit: 64,
            }
        );
    }

    #[test]
    fn test_depth_counts_longest_path_not_node_count() {
        // Wide but shallow: 1000 leaves under one root.
        let ids = long_chain(1_001);
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let edges: Vec<(&str, &str)> = refs[1..].iter().map(|leaf| ("n0", *leaf)).collect();
        let snap = fixtures::snapshot(&refs, &edges);

        let compiled = Compiler::default().compile(&snap).unwrap();
        assert_eq!(compiled.document.task_set_nodes.len(), 1);
        assert_eq!(compiled.document.record_count(), 1_001);
    }
}
