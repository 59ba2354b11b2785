use execflow_core::graph::GraphSnapshot;
use execflow_core::types::{Edge, Node};
use execflow_crypto::SharedKey;

/// 32 ASCII bytes `0123456789abcdef0123456789abcdef`, base64-encoded.
pub const TEST_KEY_B64: &str = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=";

pub fn test_key() -> SharedKey {
    SharedKey::from_base64(TEST_KEY_B64).expect("test key is 32 bytes")
}

/// Nodes labelled after their ids, `echo <id>` scripts, edges as given.
pub fn snapshot(ids: &[&str], edges: &[(&str, &str)]) -> GraphSnapshot {
    let nodes = ids
        .iter()
        .map(|id| Node::new(*id, id.to_uppercase()).with_script(format!("echo {}", id)))
        .collect();
    let edges = edges.iter().map(|(s, t)| Edge::new(*s, *t)).collect();
    GraphSnapshot::new(nodes, edges)
}

/// `ids[0] -> ids[1] -> ... -> ids[n-1]`
pub fn chain(ids: &[&str]) -> GraphSnapshot {
    let edges: Vec<(&str, &str)> = ids.windows(2).map(|w| (w[0], w[1])).collect();
    snapshot(ids, &edges)
}

/// `a -> b, a -> c, b -> d, c -> d`
pub fn diamond() -> GraphSnapshot {
    snapshot(
        &["a", "b", "c", "d"],
        &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
    )
}
