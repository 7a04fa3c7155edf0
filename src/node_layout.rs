//! Maps run name to tasks-per-node and, from that, derives per-run node
//! counts. Grounded in `codar.cheetah.model.NodeLayout`'s usage from
//! `Pipeline.set_ppn` (the class body itself was not retrieved in the
//! original-source pack; `default_no_share_layout` and
//! `get_node_containing_code` are reconstructed from spec.md §4.2 and their
//! call sites in `model.py`).

use std::collections::HashMap;

/// One node's occupants: run name → tasks placed on that node.
pub type NodeMap = HashMap<String, u32>;

/// A resolved node layout: one `NodeMap` per node.
#[derive(Debug, Clone)]
pub struct NodeLayout {
    nodes: Vec<NodeMap>,
}

impl NodeLayout {
    /// Build from a producer-supplied layout (list of `{runName: tasks}`
    /// maps), one map per node.
    pub fn from_explicit(nodes: Vec<NodeMap>) -> Self {
        NodeLayout { nodes }
    }

    /// Default full-occupancy layout: each run gets its own disjoint node,
    /// running `ppn` tasks per node (node sharing between runs is out of
    /// scope; spec.md §3/§4.2).
    pub fn default_no_share_layout(ppn: u32, run_names: &[String]) -> Self {
        let nodes = run_names
            .iter()
            .map(|name| {
                let mut map = NodeMap::new();
                map.insert(name.clone(), ppn);
                map
            })
            .collect();
        NodeLayout { nodes }
    }

    /// Returns the node map containing `name`, or `None` if it is hosted on
    /// more than one node or not found at all — both indicate a malformed
    /// producer layout, which the caller turns into a rejected admission
    /// rather than a crash.
    pub fn get_node_containing_code(&self, name: &str) -> Option<NodeMap> {
        let mut found: Option<&NodeMap> = None;
        for node in &self.nodes {
            if node.contains_key(name) {
                if found.is_some() {
                    // Node sharing between runs is not supported; a run
                    // appearing on more than one node is a malformed layout.
                    return None;
                }
                found = Some(node);
            }
        }
        found.cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_gives_each_run_its_own_node() {
        let names = vec!["a".to_string(), "b".to_string()];
        let layout = NodeLayout::default_no_share_layout(16, &names);
        let a = layout.get_node_containing_code("a").unwrap();
        assert_eq!(a.get("a"), Some(&16));
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn missing_run_returns_none() {
        let names = vec!["a".to_string()];
        let layout = NodeLayout::default_no_share_layout(8, &names);
        assert!(layout.get_node_containing_code("nope").is_none());
    }

    #[test]
    fn run_hosted_on_two_nodes_is_rejected() {
        let mut node_a = NodeMap::new();
        node_a.insert("shared".to_string(), 4);
        let mut node_b = NodeMap::new();
        node_b.insert("shared".to_string(), 4);
        let layout = NodeLayout::from_explicit(vec![node_a, node_b]);
        assert!(layout.get_node_containing_code("shared").is_none());
    }
}
