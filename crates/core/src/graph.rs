use rustc_hash::FxHashMap as HashMap;

use crate::node::{GraphNode, NodeArena, NodeId};

/// Flat node graph in declaration order.
#[derive(Default, Clone)]
pub struct Graph {
    pub nodes: NodeArena,
    order: Vec<NodeId>,
    names: HashMap<String, NodeId>,
}

impl Graph {
    pub fn from_nodes(nodes: impl IntoIterator<Item = GraphNode>) -> Self {
        let mut graph = Graph::default();
        for node in nodes {
            graph.add_node(node);
        }
        graph
    }

    pub fn add_node(&mut self, node: GraphNode) -> NodeId {
        let name = node.name.clone();
        let id = node.alloc(&mut self.nodes);
        self.order.push(id);
        self.names.insert(name, id);
        id
    }

    /// Ids of nodes that have not been fused away or elided, in declaration order.
    pub fn live_ids(&self) -> Vec<NodeId> {
        self.order
            .iter()
            .copied()
            .filter(|&id| !self.nodes[id].deleted)
            .collect()
    }

    pub fn live_nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.order
            .iter()
            .map(|&id| &self.nodes[id])
            .filter(|n| !n.deleted)
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.names.get(name).copied()
    }

    /// Live node named `name`.
    pub fn get(&self, name: &str) -> Option<&GraphNode> {
        self.find(name)
            .map(|id| &self.nodes[id])
            .filter(|n| !n.deleted)
    }

    /// Live nodes that reference `name` in their inbound list.
    pub fn users_of(&self, name: &str) -> Vec<NodeId> {
        self.order
            .iter()
            .copied()
            .filter(|&id| {
                let node = &self.nodes[id];
                !node.deleted && node.inbound().iter().any(|n| n == name)
            })
            .collect()
    }

    /// Replaces every reference to `removed` with `replacement`, inserted at the slot the reference
    /// occupied.
    pub fn splice(&mut self, removed: &str, replacement: &[String]) {
        let users = self.users_of(removed);
        for id in users {
            let Some(inbound) = self.nodes[id].inbound.as_mut() else {
                continue;
            };
            let mut rewritten = Vec::with_capacity(inbound.len() + replacement.len());
            for name in inbound.drain(..) {
                if name == removed {
                    rewritten.extend(replacement.iter().cloned());
                } else {
                    rewritten.push(name);
                }
            }
            *inbound = rewritten;
        }
    }

    pub fn remove(&mut self, id: NodeId) {
        self.nodes[id].deleted = true;
    }
}

#[test]
fn splice_keeps_slot() {
    let mut graph = Graph::from_nodes([
        GraphNode::new("a", "Input").with_ins(Vec::<String>::new()),
        GraphNode::new("b", "Input").with_ins(Vec::<String>::new()),
        GraphNode::new("d", "Dropout").with_in("a"),
        GraphNode::new("c", "Concatenate").with_ins(["b", "d", "b"]),
    ]);
    let d = graph.find("d").unwrap();
    graph.splice("d", &["a".to_string()]);
    graph.remove(d);

    assert_eq!(graph.get("c").unwrap().inbound(), &["b", "a", "b"]);
    assert!(graph.get("d").is_none());
    assert_eq!(graph.live_ids().len(), 3);
}

#[test]
fn splice_many() {
    let mut graph = Graph::from_nodes([
        GraphNode::new("x", "Add").with_ins(["p", "q"]),
        GraphNode::new("y", "Concatenate").with_ins(["r", "x", "s"]),
    ]);
    graph.splice("x", &["p".to_string(), "q".to_string()]);
    assert_eq!(graph.get("y").unwrap().inbound(), &["r", "p", "q", "s"]);
}
