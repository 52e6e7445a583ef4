use std::time::Instant;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{config::ModelFormat, graph::Graph, node::GraphNode, ConvertError};

/// Flattens containers, fills in missing inbound lists and, for ONNX, folds `Sigmoid * x` into
/// `Swish`.
pub fn normalize(nodes: Vec<GraphNode>, format: ModelFormat) -> Result<Graph, ConvertError> {
    let start = Instant::now();

    let mut nodes = flatten_containers(nodes);
    synthesize_inbounds(&mut nodes);

    let mut seen = FxHashSet::default();
    for node in &nodes {
        if !seen.insert(node.name.as_str()) {
            return Err(ConvertError::InvalidGraph(
                format!("duplicate node name '{}'", node.name).into(),
            ));
        }
    }

    let mut graph = Graph::from_nodes(nodes);
    if format == ModelFormat::Onnx {
        merge_swish(&mut graph);
    }

    log::info!("normalize({}): {:?}", graph.live_ids().len(), start.elapsed());

    Ok(graph)
}

/// Expands containers depth-first. References to a container are redirected to its last leaf.
pub fn flatten_containers(nodes: Vec<GraphNode>) -> Vec<GraphNode> {
    let mut flat = Vec::with_capacity(nodes.len());
    let mut alias = FxHashMap::default();
    for node in nodes {
        expand(node, &mut flat, &mut alias);
    }

    if alias.is_empty() {
        return flat;
    }

    for node in &mut flat {
        if let Some(inbound) = node.inbound.as_mut() {
            for name in inbound.iter_mut() {
                // Nested containers alias to another container's name.
                let mut guard = 0;
                while let Some(target) = alias.get(name.as_str()) {
                    *name = String::clone(target);
                    guard += 1;
                    if guard > alias.len() {
                        break;
                    }
                }
            }
        }
    }
    flat
}

fn expand(mut node: GraphNode, flat: &mut Vec<GraphNode>, alias: &mut FxHashMap<String, String>) {
    if node.children.is_empty() {
        if is_container(&node) {
            log::warn!("container '{}' is empty", node.name);
            if let Some(prev) = flat.last() {
                alias.insert(node.name, prev.name.clone());
            }
            return;
        }
        flat.push(node);
        return;
    }

    let children = std::mem::take(&mut node.children);
    let last = children.last().map(|c| c.name.clone());
    for child in children {
        expand(child, flat, alias);
    }
    if let Some(last) = last {
        log::debug!("container '{}' resolves to '{last}'", node.name);
        alias.insert(node.name, last);
    }
}

fn is_container(node: &GraphNode) -> bool {
    matches!(node.op_type.as_str(), "Sequential" | "Functional" | "Model")
}

/// A node without an inbound list takes the node declared before it; the first node takes none.
pub fn synthesize_inbounds(nodes: &mut [GraphNode]) {
    let mut prev: Option<String> = None;
    for node in nodes.iter_mut() {
        if node.inbound.is_none() {
            node.inbound = Some(prev.iter().cloned().collect());
        }
        prev = Some(node.name.clone());
    }
}

/// `y = Sigmoid(x); z = Mul(x, y)` declared back to back becomes `y = Swish(x)`.
pub fn merge_swish(graph: &mut Graph) -> usize {
    let mut count = 0;
    let ids = graph.live_ids();
    for pair in ids.windows(2) {
        let (sig_id, mul_id) = (pair[0], pair[1]);
        let (sig, mul) = (&graph.nodes[sig_id], &graph.nodes[mul_id]);
        if sig.deleted || sig.op_type != "Sigmoid" || mul.op_type != "Mul" {
            continue;
        }
        let Some(x) = sig.inbound().first() else {
            continue;
        };
        let consumes = |n: &str| mul.inbound().iter().any(|i| i == n);
        if !(consumes(&sig.name) && consumes(x)) {
            continue;
        }

        log::debug!("merge {} * {} into swish", sig.name, mul.name);
        let sig_name = sig.name.clone();
        let mul_name = mul.name.clone();
        graph.nodes[sig_id].op_type = "Swish".to_owned();
        graph.splice(&mul_name, &[sig_name]);
        graph.remove(mul_id);
        count += 1;
    }
    count
}

#[test]
fn flatten_redirects_to_last_leaf() {
    let nodes = vec![
        GraphNode::new("in", "InputLayer").with_ins(Vec::<String>::new()),
        GraphNode::new("block", "Sequential")
            .with_child(GraphNode::new("l1", "Dense"))
            .with_child(GraphNode::new("l2", "Dense"))
            .with_child(GraphNode::new("l3", "Dense")),
        GraphNode::new("d", "Dense").with_in("block"),
    ];
    let graph = normalize(nodes, ModelFormat::Keras).unwrap();
    let names: Vec<_> = graph.live_nodes().map(|n| n.name.as_str()).collect();
    assert_eq!(names, vec!["in", "l1", "l2", "l3", "d"]);
    assert_eq!(graph.get("d").unwrap().inbound(), &["l3"]);
    assert_eq!(graph.get("l1").unwrap().inbound(), &["in"]);
    assert!(graph.get("block").is_none());
}

#[test]
fn nested_containers_alias_transitively() {
    let nodes = vec![
        GraphNode::new("outer", "Sequential").with_child(
            GraphNode::new("inner", "Sequential")
                .with_child(GraphNode::new("a", "Dense"))
                .with_child(GraphNode::new("b", "Dense")),
        ),
        GraphNode::new("c", "Add").with_ins(["outer", "inner"]),
    ];
    let flat = flatten_containers(nodes);
    assert_eq!(flat.last().unwrap().inbound(), &["b", "b"]);
}

#[test]
fn first_node_gets_no_inbound() {
    let mut nodes = vec![GraphNode::new("a", "InputLayer"), GraphNode::new("b", "Dense")];
    synthesize_inbounds(&mut nodes);
    assert_eq!(nodes[0].inbound, Some(vec![]));
    assert_eq!(nodes[1].inbound(), &["a"]);
}

#[test]
fn duplicate_names_are_rejected() {
    let nodes = vec![GraphNode::new("a", "Input"), GraphNode::new("a", "Relu")];
    assert!(matches!(
        normalize(nodes, ModelFormat::Onnx),
        Err(ConvertError::InvalidGraph(_))
    ));
}
