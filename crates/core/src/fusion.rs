use std::time::Instant;

use crate::{
    config::ModelFormat,
    custom::CustomObjects,
    graph::Graph,
    node::NodeId,
    registry::LayerSupportRegistry,
    translate::LayerKind,
    ConvertError,
};

/// What happened to a node visited by the fusion engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The node stays in the graph and is translated on its own.
    Kept,
    /// The node was merged into `target` and removed.
    Fused { target: NodeId },
    /// The node was dropped and its inputs handed to its users.
    Elided,
}

/// Merges fusible nodes into the predecessor they qualify for, as decided by the registry.
pub struct FusionEngine<'a> {
    registry: &'a LayerSupportRegistry,
    format: ModelFormat,
}

impl<'a> FusionEngine<'a> {
    pub fn new(registry: &'a LayerSupportRegistry, format: ModelFormat) -> Self {
        Self { registry, format }
    }

    /// Tries to fuse or elide the live node `id`, whose layer family is `kind`.
    pub fn fuse_node(
        &self,
        graph: &mut Graph,
        id: NodeId,
        kind: &LayerKind,
    ) -> Result<Outcome, ConvertError> {
        let node = &graph.nodes[id];
        if node.deleted {
            return Ok(Outcome::Kept);
        }

        if *kind == LayerKind::Dropout {
            let name = node.name.clone();
            let inbound = node.inbound().to_vec();
            log::debug!("elide {name}");
            graph.splice(&name, &inbound);
            graph.remove(id);
            return Ok(Outcome::Elided);
        }

        let Some(rule) = self.registry.rule(self.format, &node.op_type) else {
            return Ok(Outcome::Kept);
        };
        if !rule.is_fusible {
            return Ok(Outcome::Kept);
        }
        let Some(absorb) = kind.absorb(node, self.format)? else {
            return Ok(Outcome::Kept);
        };

        let target = node.inbound().iter().find_map(|input| {
            let target_id = graph.find(input)?;
            let target = &graph.nodes[target_id];
            let qualifies = !target.deleted
                && rule.fuses_into(&target.op_type)
                && target.accepts(&absorb);
            qualifies.then_some(target_id)
        });
        let Some(target_id) = target else {
            return Ok(Outcome::Kept);
        };

        let name = node.name.clone();
        let target_name = graph.nodes[target_id].name.clone();
        log::debug!("fuse {name} into {target_name}");
        graph.nodes[target_id].fused.absorb(absorb);
        graph.splice(&name, &[target_name]);
        graph.remove(id);

        Ok(Outcome::Fused { target: target_id })
    }

    /// Runs fusion over the whole graph in declaration order and returns the number of nodes
    /// removed. Nodes without a layer family are left alone.
    pub fn run(&self, graph: &mut Graph, custom: &CustomObjects) -> Result<usize, ConvertError> {
        let start = Instant::now();
        let mut count = 0;

        for id in graph.live_ids() {
            let Ok(kind) = LayerKind::resolve(self.format, &graph.nodes[id].op_type, custom) else {
                continue;
            };
            if self.fuse_node(graph, id, &kind)? != Outcome::Kept {
                count += 1;
            }
        }

        log::info!("fuse_layers({count}): {:?}", start.elapsed());
        Ok(count)
    }
}

#[cfg(test)]
fn bn_node(name: &str, input: &str) -> crate::node::GraphNode {
    use crate::tensor::Tensor;

    crate::node::GraphNode::new(name, "BatchNormalization")
        .with_in(input)
        .with_weight("gamma", Tensor::from_vec(vec![1.0]))
        .with_weight("beta", Tensor::from_vec(vec![0.0]))
        .with_weight("moving_mean", Tensor::from_vec(vec![0.0]))
        .with_weight("moving_variance", Tensor::from_vec(vec![1.0]))
}

#[test]
fn chain_collapses_in_one_pass() {
    use crate::node::GraphNode;

    let mut graph = Graph::from_nodes([
        GraphNode::new("in", "InputLayer").with_ins(Vec::<String>::new()),
        GraphNode::new("conv", "Conv2D").with_in("in"),
        bn_node("bn", "conv"),
        GraphNode::new("relu", "ReLU").with_in("bn"),
        GraphNode::new("d", "Dense").with_in("relu"),
    ]);
    let registry = LayerSupportRegistry::builtin();
    let engine = FusionEngine::new(&registry, ModelFormat::Keras);
    let custom = CustomObjects::new();

    assert_eq!(engine.run(&mut graph, &custom).unwrap(), 2);
    let conv = graph.get("conv").unwrap();
    assert_eq!(conv.fused.batch_norm.as_ref().unwrap().source, "bn");
    assert_eq!(conv.fused.activation.as_ref().unwrap().name, "relu");
    assert_eq!(graph.get("d").unwrap().inbound(), &["conv"]);

    // Nothing left to fuse.
    assert_eq!(engine.run(&mut graph, &custom).unwrap(), 0);
}

#[test]
fn shared_target_still_fuses() {
    use crate::node::GraphNode;

    let mut graph = Graph::from_nodes([
        GraphNode::new("in", "InputLayer").with_ins(Vec::<String>::new()),
        GraphNode::new("conv", "Conv2D").with_in("in"),
        GraphNode::new("relu", "ReLU").with_in("conv"),
        GraphNode::new("add", "Add").with_ins(["conv", "relu"]),
    ]);
    let registry = LayerSupportRegistry::builtin();
    let engine = FusionEngine::new(&registry, ModelFormat::Keras);

    assert_eq!(engine.run(&mut graph, &CustomObjects::new()).unwrap(), 1);
    assert!(graph.get("relu").is_none());
    assert_eq!(graph.get("conv").unwrap().fused.activation.as_ref().unwrap().source, "relu");
    assert_eq!(graph.get("add").unwrap().inbound(), &["conv", "conv"]);
}

#[test]
fn no_batch_norm_after_activation() {
    use crate::node::GraphNode;

    let mut graph = Graph::from_nodes([
        GraphNode::new("in", "InputLayer").with_ins(Vec::<String>::new()),
        GraphNode::new("conv", "Conv2D").with_in("in"),
        GraphNode::new("relu", "ReLU").with_in("conv"),
        bn_node("bn", "relu"),
    ]);
    let registry = LayerSupportRegistry::builtin();
    let engine = FusionEngine::new(&registry, ModelFormat::Keras);

    assert_eq!(engine.run(&mut graph, &CustomObjects::new()).unwrap(), 1);
    assert!(graph.get("bn").is_some());
    assert!(graph.get("conv").unwrap().fused.batch_norm.is_none());
}

#[test]
fn no_batch_norm_after_declared_activation() {
    use crate::{attr::AttrValue, node::GraphNode};

    let mut graph = Graph::from_nodes([
        GraphNode::new("in", "InputLayer").with_ins(Vec::<String>::new()),
        GraphNode::new("conv", "Conv2D")
            .with_in("in")
            .with_attr("activation", AttrValue::Str("relu".into())),
        bn_node("bn", "conv"),
        GraphNode::new("conv2", "Conv2D")
            .with_in("bn")
            .with_attr("activation", AttrValue::Str("linear".into())),
        bn_node("bn2", "conv2"),
    ]);
    let registry = LayerSupportRegistry::builtin();
    let engine = FusionEngine::new(&registry, ModelFormat::Keras);

    assert_eq!(engine.run(&mut graph, &CustomObjects::new()).unwrap(), 1);
    assert!(graph.get("bn").is_some());
    assert!(graph.get("conv").unwrap().fused.batch_norm.is_none());
    assert_eq!(graph.get("conv2").unwrap().fused.batch_norm.as_ref().unwrap().source, "bn2");
}

#[test]
fn dropout_is_elided() {
    use crate::node::GraphNode;

    let mut graph = Graph::from_nodes([
        GraphNode::new("a", "InputLayer").with_ins(Vec::<String>::new()),
        GraphNode::new("b", "InputLayer").with_ins(Vec::<String>::new()),
        GraphNode::new("drop", "Dropout").with_in("a"),
        GraphNode::new("cat", "Concatenate").with_ins(["b", "drop"]),
    ]);
    let registry = LayerSupportRegistry::empty();
    let engine = FusionEngine::new(&registry, ModelFormat::Keras);

    assert_eq!(engine.run(&mut graph, &CustomObjects::new()).unwrap(), 1);
    assert_eq!(graph.get("cat").unwrap().inbound(), &["b", "a"]);
}
