use id_arena::{Arena, Id};
use rustc_hash::FxHashMap;

use crate::{
    attr::{AttrValue, Attributes},
    tensor::Tensor,
    weights::BatchNormWeights,
};

pub type NodeId = Id<GraphNode>;
pub type NodeArena = Arena<GraphNode>;

#[derive(Debug, Clone)]
pub struct GraphNode {
    pub name: String,
    pub op_type: String,
    pub attrs: Attributes,
    /// Producers of this node's operands, in operand order. `None` until synthesized.
    pub inbound: Option<Vec<String>>,
    pub weights: FxHashMap<String, Tensor>,
    /// Inner nodes of a container.
    pub children: Vec<GraphNode>,
    pub fused: Fused,
    pub deleted: bool,
}

/// What a layer has absorbed from its successors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fused {
    pub activation: Option<FusedActivation>,
    pub batch_norm: Option<FusedBatchNorm>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FusedActivation {
    pub name: String,
    pub alpha: Option<f32>,
    /// Name of the node the activation came from.
    pub source: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FusedBatchNorm {
    pub params: BatchNormWeights,
    pub epsilon: Option<f32>,
    pub source: String,
}

/// Data a fusible node hands over to its merge target.
#[derive(Debug, Clone, PartialEq)]
pub enum Absorb {
    Activation(FusedActivation),
    BatchNorm(FusedBatchNorm),
}

impl Fused {
    /// A target takes at most one activation and one batch-norm, and never a batch-norm once an
    /// activation is in place.
    pub fn accepts(&self, absorb: &Absorb) -> bool {
        match absorb {
            Absorb::Activation(_) => self.activation.is_none(),
            Absorb::BatchNorm(_) => self.batch_norm.is_none() && self.activation.is_none(),
        }
    }

    pub fn absorb(&mut self, absorb: Absorb) {
        debug_assert!(self.accepts(&absorb));
        match absorb {
            Absorb::Activation(act) => self.activation = Some(act),
            Absorb::BatchNorm(bn) => self.batch_norm = Some(bn),
        }
    }
}

impl GraphNode {
    pub fn new(name: impl Into<String>, op_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op_type: op_type.into(),
            attrs: Attributes::new(),
            inbound: None,
            weights: FxHashMap::default(),
            children: Vec::new(),
            fused: Fused::default(),
            deleted: false,
        }
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: AttrValue) -> Self {
        self.attrs.set(key, value);
        self
    }

    pub fn with_in(mut self, name: impl Into<String>) -> Self {
        self.inbound.get_or_insert_with(Vec::new).push(name.into());
        self
    }

    pub fn with_ins<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.inbound
            .get_or_insert_with(Vec::new)
            .extend(names.into_iter().map(Into::into));
        self
    }

    pub fn with_weight(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.weights.insert(name.into(), tensor);
        self
    }

    pub fn with_child(mut self, child: GraphNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn alloc(self, arena: &mut NodeArena) -> NodeId {
        arena.alloc(self)
    }

    pub fn inbound(&self) -> &[String] {
        self.inbound.as_deref().unwrap_or_default()
    }

    /// Names of all operands as loaded, weights included. Falls back to the inbound list for
    /// formats that keep weights apart from operands.
    pub fn operands(&self) -> Vec<&str> {
        match self.attrs.strs("operands") {
            Some(ops) => ops.iter().map(String::as_str).collect(),
            None => self.inbound().iter().map(String::as_str).collect(),
        }
    }

    /// Whether this node can take `absorb` as a merge target. A batch-norm never follows an
    /// activation, fused or declared on the layer itself.
    pub fn accepts(&self, absorb: &Absorb) -> bool {
        let own_activation = self
            .attrs
            .str("activation")
            .map_or(false, |act| act != "linear");
        self.fused.accepts(absorb) && !(matches!(absorb, Absorb::BatchNorm(_)) && own_activation)
    }

    /// Weight tensor bound to operand `idx`.
    pub fn operand_weight(&self, idx: usize) -> Option<&Tensor> {
        self.attrs
            .strs("operands")
            .and_then(|ops| ops.get(idx))
            .and_then(|name| self.weights.get(name))
    }
}

#[test]
fn terminal_rule() {
    let act = Absorb::Activation(FusedActivation {
        name: "relu".into(),
        alpha: None,
        source: "relu_1".into(),
    });
    let bn = Absorb::BatchNorm(FusedBatchNorm {
        params: BatchNormWeights::default(),
        epsilon: None,
        source: "bn_1".into(),
    });

    let mut fused = Fused::default();
    assert!(fused.accepts(&bn));
    fused.absorb(bn.clone());
    assert!(!fused.accepts(&bn));
    assert!(fused.accepts(&act));
    fused.absorb(act.clone());
    assert!(!fused.accepts(&act));

    let mut fused = Fused::default();
    fused.absorb(act);
    assert!(!fused.accepts(&bn));
}
