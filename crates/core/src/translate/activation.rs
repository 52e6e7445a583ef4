use crate::{
    config::ModelFormat,
    ir::{json_f32, IrRecord},
    node::{FusedActivation, GraphNode},
    translate::{base_record, IngestContext, Layer},
    ConvertError,
};

const KERAS_LEAKY_ALPHA: f32 = 0.3;
const ONNX_LEAKY_ALPHA: f32 = 0.01;

/// Canonical activation name and parameter of an activation node.
pub fn fused_activation(node: &GraphNode, format: ModelFormat) -> FusedActivation {
    let (name, alpha) = match (format, node.op_type.as_str()) {
        (ModelFormat::Keras, "LeakyReLU") => (
            "leakyRelu".to_owned(),
            Some(node.attrs.float("alpha").unwrap_or(KERAS_LEAKY_ALPHA)),
        ),
        (ModelFormat::Keras, "ReLU") => match node.attrs.float("max_value") {
            Some(m) if m == 6.0 => ("relu6".to_owned(), None),
            _ => ("relu".to_owned(), None),
        },
        (ModelFormat::Keras, _) => (
            node.attrs.str("activation").unwrap_or("linear").to_owned(),
            None,
        ),
        (ModelFormat::Onnx, "LeakyRelu") => (
            "leakyRelu".to_owned(),
            Some(node.attrs.float("alpha").unwrap_or(ONNX_LEAKY_ALPHA)),
        ),
        (ModelFormat::Onnx, "Clip") => ("relu6".to_owned(), None),
        (ModelFormat::Onnx, op) => (op.to_ascii_lowercase(), None),
    };
    FusedActivation {
        name,
        alpha,
        source: node.name.clone(),
    }
}

/// An activation that found nothing to fuse into.
#[derive(Default)]
pub struct ActivationLayer {
    activation: Option<FusedActivation>,
}

impl Layer for ActivationLayer {
    fn ingest(&mut self, node: &GraphNode, cx: &IngestContext) -> Result<(), ConvertError> {
        self.activation = Some(fused_activation(node, cx.format));
        Ok(())
    }

    fn emit(&self, node: &GraphNode) -> IrRecord {
        let mut record = base_record(node, "Activation");
        if let Some(act) = &self.activation {
            record.set("activation", act.name.as_str());
            record.set_opt("alpha", act.alpha.map(json_f32));
        }
        record
    }
}

#[test]
fn canonical_names() {
    use crate::attr::AttrValue;

    let relu6 = GraphNode::new("r", "ReLU").with_attr("max_value", AttrValue::Float(6.0));
    assert_eq!(fused_activation(&relu6, ModelFormat::Keras).name, "relu6");

    let leaky = GraphNode::new("l", "LeakyReLU");
    let act = fused_activation(&leaky, ModelFormat::Keras);
    assert_eq!((act.name.as_str(), act.alpha), ("leakyRelu", Some(0.3)));

    let leaky = GraphNode::new("l", "LeakyRelu");
    assert_eq!(fused_activation(&leaky, ModelFormat::Onnx).alpha, Some(0.01));

    let act = GraphNode::new("a", "Activation")
        .with_attr("activation", AttrValue::Str("sigmoid".into()));
    assert_eq!(fused_activation(&act, ModelFormat::Keras).name, "sigmoid");

    let clip = GraphNode::new("c", "Clip");
    assert_eq!(fused_activation(&clip, ModelFormat::Onnx).name, "relu6");
    let swish = GraphNode::new("s", "Swish");
    assert_eq!(fused_activation(&swish, ModelFormat::Onnx).name, "swish");
}
