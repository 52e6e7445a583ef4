use serde_json::Value as Json;

use crate::{
    ir::{json_f32, IrRecord},
    node::GraphNode,
    translate::{base_record, IngestContext, Layer},
    ConvertError,
};

/// ONNX `Pad`. Newer opsets pass `pads` and the fill value as operands.
#[derive(Default)]
pub struct PadLayer {
    mode: Option<String>,
    pads: Option<Vec<i64>>,
    constant_value: f32,
}

impl Layer for PadLayer {
    fn ingest(&mut self, node: &GraphNode, _cx: &IngestContext) -> Result<(), ConvertError> {
        self.mode = Some(node.attrs.str("mode").unwrap_or("constant").to_owned());
        self.pads = node
            .operand_weight(1)
            .map(|t| t.to_i64_vec())
            .or_else(|| node.attrs.ints("pads"));
        self.constant_value = node
            .operand_weight(2)
            .and_then(|t| t.data().first().copied())
            .or_else(|| node.attrs.float("value"))
            .unwrap_or(0.0);
        Ok(())
    }

    fn emit(&self, node: &GraphNode) -> IrRecord {
        let mut record = base_record(node, "Pad");
        record.set_opt("mode", self.mode.as_deref());
        record.set_opt("pads", self.pads.clone());
        record.set("constant_value", json_f32(self.constant_value));
        record
    }
}

/// Keras `ZeroPadding2D`; the padding spec is copied as given.
#[derive(Default)]
pub struct ZeroPadLayer {
    padding: Option<Json>,
}

impl Layer for ZeroPadLayer {
    fn ingest(&mut self, node: &GraphNode, _cx: &IngestContext) -> Result<(), ConvertError> {
        self.padding = node.attrs.get("padding").map(|p| p.to_json());
        Ok(())
    }

    fn emit(&self, node: &GraphNode) -> IrRecord {
        let mut record = base_record(node, "ZeroPadding2D");
        record.set_opt("padding", self.padding.clone());
        record
    }
}

#[test]
fn pads_from_operands() {
    use crate::{
        attr::AttrValue, config::ModelFormat, custom::CustomObjects, shape::NoShapes,
        tensor::Tensor,
    };

    let custom = CustomObjects::new();
    let cx = IngestContext {
        format: ModelFormat::Onnx,
        shapes: &NoShapes,
        custom: &custom,
    };
    let node = GraphNode::new("pad", "Pad")
        .with_in("x")
        .with_attr(
            "operands",
            AttrValue::Strs(vec!["x".into(), "p".into(), "v".into()]),
        )
        .with_attr("mode", AttrValue::Str("reflect".into()))
        .with_weight("p", Tensor::from_vec(vec![0., 0., 1., 1., 0., 0., 1., 1.]))
        .with_weight("v", Tensor::from_vec(vec![0.5]));
    let mut layer = PadLayer::default();
    layer.ingest(&node, &cx).unwrap();
    let record = layer.emit(&node);
    assert_eq!(record.fields["mode"], "reflect");
    assert_eq!(
        record.fields["pads"],
        serde_json::json!([0, 0, 1, 1, 0, 0, 1, 1])
    );
    assert_eq!(record.fields["constant_value"], 0.5);
}
