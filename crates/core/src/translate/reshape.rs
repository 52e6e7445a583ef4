use crate::{
    config::ModelFormat,
    ir::IrRecord,
    node::GraphNode,
    translate::{base_record, IngestContext, Layer},
    ConvertError,
};

/// `Flatten` and `Reshape`. Neither changes the plane count.
pub struct ReshapeLayer {
    flatten: bool,
    target_shape: Option<Vec<i64>>,
}

impl ReshapeLayer {
    pub fn flatten() -> Self {
        Self {
            flatten: true,
            target_shape: None,
        }
    }

    pub fn reshape() -> Self {
        Self {
            flatten: false,
            target_shape: None,
        }
    }
}

impl Layer for ReshapeLayer {
    fn ingest(&mut self, node: &GraphNode, cx: &IngestContext) -> Result<(), ConvertError> {
        if self.flatten {
            return Ok(());
        }
        self.target_shape = match cx.format {
            ModelFormat::Keras => node.attrs.ints("target_shape"),
            ModelFormat::Onnx => node
                .operand_weight(1)
                .map(|t| t.to_i64_vec())
                .or_else(|| node.attrs.ints("shape")),
        };
        if self.target_shape.is_none() {
            log::warn!("reshape '{}' has no constant target shape", node.name);
        }
        Ok(())
    }

    fn emit(&self, node: &GraphNode) -> IrRecord {
        if self.flatten {
            return base_record(node, "Flatten");
        }
        let mut record = base_record(node, "Reshape");
        record.set_opt("target_shape", self.target_shape.clone());
        record
    }
}

#[test]
fn onnx_shape_operand() {
    use crate::{attr::AttrValue, custom::CustomObjects, shape::NoShapes, tensor::Tensor};

    let custom = CustomObjects::new();
    let cx = IngestContext {
        format: ModelFormat::Onnx,
        shapes: &NoShapes,
        custom: &custom,
    };
    let node = GraphNode::new("r", "Reshape")
        .with_in("x")
        .with_attr("operands", AttrValue::Strs(vec!["x".into(), "s".into()]))
        .with_weight("s", Tensor::from_vec(vec![1.0, -1.0]));
    let mut layer = ReshapeLayer::reshape();
    layer.ingest(&node, &cx).unwrap();
    let record = layer.emit(&node);
    assert_eq!(record.fields["target_shape"], serde_json::json!([1, -1]));
}
