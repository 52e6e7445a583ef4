use serde_json::Value as Json;

use crate::{
    config::ModelFormat,
    ir::IrRecord,
    node::GraphNode,
    translate::{base_record, IngestContext, Layer},
    ConvertError,
};

/// The graph input. Its plane count seeds plane propagation.
#[derive(Default)]
pub struct InputLayer {
    shape: Option<Vec<i64>>,
    planes: Option<u32>,
}

impl Layer for InputLayer {
    fn ingest(&mut self, node: &GraphNode, cx: &IngestContext) -> Result<(), ConvertError> {
        let (shape, channel_axis) = match cx.format {
            ModelFormat::Keras => {
                let shape = node
                    .attrs
                    .ints("batch_input_shape")
                    .or_else(|| node.attrs.ints("batch_shape"));
                let axis = shape.as_ref().map_or(0, |s| s.len().saturating_sub(1));
                (shape, axis)
            }
            ModelFormat::Onnx => (node.attrs.ints("shape"), 1),
        };
        self.planes = shape
            .as_ref()
            .and_then(|s| s.get(channel_axis))
            .filter(|&&d| d > 0)
            .map(|&d| d as u32);
        if self.planes.is_none() {
            log::warn!("input '{}' has no static channel dimension", node.name);
        }
        self.shape = shape;
        Ok(())
    }

    fn emit(&self, node: &GraphNode) -> IrRecord {
        let mut record = base_record(node, "InputLayer").with_output_planes(self.planes);
        if let Some(shape) = &self.shape {
            let dims: Vec<Json> = shape
                .iter()
                .map(|&d| if d < 0 { Json::Null } else { Json::from(d) })
                .collect();
            record.set("shape", dims);
        }
        record
    }
}

#[test]
fn channel_dimension_by_format() {
    use crate::{attr::AttrValue, custom::CustomObjects, shape::NoShapes};

    let custom = CustomObjects::new();
    let keras = IngestContext {
        format: ModelFormat::Keras,
        shapes: &NoShapes,
        custom: &custom,
    };
    let node = GraphNode::new("in", "InputLayer").with_attr(
        "batch_input_shape",
        AttrValue::Json(serde_json::json!([null, 224, 224, 3])),
    );
    let mut layer = InputLayer::default();
    layer.ingest(&node, &keras).unwrap();
    let record = layer.emit(&node);
    assert_eq!(record.output_planes, Some(3));
    assert_eq!(record.fields["shape"], serde_json::json!([null, 224, 224, 3]));

    let onnx = IngestContext {
        format: ModelFormat::Onnx,
        ..keras
    };
    let node = GraphNode::new("x", "Input").with_attr("shape", AttrValue::Ints(vec![1, 8, 32, 32]));
    let mut layer = InputLayer::default();
    layer.ingest(&node, &onnx).unwrap();
    assert_eq!(layer.emit(&node).output_planes, Some(8));
}
