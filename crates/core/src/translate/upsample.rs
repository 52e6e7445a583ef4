use crate::{
    config::ModelFormat,
    ir::{json_f32, IrRecord},
    node::GraphNode,
    translate::{base_record, first_int, IngestContext, Layer},
    ConvertError,
};

#[derive(Default)]
pub struct UpSampleLayer {
    scale_factor: Option<f32>,
    interpolation: Option<String>,
}

impl Layer for UpSampleLayer {
    fn ingest(&mut self, node: &GraphNode, cx: &IngestContext) -> Result<(), ConvertError> {
        match cx.format {
            ModelFormat::Keras => {
                self.scale_factor = first_int(node, "size").map(|s| s as f32);
                self.interpolation =
                    Some(node.attrs.str("interpolation").unwrap_or("nearest").to_owned());
            }
            // Set while reclassifying the resize.
            ModelFormat::Onnx => {
                self.scale_factor = node.attrs.float("scaleFactor");
                self.interpolation = node.attrs.str("interpolation").map(str::to_owned);
            }
        }
        Ok(())
    }

    fn emit(&self, node: &GraphNode) -> IrRecord {
        let mut record = base_record(node, "UpSampling2D");
        record.set_opt("interpolation", self.interpolation.as_deref());
        record.set_opt("scaleFactor", self.scale_factor.map(json_f32));
        record
    }
}

#[test]
fn keras_size() {
    use crate::{attr::AttrValue, custom::CustomObjects, shape::NoShapes};

    let custom = CustomObjects::new();
    let cx = IngestContext {
        format: ModelFormat::Keras,
        shapes: &NoShapes,
        custom: &custom,
    };
    let node =
        GraphNode::new("up", "UpSampling2D").with_attr("size", AttrValue::Ints(vec![2, 2]));
    let mut layer = UpSampleLayer::default();
    layer.ingest(&node, &cx).unwrap();
    let record = layer.emit(&node);
    assert_eq!(record.fields["scaleFactor"], 2.0);
    assert_eq!(record.fields["interpolation"], "nearest");
}
