use serde_json::Value as Json;

use crate::{
    config::ModelFormat,
    ir::IrRecord,
    node::GraphNode,
    translate::{base_record, first_int, IngestContext, Layer, PoolKind},
    ConvertError,
};

pub struct PoolLayer {
    kind: PoolKind,
    pool_size: Option<Vec<i64>>,
    strides: Option<Vec<i64>>,
    padding: Option<Json>,
}

impl PoolLayer {
    pub fn new(kind: PoolKind) -> Self {
        Self {
            kind,
            pool_size: None,
            strides: None,
            padding: None,
        }
    }

    /// Global pooling spans the whole input; its window is the input's spatial height.
    fn derive_global(&mut self, node: &GraphNode, cx: &IngestContext) {
        let height_axis = match cx.format {
            ModelFormat::Onnx => 2, // NCHW
            ModelFormat::Keras => 1, // NHWC
        };
        let dims = node
            .inbound()
            .first()
            .and_then(|input| cx.shapes.shape_of(input));
        match dims {
            Some(dims) if dims.len() > 3 && dims[height_axis] > 0 => {
                let d = dims[height_axis];
                self.pool_size = Some(vec![d, d]);
                self.strides = Some(vec![1, 1]);
                self.padding = Some(Json::from("valid"));
            }
            _ => log::warn!("no input shape for global pooling '{}'", node.name),
        }
    }
}

impl Layer for PoolLayer {
    fn ingest(&mut self, node: &GraphNode, cx: &IngestContext) -> Result<(), ConvertError> {
        match cx.format {
            ModelFormat::Keras => {
                self.pool_size = node.attrs.ints("pool_size");
                self.strides = node.attrs.ints("strides").or_else(|| self.pool_size.clone());
                self.padding = node.attrs.str("padding").map(Json::from);
            }
            ModelFormat::Onnx => {
                self.pool_size = node.attrs.ints("kernel_shape");
                self.strides = node.attrs.ints("strides").or(Some(vec![1, 1]));
                self.padding = Some(match first_int(node, "pads") {
                    Some(p) => Json::from(p),
                    None => match node.attrs.str("auto_pad") {
                        Some("SAME_UPPER" | "SAME_LOWER") => Json::from("same"),
                        _ => Json::from("valid"),
                    },
                });
            }
        }
        if self.pool_size.is_none() || node.attrs.bool("global") == Some(true) {
            self.derive_global(node, cx);
        }
        Ok(())
    }

    fn emit(&self, node: &GraphNode) -> IrRecord {
        let ty = match self.kind {
            PoolKind::Average => "AveragePooling2D",
            PoolKind::Max => "MaxPooling2D",
        };
        let mut record = base_record(node, ty);
        record.set_opt("pool_size", self.pool_size.clone());
        record.set_opt("strides", self.strides.clone());
        record.set_opt("padding", self.padding.clone());
        record
    }
}

#[test]
fn global_pool_size_from_shape() {
    use crate::{attr::AttrValue, custom::CustomObjects, shape::ShapeMap};

    let mut shapes = ShapeMap::new();
    shapes.insert("conv", vec![1, 64, 7, 7]);
    let custom = CustomObjects::new();
    let cx = IngestContext {
        format: ModelFormat::Onnx,
        shapes: &shapes,
        custom: &custom,
    };
    let node = GraphNode::new("gap", "AveragePool")
        .with_in("conv")
        .with_attr("global", AttrValue::Bool(true));
    let mut layer = PoolLayer::new(PoolKind::Average);
    layer.ingest(&node, &cx).unwrap();
    let record = layer.emit(&node);
    assert_eq!(record.ty, "AveragePooling2D");
    assert_eq!(record.fields["pool_size"], serde_json::json!([7, 7]));
    assert_eq!(record.fields["strides"], serde_json::json!([1, 1]));
    assert_eq!(record.fields["padding"], "valid");
}

#[test]
fn keras_strides_default_to_pool_size() {
    use crate::{attr::AttrValue, custom::CustomObjects, shape::NoShapes};

    let custom = CustomObjects::new();
    let cx = IngestContext {
        format: ModelFormat::Keras,
        shapes: &NoShapes,
        custom: &custom,
    };
    let node = GraphNode::new("mp", "MaxPooling2D")
        .with_attr("pool_size", AttrValue::Ints(vec![2, 2]))
        .with_attr("padding", AttrValue::Str("same".into()));
    let mut layer = PoolLayer::new(PoolKind::Max);
    layer.ingest(&node, &cx).unwrap();
    let record = layer.emit(&node);
    assert_eq!(record.ty, "MaxPooling2D");
    assert_eq!(record.fields["strides"], serde_json::json!([2, 2]));
}
