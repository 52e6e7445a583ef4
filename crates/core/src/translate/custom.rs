use serde_json::{Map, Value as Json};

use crate::{
    custom::CustomLayerDef,
    ir::IrRecord,
    node::GraphNode,
    translate::{base_record, IngestContext, Layer},
    ConvertError,
};

const CALCULATE_PLANES: u32 = 3;

/// The engine's built-in `Calculate` layer: three planes out, nothing else to read.
#[derive(Default)]
pub struct CalculateLayer;

impl Layer for CalculateLayer {
    fn ingest(&mut self, _node: &GraphNode, _cx: &IngestContext) -> Result<(), ConvertError> {
        Ok(())
    }

    fn emit(&self, node: &GraphNode) -> IrRecord {
        base_record(node, "Calculate").with_output_planes(CALCULATE_PLANES)
    }
}

/// A layer described by a custom-objects file.
pub struct CustomLayer {
    def: CustomLayerDef,
    fields: Map<String, Json>,
}

impl CustomLayer {
    pub fn new(def: CustomLayerDef) -> Self {
        Self {
            def,
            fields: Map::new(),
        }
    }
}

impl Layer for CustomLayer {
    fn ingest(&mut self, node: &GraphNode, cx: &IngestContext) -> Result<(), ConvertError> {
        for key in &self.def.attributes {
            match node.attrs.get(key) {
                Some(value) => {
                    self.fields.insert(key.clone(), cx.custom.resolve(value));
                }
                None => log::warn!("custom layer '{}' has no attribute '{key}'", node.name),
            }
        }
        Ok(())
    }

    fn emit(&self, node: &GraphNode) -> IrRecord {
        let mut record = base_record(node, self.def.ir_type()).with_output_planes(self.def.output_planes);
        for (key, value) in &self.fields {
            record.set(key, value.clone());
        }
        record
    }
}

#[test]
fn attributes_resolve_constants() {
    use crate::{attr::AttrValue, config::ModelFormat, custom::CustomObjects, shape::NoShapes};

    let mut custom = CustomObjects::new();
    custom.add_constant("scale_x", Json::from(2));
    let def = CustomLayerDef {
        layer_type: "SubPixel".into(),
        ir_type: Some("PixelShuffle".into()),
        output_planes: Some(3),
        attributes: vec!["upscale".into(), "mode".into()],
    };
    let cx = IngestContext {
        format: ModelFormat::Keras,
        shapes: &NoShapes,
        custom: &custom,
    };
    let node = GraphNode::new("sp", "SubPixel")
        .with_attr("upscale", AttrValue::Str("scale_x".into()))
        .with_attr("mode", AttrValue::Str("dcr".into()));
    let mut layer = CustomLayer::new(def);
    layer.ingest(&node, &cx).unwrap();
    let record = layer.emit(&node);
    assert_eq!(record.ty, "PixelShuffle");
    assert_eq!(record.output_planes, Some(3));
    assert_eq!(record.fields["upscale"], 2);
    assert_eq!(record.fields["mode"], "dcr");
}
