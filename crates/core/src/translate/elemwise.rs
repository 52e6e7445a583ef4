use crate::{
    config::ModelFormat,
    ir::{json_f32, IrRecord, PlaneRule},
    node::GraphNode,
    translate::{base_record, IngestContext, Layer},
    ConvertError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Elementwise {
    Add,
    Multiply,
    Concatenate,
}

pub struct ElementwiseLayer {
    op: Elementwise,
    axis: Option<i64>,
}

impl ElementwiseLayer {
    pub fn new(op: Elementwise) -> Self {
        Self { op, axis: None }
    }
}

impl Layer for ElementwiseLayer {
    fn ingest(&mut self, node: &GraphNode, cx: &IngestContext) -> Result<(), ConvertError> {
        if self.op == Elementwise::Concatenate {
            self.axis = match cx.format {
                ModelFormat::Keras => Some(node.attrs.int("axis").unwrap_or(-1)),
                ModelFormat::Onnx => node.attrs.int("axis"),
            };
        }
        Ok(())
    }

    fn emit(&self, node: &GraphNode) -> IrRecord {
        match self.op {
            Elementwise::Concatenate => {
                let mut record = base_record(node, "Concatenate");
                record.set_opt("axis", self.axis);
                record
            }
            Elementwise::Add | Elementwise::Multiply => {
                let ty = if self.op == Elementwise::Add {
                    "Add"
                } else {
                    "Multiply"
                };
                let mut record = base_record(node, ty).with_plane_rule(PlaneRule::First);
                if let Some(act) = &node.fused.activation {
                    record.set("activation", act.name.as_str());
                    record.set_opt("alpha", act.alpha.map(json_f32));
                    record.set("act_name", act.source.as_str());
                }
                record
            }
        }
    }
}

#[test]
fn add_carries_fused_activation() {
    use crate::{custom::CustomObjects, node::FusedActivation, shape::NoShapes};

    let custom = CustomObjects::new();
    let cx = IngestContext {
        format: ModelFormat::Onnx,
        shapes: &NoShapes,
        custom: &custom,
    };
    let mut node = GraphNode::new("add", "Add").with_ins(["a", "b"]);
    node.fused.activation = Some(FusedActivation {
        name: "relu".into(),
        alpha: None,
        source: "relu_1".into(),
    });
    let mut layer = ElementwiseLayer::new(Elementwise::Add);
    layer.ingest(&node, &cx).unwrap();
    let record = layer.emit(&node);
    assert_eq!(record.plane_rule, PlaneRule::First);
    assert_eq!(record.fields["activation"], "relu");
    assert_eq!(record.fields["act_name"], "relu_1");

    let mut concat = ElementwiseLayer::new(Elementwise::Concatenate);
    let cx = IngestContext {
        format: ModelFormat::Keras,
        ..cx
    };
    concat.ingest(&GraphNode::new("cat", "Concatenate"), &cx).unwrap();
    let record = concat.emit(&GraphNode::new("cat", "Concatenate"));
    assert_eq!(record.plane_rule, PlaneRule::Sum);
    assert_eq!(record.fields["axis"], -1);
}
