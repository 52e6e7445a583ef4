use std::time::Instant;

use crate::{
    attr::AttrValue,
    config::ModelFormat,
    custom::{CustomLayerDef, CustomObjects},
    graph::Graph,
    ir::{json_f32, py_bool, IrRecord},
    node::{Absorb, GraphNode},
    shape::ShapeOracle,
    ConvertError,
};

pub mod activation;
pub mod conv;
pub mod custom;
pub mod dense;
pub mod elemwise;
pub mod input;
pub mod norm;
pub mod pad;
pub mod pool;
pub mod reshape;
pub mod upsample;

/// What a layer needs besides its own node.
pub struct IngestContext<'a> {
    pub format: ModelFormat,
    pub shapes: &'a dyn ShapeOracle,
    pub custom: &'a CustomObjects,
}

/// One layer family. `ingest` reads the node once fusion has settled on it; `emit` runs after the
/// whole graph is fused, so it sees everything the node absorbed.
pub trait Layer {
    fn ingest(&mut self, node: &GraphNode, cx: &IngestContext) -> Result<(), ConvertError>;
    fn emit(&self, node: &GraphNode) -> IrRecord;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Average,
    Max,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LayerKind {
    Input,
    Conv2d,
    DepthwiseConv,
    TransposedConv,
    Dense,
    Gemm,
    Pooling(PoolKind),
    BatchNorm,
    Activation,
    Add,
    Multiply,
    Concatenate,
    Flatten,
    Reshape,
    Pad,
    UpSample,
    ZeroPad,
    Calculate,
    Custom(CustomLayerDef),
    Sequential,
    Dropout,
}

impl LayerKind {
    /// Maps an op type to its layer family. Custom definitions are consulted only for op types
    /// without a built-in family.
    pub fn resolve(
        format: ModelFormat,
        op_type: &str,
        custom: &CustomObjects,
    ) -> Result<Self, ConvertError> {
        use LayerKind::*;
        let kind = match (format, op_type) {
            (ModelFormat::Keras, "InputLayer") | (ModelFormat::Onnx, "Input") => Input,
            (ModelFormat::Keras, "Conv2D") | (ModelFormat::Onnx, "Conv") => Conv2d,
            (_, "DepthwiseConv2D") => DepthwiseConv,
            (ModelFormat::Keras, "Conv2DTranspose") | (ModelFormat::Onnx, "ConvTranspose") => {
                TransposedConv
            }
            (ModelFormat::Keras, "Dense") => Dense,
            (ModelFormat::Onnx, "Gemm") => Gemm,
            (ModelFormat::Keras, "AveragePooling2D") | (ModelFormat::Onnx, "AveragePool") => {
                Pooling(PoolKind::Average)
            }
            (ModelFormat::Keras, "MaxPooling2D" | "MaxPool2D") | (ModelFormat::Onnx, "MaxPool") => {
                Pooling(PoolKind::Max)
            }
            (_, "BatchNormalization") => BatchNorm,
            (ModelFormat::Keras, "Activation" | "ReLU" | "LeakyReLU")
            | (
                ModelFormat::Onnx,
                "Relu" | "Clip" | "LeakyRelu" | "Sigmoid" | "Tanh" | "Swish",
            ) => Activation,
            (_, "Add") => Add,
            (ModelFormat::Keras, "Multiply") | (ModelFormat::Onnx, "Mul") => Multiply,
            (ModelFormat::Keras, "Concatenate") | (ModelFormat::Onnx, "Concat") => Concatenate,
            (_, "Flatten") => Flatten,
            (_, "Reshape") => Reshape,
            (ModelFormat::Onnx, "Pad") => Pad,
            (_, "UpSampling2D") => UpSample,
            (ModelFormat::Keras, "ZeroPadding2D") => ZeroPad,
            (ModelFormat::Keras, "Calculate") => Calculate,
            (ModelFormat::Keras, "Sequential" | "Functional" | "Model") => Sequential,
            (_, "Dropout") => Dropout,
            _ => match custom.layer(op_type) {
                Some(def) => Custom(def.clone()),
                None => return Err(ConvertError::UnsupportedLayer(op_type.to_owned())),
            },
        };
        Ok(kind)
    }

    /// Data this node contributes when merged into a predecessor.
    pub fn absorb(&self, node: &GraphNode, format: ModelFormat) -> Result<Option<Absorb>, ConvertError> {
        Ok(match self {
            LayerKind::Activation => Some(Absorb::Activation(activation::fused_activation(
                node, format,
            ))),
            LayerKind::BatchNorm => Some(Absorb::BatchNorm(norm::fused_batch_norm(node, format)?)),
            _ => None,
        })
    }

    pub fn build(&self) -> Result<Box<dyn Layer>, ConvertError> {
        use LayerKind::*;
        let layer: Box<dyn Layer> = match self {
            Input => Box::<input::InputLayer>::default(),
            Conv2d => Box::new(conv::ConvLayer::new(conv::ConvKind::Standard)),
            DepthwiseConv => Box::new(conv::ConvLayer::new(conv::ConvKind::Depthwise)),
            TransposedConv => Box::new(conv::ConvLayer::new(conv::ConvKind::Transposed)),
            Dense | Gemm => Box::<dense::DenseLayer>::default(),
            Pooling(kind) => Box::new(pool::PoolLayer::new(*kind)),
            BatchNorm => Box::<norm::BatchNormLayer>::default(),
            Activation => Box::<activation::ActivationLayer>::default(),
            Add => Box::new(elemwise::ElementwiseLayer::new(elemwise::Elementwise::Add)),
            Multiply => Box::new(elemwise::ElementwiseLayer::new(
                elemwise::Elementwise::Multiply,
            )),
            Concatenate => Box::new(elemwise::ElementwiseLayer::new(
                elemwise::Elementwise::Concatenate,
            )),
            Flatten => Box::new(reshape::ReshapeLayer::flatten()),
            Reshape => Box::new(reshape::ReshapeLayer::reshape()),
            Pad => Box::<pad::PadLayer>::default(),
            ZeroPad => Box::<pad::ZeroPadLayer>::default(),
            UpSample => Box::<upsample::UpSampleLayer>::default(),
            Calculate => Box::<custom::CalculateLayer>::default(),
            Custom(def) => Box::new(custom::CustomLayer::new(def.clone())),
            Sequential | Dropout => {
                return Err(ConvertError::InvalidGraph(
                    format!("{self:?} layers cannot be translated").into(),
                ))
            }
        };
        Ok(layer)
    }
}

/// Rewrites op types whose family depends on their attributes or weights: grouped convolutions
/// become depthwise, uniform resizes become upsampling and global average pooling becomes plain
/// average pooling. A resize that does not qualify keeps its op type and stays unsupported.
pub fn reclassify(graph: &mut Graph, format: ModelFormat) -> usize {
    let start = Instant::now();
    let mut count = 0;

    for id in graph.live_ids() {
        let node = &mut graph.nodes[id];
        let op_type = node.op_type.clone();
        let changed = match (format, op_type.as_str()) {
            (ModelFormat::Onnx, "Conv") => {
                let group = node.attrs.int("group").unwrap_or(1);
                if group > 1 {
                    node.op_type = "DepthwiseConv2D".to_owned();
                    node.attrs.set("group", AttrValue::Int(1));
                    node.attrs.set("group_count", AttrValue::Int(group));
                }
                group > 1
            }
            (ModelFormat::Onnx, "Resize" | "Upsample") => match resize_scales(node) {
                Some(scales) => match upsample_factor(&scales) {
                    Some(factor) => {
                        let mode = node.attrs.str("mode").unwrap_or("nearest").to_owned();
                        node.op_type = "UpSampling2D".to_owned();
                        node.attrs.set("scaleFactor", AttrValue::Float(factor));
                        node.attrs.set("interpolation", AttrValue::Str(mode));
                        true
                    }
                    None => {
                        log::debug!("{} scales {scales:?} are not uniform", node.name);
                        false
                    }
                },
                None => false,
            },
            (ModelFormat::Onnx, "GlobalAveragePool") => {
                node.op_type = "AveragePool".to_owned();
                node.attrs.set("global", AttrValue::Bool(true));
                true
            }
            (ModelFormat::Keras, "GlobalAveragePooling2D") => {
                node.op_type = "AveragePooling2D".to_owned();
                node.attrs.set("global", AttrValue::Bool(true));
                true
            }
            _ => false,
        };
        if changed {
            log::debug!("reclassified {} as {}", node.name, node.op_type);
            count += 1;
        }
    }

    log::info!("reclassify({count}): {:?}", start.elapsed());
    count
}

fn resize_scales(node: &GraphNode) -> Option<Vec<f32>> {
    if let Some(AttrValue::Floats(xs)) = node.attrs.get("scales") {
        return Some(xs.clone());
    }
    let operands = node.operands();
    let idx = match (node.op_type.as_str(), operands.len()) {
        ("Upsample", _) | ("Resize", 2) => 1,
        _ => 2,
    };
    node.operand_weight(idx)
        .filter(|t| !t.is_empty())
        .map(|t| t.data().to_vec())
}

/// The common factor of `scales` if every factor is at least 1 and all factors above 1 agree.
pub fn upsample_factor(scales: &[f32]) -> Option<f32> {
    let mut factor = 1.0;
    for &s in scales {
        if s < 1.0 || (factor != 1.0 && s > 1.0 && s != factor) {
            return None;
        }
        if s > 1.0 {
            factor = s;
        }
    }
    Some(factor)
}

pub(crate) fn base_record(node: &GraphNode, ty: &str) -> IrRecord {
    IrRecord::new(&node.name, ty).with_inbounds(node.inbound().iter().cloned())
}

/// Writes what `node` absorbed from its successors onto `record`.
pub(crate) fn emit_fused(record: &mut IrRecord, node: &GraphNode, own_activation: Option<&str>) {
    let bn = node.fused.batch_norm.as_ref();
    record.set("useBatchNormalization", py_bool(bn.is_some()));
    if let Some(bn) = bn {
        record.set("bn_name", bn.source.as_str());
        record.batch_norm = Some(bn.params.clone());
    }
    match &node.fused.activation {
        Some(act) => {
            record.set("act_name", act.source.as_str());
            record.set("activation", act.name.as_str());
            record.set_opt("alpha", act.alpha.map(json_f32));
        }
        None => record.set_opt("activation", own_activation),
    }
}

pub(crate) fn first_int(node: &GraphNode, key: &str) -> Option<i64> {
    node.attrs.ints(key).and_then(|xs| xs.first().copied())
}

pub(crate) fn missing(node: &GraphNode, what: &str) -> ConvertError {
    ConvertError::invalid_layer(&node.name, format!("{what} is missing"))
}

#[test]
fn upsample_factors() {
    assert_eq!(upsample_factor(&[1.0, 1.0, 2.0, 2.0]), Some(2.0));
    assert_eq!(upsample_factor(&[1.0, 1.0, 1.0, 1.0]), Some(1.0));
    assert_eq!(upsample_factor(&[1.0, 1.0, 2.0, 3.0]), None);
    assert_eq!(upsample_factor(&[1.0, 1.0, 0.5, 0.5]), None);
}

#[test]
fn unknown_op_is_unsupported() {
    let custom = CustomObjects::new();
    match LayerKind::resolve(ModelFormat::Onnx, "Resize", &custom) {
        Err(ConvertError::UnsupportedLayer(op)) => assert_eq!(op, "Resize"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(LayerKind::resolve(ModelFormat::Keras, "Conv", &custom).is_err());
    assert!(LayerKind::resolve(ModelFormat::Onnx, "Upsample", &custom).is_err());
    assert_eq!(
        LayerKind::resolve(ModelFormat::Onnx, "Mul", &custom).unwrap(),
        LayerKind::Multiply
    );
}

#[test]
fn custom_never_shadows_builtin() {
    let mut custom = CustomObjects::new();
    custom.add_layer(CustomLayerDef {
        layer_type: "Add".into(),
        ir_type: Some("MyAdd".into()),
        output_planes: None,
        attributes: vec![],
    });
    custom.add_layer(CustomLayerDef {
        layer_type: "SubPixel".into(),
        ir_type: None,
        output_planes: Some(3),
        attributes: vec![],
    });
    assert_eq!(
        LayerKind::resolve(ModelFormat::Keras, "Add", &custom).unwrap(),
        LayerKind::Add
    );
    assert!(matches!(
        LayerKind::resolve(ModelFormat::Keras, "SubPixel", &custom).unwrap(),
        LayerKind::Custom(_)
    ));
}

#[test]
fn grouped_conv_becomes_depthwise() {
    use crate::tensor::Tensor;

    let mut graph = Graph::from_nodes([
        GraphNode::new("x", "Input").with_ins(Vec::<String>::new()),
        GraphNode::new("dw", "Conv")
            .with_in("x")
            .with_attr("group", AttrValue::Int(8)),
        GraphNode::new("rs", "Resize")
            .with_in("dw")
            .with_attr(
                "operands",
                AttrValue::Strs(vec!["dw".into(), "".into(), "scales".into()]),
            )
            .with_attr("mode", AttrValue::Str("linear".into()))
            .with_weight("scales", Tensor::from_vec(vec![1.0, 1.0, 2.0, 2.0])),
        GraphNode::new("gap", "GlobalAveragePool").with_in("rs"),
    ]);
    assert_eq!(reclassify(&mut graph, ModelFormat::Onnx), 3);

    let dw = graph.get("dw").unwrap();
    assert_eq!(dw.op_type, "DepthwiseConv2D");
    assert_eq!(dw.attrs.int("group"), Some(1));
    let rs = graph.get("rs").unwrap();
    assert_eq!(rs.op_type, "UpSampling2D");
    assert_eq!(rs.attrs.float("scaleFactor"), Some(2.0));
    assert_eq!(rs.attrs.str("interpolation"), Some("linear"));
    assert_eq!(graph.get("gap").unwrap().op_type, "AveragePool");
}
