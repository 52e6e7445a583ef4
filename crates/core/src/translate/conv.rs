use serde_json::Value as Json;

use crate::{
    config::ModelFormat,
    ir::{py_bool, IrRecord, KernelWeights},
    node::GraphNode,
    translate::{base_record, emit_fused, first_int, missing, IngestContext, Layer},
    weights::{to_deployment_order, KernelLayout},
    ConvertError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvKind {
    Standard,
    Depthwise,
    Transposed,
}

impl ConvKind {
    fn ir_type(self) -> &'static str {
        match self {
            ConvKind::Standard => "Conv2D",
            ConvKind::Depthwise => "DepthwiseConv2D",
            ConvKind::Transposed => "Conv2DTranspose",
        }
    }

    fn keras_layout(self) -> KernelLayout {
        match self {
            ConvKind::Transposed => KernelLayout::KerasTransposedConv,
            _ => KernelLayout::KerasConv,
        }
    }
}

pub struct ConvLayer {
    kind: ConvKind,
    weights: Option<KernelWeights>,
    kernel_size: Option<i64>,
    strides: Option<i64>,
    padding: Option<Json>,
    group: Option<i64>,
    depth_multiplier: Option<i64>,
    activation: Option<String>,
    output_planes: Option<u32>,
}

impl ConvLayer {
    pub fn new(kind: ConvKind) -> Self {
        Self {
            kind,
            weights: None,
            kernel_size: None,
            strides: None,
            padding: None,
            group: None,
            depth_multiplier: None,
            activation: None,
            output_planes: None,
        }
    }

    fn ingest_keras(&mut self, node: &GraphNode) -> Result<(), ConvertError> {
        let kernel = match self.kind {
            ConvKind::Depthwise => node.weights.get("depthwise_kernel"),
            _ => None,
        }
        .or_else(|| node.weights.get("kernel"))
        .ok_or_else(|| missing(node, "kernel"))?;
        let flat = to_deployment_order(kernel, self.kind.keras_layout())
            .map_err(|e| ConvertError::invalid_layer(&node.name, e.to_string()))?;
        let bias = node.weights.get("bias").map(|b| b.data().to_vec());

        self.kernel_size = first_int(node, "kernel_size");
        self.strides = first_int(node, "strides");
        self.padding = node.attrs.str("padding").map(Json::from);
        self.activation = node.attrs.str("activation").map(str::to_owned);
        self.output_planes = match self.kind {
            // (kh, kw, in, multiplier)
            ConvKind::Depthwise => {
                self.depth_multiplier = node.attrs.int("depth_multiplier");
                kernel.dims().get(2..4).map(|d| (d[0] * d[1]) as u32)
            }
            _ => node.attrs.int("filters").map(|f| f as u32),
        };
        self.weights = Some(KernelWeights { kernel: flat, bias });
        Ok(())
    }

    fn ingest_onnx(&mut self, node: &GraphNode) -> Result<(), ConvertError> {
        let kernel = node.operand_weight(1).ok_or_else(|| missing(node, "kernel"))?;
        let dims = kernel.dims();
        if dims.len() != 4 {
            return Err(ConvertError::invalid_layer(
                &node.name,
                format!("kernel of shape {dims:?} is not 4-D"),
            ));
        }
        let bias = node.operand_weight(2).map(|b| b.data().to_vec());

        self.kernel_size = first_int(node, "kernel_shape").or(Some(dims[2] as i64));
        self.strides = first_int(node, "strides").or(Some(1));
        self.padding = match first_int(node, "pads") {
            Some(p) => Some(Json::from(p)),
            None => match node.attrs.str("auto_pad") {
                Some("SAME_UPPER" | "SAME_LOWER") => Some(Json::from("same")),
                Some("VALID") => Some(Json::from("valid")),
                _ => Some(Json::from(0)),
            },
        };
        let group = node.attrs.int("group").unwrap_or(1);
        self.group = Some(group);
        self.output_planes = Some(match self.kind {
            // (in, out / group, kh, kw)
            ConvKind::Transposed => (dims[1] as i64 * group) as u32,
            _ => dims[0] as u32,
        });
        if self.kind == ConvKind::Depthwise {
            let groups = node.attrs.int("group_count").unwrap_or(1).max(1);
            self.depth_multiplier = Some(dims[0] as i64 / groups);
        }
        self.weights = Some(KernelWeights {
            kernel: kernel.data().to_vec(),
            bias,
        });
        Ok(())
    }
}

impl Layer for ConvLayer {
    fn ingest(&mut self, node: &GraphNode, cx: &IngestContext) -> Result<(), ConvertError> {
        match cx.format {
            ModelFormat::Keras => self.ingest_keras(node),
            ModelFormat::Onnx => self.ingest_onnx(node),
        }
    }

    fn emit(&self, node: &GraphNode) -> IrRecord {
        let mut record =
            base_record(node, self.kind.ir_type()).with_output_planes(self.output_planes);
        record.set_opt("kernel_size", self.kernel_size);
        record.set_opt("strides", self.strides);
        record.set_opt("padding", self.padding.clone());
        record.set_opt("group", self.group);
        record.set_opt("depth_multiplier", self.depth_multiplier);
        let use_bias = self
            .weights
            .as_ref()
            .map_or(false, |w| w.bias.is_some());
        record.set("useBias", py_bool(use_bias));
        emit_fused(&mut record, node, self.activation.as_deref());
        record.weights = self.weights.clone();
        record
    }
}

#[test]
fn keras_transposed_conv() {
    use crate::{attr::AttrValue, custom::CustomObjects, shape::NoShapes, tensor::Tensor};

    let custom = CustomObjects::new();
    let cx = IngestContext {
        format: ModelFormat::Keras,
        shapes: &NoShapes,
        custom: &custom,
    };
    // (kh, kw, out, in) = (1, 1, 2, 3)
    let node = GraphNode::new("up", "Conv2DTranspose")
        .with_attr("filters", AttrValue::Int(2))
        .with_attr("kernel_size", AttrValue::Ints(vec![1, 1]))
        .with_attr("strides", AttrValue::Ints(vec![2, 2]))
        .with_weight(
            "kernel",
            Tensor::new(vec![1, 1, 2, 3], (0..6).map(|x| x as f32).collect()),
        );
    let mut layer = ConvLayer::new(ConvKind::Transposed);
    layer.ingest(&node, &cx).unwrap();
    let record = layer.emit(&node);

    assert_eq!(record.ty, "Conv2DTranspose");
    assert_eq!(record.output_planes, Some(2));
    assert_eq!(record.fields["strides"], 2);
    assert_eq!(record.fields["useBias"], "False");
    assert_eq!(record.weights.unwrap().kernel, vec![0., 1., 2., 3., 4., 5.]);
}
