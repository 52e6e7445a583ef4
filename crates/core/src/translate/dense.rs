use crate::{
    config::ModelFormat,
    ir::{json_f32, py_bool, IrRecord, KernelWeights},
    node::GraphNode,
    translate::{base_record, emit_fused, missing, IngestContext, Layer},
    weights::{to_deployment_order, KernelLayout},
    ConvertError,
};

/// Keras `Dense` and ONNX `Gemm`.
#[derive(Default)]
pub struct DenseLayer {
    gemm: bool,
    weights: Option<KernelWeights>,
    units: Option<u32>,
    activation: Option<String>,
    alpha: Option<f32>,
    beta: Option<f32>,
    trans_b: Option<i64>,
}

impl DenseLayer {
    fn ingest_keras(&mut self, node: &GraphNode) -> Result<(), ConvertError> {
        let kernel = node.weights.get("kernel").ok_or_else(|| missing(node, "kernel"))?;
        let flat = to_deployment_order(kernel, KernelLayout::KerasDense)
            .map_err(|e| ConvertError::invalid_layer(&node.name, e.to_string()))?;
        self.units = node
            .attrs
            .int("units")
            .map(|u| u as u32)
            .or_else(|| kernel.dims().last().map(|&d| d as u32));
        self.activation = node.attrs.str("activation").map(str::to_owned);
        self.weights = Some(KernelWeights {
            kernel: flat,
            bias: node.weights.get("bias").map(|b| b.data().to_vec()),
        });
        Ok(())
    }

    fn ingest_onnx(&mut self, node: &GraphNode) -> Result<(), ConvertError> {
        self.gemm = true;
        let kernel = node.operand_weight(1).ok_or_else(|| missing(node, "kernel"))?;
        let dims = kernel.dims();
        if dims.len() != 2 {
            return Err(ConvertError::invalid_layer(
                &node.name,
                format!("kernel of shape {dims:?} is not 2-D"),
            ));
        }
        let trans_b = node.attrs.int("transB").unwrap_or(0);
        let units = if trans_b == 1 { dims[0] } else { dims[1] };
        self.units = Some(units as u32);
        self.alpha = node.attrs.float("alpha");
        self.beta = node.attrs.float("beta");
        self.trans_b = Some(trans_b);
        self.weights = Some(KernelWeights {
            kernel: kernel.data().to_vec(),
            bias: node.operand_weight(2).map(|b| b.data().to_vec()),
        });
        Ok(())
    }
}

impl Layer for DenseLayer {
    fn ingest(&mut self, node: &GraphNode, cx: &IngestContext) -> Result<(), ConvertError> {
        match cx.format {
            ModelFormat::Keras => self.ingest_keras(node),
            ModelFormat::Onnx => self.ingest_onnx(node),
        }
    }

    fn emit(&self, node: &GraphNode) -> IrRecord {
        let ty = if self.gemm { "Gemm" } else { "Dense" };
        let mut record = base_record(node, ty).with_output_planes(self.units);
        record.set_opt("units", self.units);
        if self.gemm {
            record.set_opt("alpha", self.alpha.map(json_f32));
            record.set_opt("beta", self.beta.map(json_f32));
            record.set_opt("transB", self.trans_b);
        }
        let use_bias = self.weights.as_ref().map_or(false, |w| w.bias.is_some());
        record.set("useBias", py_bool(use_bias));
        emit_fused(&mut record, node, self.activation.as_deref());
        record.weights = self.weights.clone();
        record
    }
}

#[test]
fn gemm_planes_follow_trans_b() {
    use crate::{attr::AttrValue, custom::CustomObjects, shape::NoShapes, tensor::Tensor};

    let custom = CustomObjects::new();
    let cx = IngestContext {
        format: ModelFormat::Onnx,
        shapes: &NoShapes,
        custom: &custom,
    };
    let node = GraphNode::new("fc", "Gemm")
        .with_in("x")
        .with_attr("operands", AttrValue::Strs(vec!["x".into(), "w".into()]))
        .with_attr("transB", AttrValue::Int(1))
        .with_weight("w", Tensor::new(vec![10, 4], vec![0.0; 40]));
    let mut layer = DenseLayer::default();
    layer.ingest(&node, &cx).unwrap();
    let record = layer.emit(&node);
    assert_eq!(record.ty, "Gemm");
    assert_eq!(record.output_planes, Some(10));
    assert_eq!(record.fields["useBias"], "False");
}

#[test]
fn keras_dense_is_transposed() {
    use crate::{custom::CustomObjects, shape::NoShapes, tensor::Tensor};

    let custom = CustomObjects::new();
    let cx = IngestContext {
        format: ModelFormat::Keras,
        shapes: &NoShapes,
        custom: &custom,
    };
    // (in = 3, units = 2)
    let node = GraphNode::new("d", "Dense")
        .with_weight("kernel", Tensor::new(vec![3, 2], vec![1., 2., 3., 4., 5., 6.]))
        .with_weight("bias", Tensor::from_vec(vec![0.5, 0.5]));
    let mut layer = DenseLayer::default();
    layer.ingest(&node, &cx).unwrap();
    let record = layer.emit(&node);
    assert_eq!(record.output_planes, Some(2));
    let weights = record.weights.unwrap();
    assert_eq!(weights.kernel, vec![1., 3., 5., 2., 4., 6.]);
    assert_eq!(record.fields["useBias"], "True");
}
