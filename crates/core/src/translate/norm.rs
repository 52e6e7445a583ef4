use crate::{
    config::ModelFormat,
    ir::{json_f32, IrRecord},
    node::{FusedBatchNorm, GraphNode},
    translate::{base_record, IngestContext, Layer},
    weights::BatchNormWeights,
    ConvertError,
};

const KERAS_PARAMS: [&str; 4] = ["gamma", "beta", "moving_mean", "moving_variance"];

/// Batch-norm parameters of `node`. Keras keeps them by variable name, ONNX as operands 1 to 4
/// (scale, bias, mean, variance).
pub fn fused_batch_norm(node: &GraphNode, format: ModelFormat) -> Result<FusedBatchNorm, ConvertError> {
    let part = |i: usize| {
        let tensor = match format {
            ModelFormat::Keras => node.weights.get(KERAS_PARAMS[i]),
            ModelFormat::Onnx => node.operand_weight(i + 1),
        };
        tensor.map(|t| t.data().to_vec())
    };
    let params = BatchNormWeights {
        gamma: part(0),
        beta: part(1),
        moving_mean: part(2),
        moving_variance: part(3),
    };
    if params.moving_mean.is_none() || params.moving_variance.is_none() {
        return Err(ConvertError::invalid_layer(
            &node.name,
            "moving statistics are missing",
        ));
    }
    Ok(FusedBatchNorm {
        params,
        epsilon: node.attrs.float("epsilon"),
        source: node.name.clone(),
    })
}

/// A batch-normalization with no convolution to fold into.
#[derive(Default)]
pub struct BatchNormLayer {
    bn: Option<FusedBatchNorm>,
}

impl Layer for BatchNormLayer {
    fn ingest(&mut self, node: &GraphNode, cx: &IngestContext) -> Result<(), ConvertError> {
        self.bn = Some(fused_batch_norm(node, cx.format)?);
        Ok(())
    }

    fn emit(&self, node: &GraphNode) -> IrRecord {
        let mut record = base_record(node, "BatchNormalization");
        if let Some(bn) = &self.bn {
            record.set_opt("epsilon", bn.epsilon.map(json_f32));
            record.batch_norm = Some(bn.params.clone());
        }
        record
    }
}

#[test]
fn onnx_operands() {
    use crate::{attr::AttrValue, tensor::Tensor};

    let node = GraphNode::new("bn", "BatchNormalization")
        .with_attr(
            "operands",
            AttrValue::Strs(["x", "s", "b", "m", "v"].map(String::from).to_vec()),
        )
        .with_weight("s", Tensor::from_vec(vec![1.0]))
        .with_weight("b", Tensor::from_vec(vec![2.0]))
        .with_weight("m", Tensor::from_vec(vec![3.0]))
        .with_weight("v", Tensor::from_vec(vec![4.0]));
    let bn = fused_batch_norm(&node, ModelFormat::Onnx).unwrap();
    let parts: Vec<_> = bn.params.parts().map(|(_, p)| p[0]).collect();
    assert_eq!(parts, vec![1.0, 2.0, 3.0, 4.0]);

    let bare = GraphNode::new("bn", "BatchNormalization");
    assert!(fused_batch_norm(&bare, ModelFormat::Keras).is_err());
}
