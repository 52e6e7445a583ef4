use ndarray::{Axis, ShapeError};
use serde::Serialize;
use thiserror::Error;

use crate::{ir::IrRecord, tensor::Tensor};

/// Native axis order of a kernel tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelLayout {
    /// Already `(out, in, kh, kw)` or otherwise deployment ordered.
    Native,
    /// `(kh, kw, in, out)`.
    KerasConv,
    /// `(kh, kw, out, in)`.
    KerasTransposedConv,
    /// `(in, out)`, or `(n,)` for a single column.
    KerasDense,
}

#[derive(Error, Debug)]
pub enum LayoutError {
    #[error("expected a rank-{expected} kernel, got shape {dims:?}")]
    Rank { expected: usize, dims: Vec<usize> },

    #[error("{0}")]
    Shape(#[from] ShapeError),
}

/// Batch-normalization parameters carried by a layer. Absent parts are simply skipped on output.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchNormWeights {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gamma: Option<Vec<f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub beta: Option<Vec<f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moving_mean: Option<Vec<f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moving_variance: Option<Vec<f32>>,
}

impl BatchNormWeights {
    /// Present parts in stream order.
    pub fn parts(&self) -> impl Iterator<Item = (&'static str, &[f32])> {
        [
            ("gamma", &self.gamma),
            ("beta", &self.beta),
            ("moving_mean", &self.moving_mean),
            ("moving_variance", &self.moving_variance),
        ]
        .into_iter()
        .filter_map(|(name, part)| part.as_deref().map(|p| (name, p)))
    }

    pub fn is_empty(&self) -> bool {
        self.parts().next().is_none()
    }
}

/// Reorders `kernel` from its native layout into deployment order and flattens it.
pub fn to_deployment_order(kernel: &Tensor, layout: KernelLayout) -> Result<Vec<f32>, LayoutError> {
    let mut array = match layout {
        KernelLayout::Native => return Ok(kernel.data().to_vec()),
        _ => kernel.to_array()?,
    };
    match layout {
        KernelLayout::Native => {}
        KernelLayout::KerasConv | KernelLayout::KerasTransposedConv => {
            if array.ndim() != 4 {
                return Err(LayoutError::Rank {
                    expected: 4,
                    dims: kernel.dims().to_vec(),
                });
            }
            array.swap_axes(0, 2);
            array.swap_axes(1, 3);
            array.swap_axes(0, 1);
            if layout == KernelLayout::KerasTransposedConv {
                array.swap_axes(0, 1);
            }
        }
        KernelLayout::KerasDense => {
            if array.ndim() == 1 {
                array = array.insert_axis(Axis(1));
            }
            if array.ndim() != 2 {
                return Err(LayoutError::Rank {
                    expected: 2,
                    dims: kernel.dims().to_vec(),
                });
            }
            array.swap_axes(0, 1);
        }
    }

    Ok(array.iter().copied().collect())
}

/// Appends `values` as little-endian `f32`.
pub fn encode_f32(values: &[f32], out: &mut Vec<u8>) {
    out.reserve(values.len() * 4);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
}

/// Serializes the weights of `records` in order: kernel, bias, then batch-norm parts.
pub fn encode_weights(records: &[IrRecord]) -> Vec<u8> {
    let mut out = Vec::new();
    for record in records {
        if let Some(weights) = &record.weights {
            encode_f32(&weights.kernel, &mut out);
            if let Some(bias) = &weights.bias {
                encode_f32(bias, &mut out);
            }
        }
        if let Some(bn) = &record.batch_norm {
            for (_, part) in bn.parts() {
                encode_f32(part, &mut out);
            }
        }
    }
    out
}

#[test]
fn keras_conv_kernel_to_oihw() {
    // (kh, kw, in, out) = (2, 2, 1, 2), element value encodes its index.
    let dims = vec![2, 2, 1, 2];
    let data: Vec<f32> = (0..8).map(|x| x as f32).collect();
    let kernel = Tensor::new(dims, data);
    let out = to_deployment_order(&kernel, KernelLayout::KerasConv).unwrap();
    // out[o][i][h][w] = in[h][w][i][o] = h*4 + w*2 + i + o
    let mut expected = vec![];
    for o in 0..2 {
        for h in 0..2 {
            for w in 0..2 {
                expected.push((h * 4 + w * 2 + o) as f32);
            }
        }
    }
    assert_eq!(out, expected);
}

#[test]
fn keras_transposed_kernel() {
    // (kh, kw, out, in) = (2, 2, 2, 3), element value encodes its index.
    let dims = vec![2, 2, 2, 3];
    let data: Vec<f32> = (0..24).map(|x| x as f32).collect();
    let kernel = Tensor::new(dims, data);
    let out = to_deployment_order(&kernel, KernelLayout::KerasTransposedConv).unwrap();
    // out[o][i][h][w] = in[h][w][o][i] = h*12 + w*6 + o*3 + i
    let mut expected = vec![];
    for o in 0..2 {
        for i in 0..3 {
            for h in 0..2 {
                for w in 0..2 {
                    expected.push((h * 12 + w * 6 + o * 3 + i) as f32);
                }
            }
        }
    }
    assert_eq!(out, expected);
    assert_ne!(out, to_deployment_order(&kernel, KernelLayout::KerasConv).unwrap());
}

#[test]
fn keras_dense_vector_is_single_column() {
    let kernel = Tensor::from_vec(vec![1.0, 2.0, 3.0]);
    let out = to_deployment_order(&kernel, KernelLayout::KerasDense).unwrap();
    assert_eq!(out, vec![1.0, 2.0, 3.0]);

    let kernel = Tensor::new(vec![2, 3], vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    let out = to_deployment_order(&kernel, KernelLayout::KerasDense).unwrap();
    assert_eq!(out, vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
}

#[test]
fn rank_mismatch_is_an_error() {
    let kernel = Tensor::new(vec![2, 2], vec![0.0; 4]);
    assert!(matches!(
        to_deployment_order(&kernel, KernelLayout::KerasConv),
        Err(LayoutError::Rank { expected: 4, .. })
    ));
}

#[test]
fn batch_norm_parts_skip_missing() {
    let bn = BatchNormWeights {
        gamma: Some(vec![1.0]),
        beta: None,
        moving_mean: Some(vec![0.5]),
        moving_variance: Some(vec![2.0]),
    };
    let names: Vec<_> = bn.parts().map(|(n, _)| n).collect();
    assert_eq!(names, vec!["gamma", "moving_mean", "moving_variance"]);
}
