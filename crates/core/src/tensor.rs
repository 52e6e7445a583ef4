use ndarray::{ArrayD, IxDyn, ShapeError};

/// A dense `f32` tensor in row-major order.
///
/// Integer tensors coming from a model (pads, shapes, scales) are widened to `f32` on load; the
/// converter only ever reads small integral values out of them.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    dims: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    pub fn new(dims: Vec<usize>, data: Vec<f32>) -> Self {
        Self { dims, data }
    }

    /// Returns a 1-D tensor holding `data`.
    pub fn from_vec(data: Vec<f32>) -> Self {
        Self {
            dims: vec![data.len()],
            data,
        }
    }

    /// Decodes little-endian `f32` values.
    pub fn from_le_f32(dims: Vec<usize>, raw: &[u8]) -> Self {
        let data = raw
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self { dims, data }
    }

    /// Decodes little-endian `i64` values.
    pub fn from_le_i64(dims: Vec<usize>, raw: &[u8]) -> Self {
        let data = raw
            .chunks_exact(8)
            .map(|c| {
                let mut b = [0u8; 8];
                b.copy_from_slice(c);
                i64::from_le_bytes(b) as f32
            })
            .collect();
        Self { dims, data }
    }

    /// Decodes little-endian `i32` values.
    pub fn from_le_i32(dims: Vec<usize>, raw: &[u8]) -> Self {
        let data = raw
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32)
            .collect();
        Self { dims, data }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns the elements as integers, truncating toward zero.
    pub fn to_i64_vec(&self) -> Vec<i64> {
        self.data.iter().map(|&x| x as i64).collect()
    }

    pub fn to_array(&self) -> Result<ArrayD<f32>, ShapeError> {
        ArrayD::from_shape_vec(IxDyn(&self.dims), self.data.clone())
    }
}

#[test]
fn decode_raw() {
    let raw: Vec<u8> = [1.0f32, -2.5]
        .iter()
        .flat_map(|x| x.to_le_bytes())
        .collect();
    let t = Tensor::from_le_f32(vec![2], &raw);
    assert_eq!(t.data(), &[1.0, -2.5]);

    let raw: Vec<u8> = [3i64, -1].iter().flat_map(|x| x.to_le_bytes()).collect();
    let t = Tensor::from_le_i64(vec![2], &raw);
    assert_eq!(t.to_i64_vec(), vec![3, -1]);
}

#[test]
fn to_array_keeps_shape() {
    let t = Tensor::new(vec![2, 3], (0..6).map(|x| x as f32).collect());
    let a = t.to_array().unwrap();
    assert_eq!(a.shape(), &[2, 3]);
    assert_eq!(a[[1, 0]], 3.0);
}
