use rustc_hash::FxHashMap;

/// Source of inferred tensor shapes, keyed by the name of the producing node.
///
/// Unknown dimensions (symbolic batch sizes and the like) are reported as `-1`.
pub trait ShapeOracle {
    fn shape_of(&self, name: &str) -> Option<&[i64]>;
}

#[derive(Debug, Clone, Default)]
pub struct ShapeMap(FxHashMap<String, Vec<i64>>);

impl ShapeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, dims: Vec<i64>) {
        self.0.insert(name.into(), dims);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl ShapeOracle for ShapeMap {
    fn shape_of(&self, name: &str) -> Option<&[i64]> {
        self.0.get(name).map(Vec::as_slice)
    }
}

/// An oracle that knows nothing.
pub struct NoShapes;

impl ShapeOracle for NoShapes {
    fn shape_of(&self, _: &str) -> Option<&[i64]> {
        None
    }
}
