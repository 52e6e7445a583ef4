use std::borrow::Cow;

use prost::DecodeError;
use thiserror::Error;

use crate::{config::ModelFormat, node::GraphNode, shape::ShapeMap, ConvertError};

pub mod keras;
pub mod onnx;

pub use keras::KerasConfigLoader;
pub use onnx::OnnxLoader;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Model is invalid: {0}")]
    InvalidModel(#[from] DecodeError),

    #[error("Model does not contain any graph")]
    NoGraph,

    #[error("Model does not declare any input")]
    NoInput,

    #[error("Unsupported data type for tensor '{name}': {data_type}")]
    UnsupportedDataType { name: String, data_type: i32 },

    #[error("Model configuration is malformed: {0}")]
    InvalidConfig(Cow<'static, str>),
}

/// Raw node list handed to the pipeline.
#[derive(Debug, Clone, Default)]
pub struct LoadedGraph {
    pub nodes: Vec<GraphNode>,
    pub shapes: ShapeMap,
}

/// Turns a model container into an ordered node list.
pub trait GraphLoader {
    fn format(&self) -> ModelFormat;
    fn load(&mut self) -> Result<LoadedGraph, ConvertError>;
}
