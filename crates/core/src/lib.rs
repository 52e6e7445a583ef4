use std::{borrow::Cow, io, path::PathBuf};

use thiserror::Error;

pub mod attr;
pub mod config;
pub mod custom;
pub mod fusion;
pub mod graph;
pub mod ir;
pub mod loader;
pub mod node;
pub mod normalize;
pub mod pipeline;
pub mod registry;
pub mod resolve;
pub mod shape;
pub mod tensor;
pub mod translate;
pub mod weights;
pub mod writer;

pub use config::{ConvertOptions, Framework, ModelFormat};
pub use loader::LoadError;
pub use pipeline::{convert_graph, ConvertContext, Converter};

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("Invalid model file format: {}", .0.display())]
    InvalidModelFormat(PathBuf),

    #[error("Model file is empty: {}", .0.display())]
    EmptyFile(PathBuf),

    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("Invalid compatible framework: {0}")]
    InvalidFramework(String),

    #[error("Invalid custom layer file format: {}", .0.display())]
    InvalidCustomLayerFile(PathBuf),

    #[error("Unsupported layer: {0}")]
    UnsupportedLayer(String),

    #[error("Layer '{layer}' is invalid: {detail}")]
    InvalidLayer { layer: String, detail: Cow<'static, str> },

    #[error("Graph is invalid: {0}")]
    InvalidGraph(Cow<'static, str>),

    #[error("No loader available for {0:?} models")]
    NoLoader(ModelFormat),

    #[error("{0}")]
    Load(#[from] LoadError),

    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl ConvertError {
    /// Numeric code reported by the command-line front end.
    pub fn code(&self) -> u32 {
        match self {
            ConvertError::InvalidModelFormat(_) => 101,
            ConvertError::EmptyFile(_) => 102,
            ConvertError::FileNotFound(_) => 103,
            ConvertError::InvalidFramework(_) => 104,
            ConvertError::InvalidCustomLayerFile(_) => 105,
            ConvertError::UnsupportedLayer(_) => 201,
            _ => 1,
        }
    }

    pub(crate) fn invalid_layer(layer: &str, detail: impl Into<Cow<'static, str>>) -> Self {
        ConvertError::InvalidLayer {
            layer: layer.to_owned(),
            detail: detail.into(),
        }
    }
}
