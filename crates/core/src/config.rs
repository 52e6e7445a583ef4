use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use crate::ConvertError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelFormat {
    /// Keras HDF5 model (`.h5`).
    Keras,
    /// ONNX protobuf model (`.onnx`).
    Onnx,
}

impl ModelFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if name.ends_with(".h5") {
            Some(ModelFormat::Keras)
        } else if name.ends_with(".onnx") {
            Some(ModelFormat::Onnx)
        } else {
            None
        }
    }
}

/// Inference engine the IR is produced for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framework {
    #[default]
    Snn,
}

impl FromStr for Framework {
    type Err = ConvertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SNN" => Ok(Framework::Snn),
            _ => Err(ConvertError::InvalidFramework(s.to_owned())),
        }
    }
}

const CUSTOM_LAYER_FILE_EXT: &str = "json";

#[derive(Debug, Clone)]
pub struct ConvertOptions {
    pub model_path: PathBuf,
    pub framework: String,
    pub decouple_weights: bool,
    pub output_dir: Option<PathBuf>,
    pub custom_layers_file: Option<PathBuf>,
}

/// Result of a successful [`ConvertOptions::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckedOptions {
    pub format: ModelFormat,
    pub framework: Framework,
}

impl ConvertOptions {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            framework: "SNN".to_owned(),
            decouple_weights: false,
            output_dir: None,
            custom_layers_file: None,
        }
    }

    pub fn with_framework(mut self, framework: impl Into<String>) -> Self {
        self.framework = framework.into();
        self
    }

    pub fn with_decoupled_weights(mut self, decouple: bool) -> Self {
        self.decouple_weights = decouple;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn with_custom_layers(mut self, path: impl Into<PathBuf>) -> Self {
        self.custom_layers_file = Some(path.into());
        self
    }

    /// Validates the model file, the framework and the custom-layer file, in that order.
    pub fn check(&self) -> Result<CheckedOptions, ConvertError> {
        let path = &self.model_path;
        if !path.is_file() {
            return Err(ConvertError::FileNotFound(path.clone()));
        }
        let format =
            ModelFormat::from_path(path).ok_or_else(|| ConvertError::InvalidModelFormat(path.clone()))?;
        check_not_empty(path)?;

        let framework = self.framework.parse()?;

        if let Some(custom) = &self.custom_layers_file {
            if !custom.is_file() {
                return Err(ConvertError::FileNotFound(custom.clone()));
            }
            let valid_ext = custom
                .extension()
                .and_then(|e| e.to_str())
                .map_or(false, |e| e.eq_ignore_ascii_case(CUSTOM_LAYER_FILE_EXT));
            if !valid_ext {
                return Err(ConvertError::InvalidCustomLayerFile(custom.clone()));
            }
            check_not_empty(custom)?;
        }

        Ok(CheckedOptions { format, framework })
    }

    /// File stem shared by all outputs.
    pub fn stem(&self) -> String {
        self.model_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".to_owned())
    }

    pub fn output_dir(&self) -> PathBuf {
        match &self.output_dir {
            Some(dir) => dir.clone(),
            None => self
                .model_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
        }
    }

    pub fn json_file_name(&self) -> String {
        if self.decouple_weights {
            format!("{}_layers.json", self.stem())
        } else {
            format!("{}.json", self.stem())
        }
    }

    pub fn bin_file_name(&self) -> Option<String> {
        self.decouple_weights
            .then(|| format!("{}_weights.bin", self.stem()))
    }
}

fn check_not_empty(path: &Path) -> Result<(), ConvertError> {
    if fs::metadata(path)?.len() == 0 {
        return Err(ConvertError::EmptyFile(path.to_path_buf()));
    }
    Ok(())
}

#[test]
fn format_from_extension() {
    assert_eq!(ModelFormat::from_path(Path::new("a/b.h5")), Some(ModelFormat::Keras));
    assert_eq!(ModelFormat::from_path(Path::new("B.ONNX")), Some(ModelFormat::Onnx));
    assert_eq!(ModelFormat::from_path(Path::new("model.pb")), None);
}

#[test]
fn file_names() {
    let opts = ConvertOptions::new("/models/net.onnx");
    assert_eq!(opts.json_file_name(), "net.json");
    assert_eq!(opts.bin_file_name(), None);
    assert_eq!(opts.output_dir(), PathBuf::from("/models"));

    let opts = opts.with_decoupled_weights(true).with_output_dir("/out");
    assert_eq!(opts.json_file_name(), "net_layers.json");
    assert_eq!(opts.bin_file_name().as_deref(), Some("net_weights.bin"));
    assert_eq!(opts.output_dir(), PathBuf::from("/out"));
}

#[test]
fn framework_names() {
    assert_eq!("SNN".parse::<Framework>().unwrap(), Framework::Snn);
    assert!(matches!(
        "TFLite".parse::<Framework>(),
        Err(ConvertError::InvalidFramework(f)) if f == "TFLite"
    ));
}
