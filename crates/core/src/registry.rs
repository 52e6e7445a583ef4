use std::{fs, path::Path};

use rustc_hash::FxHashMap;
use serde::{de, Deserialize, Deserializer};

use crate::{config::ModelFormat, ConvertError};

/// Whether a layer type may be merged into one of a set of upstream layer types.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FusionRule {
    pub layer_type: String,
    #[serde(default, deserialize_with = "de_flag")]
    pub is_fusible: bool,
    #[serde(default, deserialize_with = "de_type_list")]
    pub fusible_with: Vec<String>,
}

impl FusionRule {
    pub fn new(layer_type: &str, fusible_with: &[&str]) -> Self {
        Self {
            layer_type: layer_type.to_owned(),
            is_fusible: !fusible_with.is_empty(),
            fusible_with: fusible_with.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn fuses_into(&self, op_type: &str) -> bool {
        self.is_fusible && self.fusible_with.iter().any(|t| t == op_type)
    }
}

/// Accepts `true`, `false`, or the spreadsheet spellings `"TRUE"` / `"FALSE"`.
fn de_flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Str(String),
    }
    match Flag::deserialize(d)? {
        Flag::Bool(b) => Ok(b),
        Flag::Str(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" | "" => Ok(false),
            _ => Err(de::Error::custom(format!("invalid flag '{s}'"))),
        },
    }
}

/// Accepts `"A;B"`, `["A", "B"]` or `null`.
fn de_type_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum List {
        Joined(String),
        Items(Vec<String>),
    }
    Ok(match Option::<List>::deserialize(d)? {
        None => vec![],
        Some(List::Joined(s)) => s
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect(),
        Some(List::Items(items)) => items,
    })
}

const KERAS_CONVS: &[&str] = &["Conv2D", "DepthwiseConv2D", "Conv2DTranspose"];
const KERAS_ACT_TARGETS: &[&str] = &[
    "Conv2D",
    "DepthwiseConv2D",
    "Conv2DTranspose",
    "Dense",
    "Add",
];
const ONNX_CONVS: &[&str] = &["Conv", "DepthwiseConv2D", "ConvTranspose"];
const ONNX_ACT_TARGETS: &[&str] = &["Conv", "DepthwiseConv2D", "ConvTranspose", "Gemm", "Add"];
const ONNX_LEAKY_TARGETS: &[&str] = &["Conv", "DepthwiseConv2D", "ConvTranspose", "Add"];

/// Fusion policy keyed by `(format, op type)`. Types without an entry are not fusible.
#[derive(Debug, Clone, Default)]
pub struct LayerSupportRegistry {
    rules: FxHashMap<(ModelFormat, String), FusionRule>,
}

impl LayerSupportRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        let mut reg = Self::default();
        reg.insert(ModelFormat::Keras, FusionRule::new("BatchNormalization", KERAS_CONVS));
        for act in ["Activation", "ReLU", "LeakyReLU"] {
            reg.insert(ModelFormat::Keras, FusionRule::new(act, KERAS_ACT_TARGETS));
        }

        let mut bn_targets = ONNX_CONVS.to_vec();
        bn_targets.push("Gemm");
        reg.insert(ModelFormat::Onnx, FusionRule::new("BatchNormalization", &bn_targets));
        for act in ["Relu", "Clip", "Sigmoid", "Tanh", "Swish"] {
            reg.insert(ModelFormat::Onnx, FusionRule::new(act, ONNX_ACT_TARGETS));
        }
        // Gemm reuses `alpha` for its own scaling.
        reg.insert(ModelFormat::Onnx, FusionRule::new("LeakyRelu", ONNX_LEAKY_TARGETS));
        reg
    }

    pub fn insert(&mut self, format: ModelFormat, rule: FusionRule) {
        self.rules.insert((format, rule.layer_type.clone()), rule);
    }

    /// Adds or replaces rules from a JSON table.
    pub fn extend_from_json(&mut self, format: ModelFormat, json: &str) -> Result<usize, ConvertError> {
        let rules: Vec<FusionRule> = serde_json::from_str(json)?;
        let count = rules.len();
        for rule in rules {
            self.insert(format, rule);
        }
        Ok(count)
    }

    pub fn extend_from_file(
        &mut self,
        format: ModelFormat,
        path: impl AsRef<Path>,
    ) -> Result<usize, ConvertError> {
        let json = fs::read_to_string(path)?;
        self.extend_from_json(format, &json)
    }

    pub fn rule(&self, format: ModelFormat, op_type: &str) -> Option<&FusionRule> {
        self.rules.get(&(format, op_type.to_owned()))
    }

    pub fn is_fusible(&self, format: ModelFormat, op_type: &str) -> bool {
        self.rule(format, op_type).map_or(false, |r| r.is_fusible)
    }

    pub fn is_fusible_with(&self, format: ModelFormat, op_type: &str, target: &str) -> bool {
        self.rule(format, op_type)
            .map_or(false, |r| r.fuses_into(target))
    }
}

#[test]
fn builtin_tables() {
    let reg = LayerSupportRegistry::builtin();
    assert!(reg.is_fusible_with(ModelFormat::Keras, "BatchNormalization", "Conv2D"));
    assert!(!reg.is_fusible_with(ModelFormat::Keras, "BatchNormalization", "Dense"));
    assert!(reg.is_fusible_with(ModelFormat::Onnx, "Relu", "Gemm"));
    assert!(!reg.is_fusible_with(ModelFormat::Onnx, "LeakyRelu", "Gemm"));
    assert!(!reg.is_fusible(ModelFormat::Onnx, "Conv"));
    assert!(!reg.is_fusible_with(ModelFormat::Onnx, "Relu", "Conv2D"));
}

#[test]
fn table_from_json() {
    let mut reg = LayerSupportRegistry::empty();
    let n = reg
        .extend_from_json(
            ModelFormat::Keras,
            r#"[
                {"layerType": "ReLU", "isFusible": "TRUE", "fusibleWith": "Conv2D;Dense"},
                {"layerType": "Conv2D", "isFusible": false, "fusibleWith": null},
                {"layerType": "Activation", "isFusible": true, "fusibleWith": ["Add"]}
            ]"#,
        )
        .unwrap();
    assert_eq!(n, 3);
    let relu = reg.rule(ModelFormat::Keras, "ReLU").unwrap();
    assert_eq!(relu.fusible_with, vec!["Conv2D", "Dense"]);
    assert!(reg.is_fusible_with(ModelFormat::Keras, "Activation", "Add"));
    assert!(!reg.is_fusible(ModelFormat::Keras, "Conv2D"));
    assert!(!reg.is_fusible(ModelFormat::Onnx, "ReLU"));
}

#[test]
fn bad_flag_is_rejected() {
    let mut reg = LayerSupportRegistry::empty();
    let err = reg
        .extend_from_json(
            ModelFormat::Onnx,
            r#"[{"layerType": "Relu", "isFusible": "maybe", "fusibleWith": "Conv"}]"#,
        )
        .unwrap_err();
    assert!(matches!(err, ConvertError::Json(_)));
}
