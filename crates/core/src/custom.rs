use std::{fs, path::Path};

use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::{Map, Value as Json};

use crate::{attr::AttrValue, ConvertError};

/// A user-defined layer type.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomLayerDef {
    pub layer_type: String,
    /// Type written to the IR. Defaults to `layer_type`.
    #[serde(default)]
    pub ir_type: Option<String>,
    /// Fixed plane count; pass-through when absent.
    #[serde(default)]
    pub output_planes: Option<u32>,
    /// Attributes copied into the record.
    #[serde(default)]
    pub attributes: Vec<String>,
}

impl CustomLayerDef {
    pub fn ir_type(&self) -> &str {
        self.ir_type.as_deref().unwrap_or(&self.layer_type)
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CustomFile {
    #[serde(default)]
    layers: Vec<CustomLayerDef>,
    #[serde(default)]
    constants: Map<String, Json>,
}

/// Per-run table of custom layers and named constants.
#[derive(Debug, Clone, Default)]
pub struct CustomObjects {
    layers: FxHashMap<String, CustomLayerDef>,
    constants: FxHashMap<String, Json>,
}

impl CustomObjects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, ConvertError> {
        let file: CustomFile = serde_json::from_str(json)?;
        let mut objects = Self::new();
        for def in file.layers {
            objects.add_layer(def);
        }
        for (name, value) in file.constants {
            objects.add_constant(name, value);
        }
        Ok(objects)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConvertError> {
        let objects = Self::from_json(&fs::read_to_string(path.as_ref())?)?;
        log::debug!(
            "loaded {} custom layers and {} constants from {}",
            objects.layers.len(),
            objects.constants.len(),
            path.as_ref().display()
        );
        Ok(objects)
    }

    pub fn add_layer(&mut self, def: CustomLayerDef) {
        self.layers.insert(def.layer_type.clone(), def);
    }

    pub fn add_constant(&mut self, name: impl Into<String>, value: Json) {
        self.constants.insert(name.into(), value);
    }

    pub fn layer(&self, layer_type: &str) -> Option<&CustomLayerDef> {
        self.layers.get(layer_type)
    }

    pub fn constant(&self, name: &str) -> Option<&Json> {
        self.constants.get(name)
    }

    /// JSON form of `value`, with a string naming a constant replaced by the constant.
    pub fn resolve(&self, value: &AttrValue) -> Json {
        match value {
            AttrValue::Str(s) => self.constant(s).cloned().unwrap_or_else(|| value.to_json()),
            _ => value.to_json(),
        }
    }
}

#[test]
fn parse_definitions() {
    let objects = CustomObjects::from_json(
        r#"{
            "layers": [
                {"layerType": "SubPixel", "irType": "PixelShuffle", "outputPlanes": 3,
                 "attributes": ["upscale"]},
                {"layerType": "Noop"}
            ],
            "constants": {"scale_x": 2}
        }"#,
    )
    .unwrap();
    let sub = objects.layer("SubPixel").unwrap();
    assert_eq!(sub.ir_type(), "PixelShuffle");
    assert_eq!(sub.output_planes, Some(3));
    assert_eq!(objects.layer("Noop").unwrap().ir_type(), "Noop");
    assert_eq!(
        objects.resolve(&AttrValue::Str("scale_x".into())),
        serde_json::json!(2)
    );
    assert_eq!(
        objects.resolve(&AttrValue::Str("other".into())),
        serde_json::json!("other")
    );
}

#[test]
fn unknown_sections_are_rejected() {
    assert!(CustomObjects::from_json(r#"{"handlers": []}"#).is_err());
}
