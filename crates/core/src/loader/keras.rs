use rustc_hash::FxHashMap;
use serde_json::Value as Json;

use crate::{
    attr::{AttrValue, Attributes},
    config::ModelFormat,
    loader::{GraphLoader, LoadError, LoadedGraph},
    node::GraphNode,
    shape::ShapeMap,
    tensor::Tensor,
    ConvertError,
};

const CONTAINERS: &[&str] = &["Sequential", "Functional", "Model"];

/// Builds a node list from a Keras model configuration (`model.to_json()`, or the `model_config`
/// attribute of an HDF5 file) and a per-layer weight map.
///
/// Reading the HDF5 container itself is left to the caller.
pub struct KerasConfigLoader {
    config: Json,
    weights: FxHashMap<String, FxHashMap<String, Tensor>>,
    shapes: ShapeMap,
}

impl KerasConfigLoader {
    pub fn new(config: Json) -> Self {
        Self {
            config,
            weights: FxHashMap::default(),
            shapes: ShapeMap::new(),
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConvertError> {
        Ok(Self::new(serde_json::from_str(json)?))
    }

    pub fn with_weight(
        mut self,
        layer: impl Into<String>,
        variable: impl Into<String>,
        tensor: Tensor,
    ) -> Self {
        self.weights
            .entry(layer.into())
            .or_default()
            .insert(variable.into(), tensor);
        self
    }

    /// Adds a weight named the way Keras names variables, e.g. `conv2d/kernel:0`.
    pub fn with_weight_path(self, path: &str, tensor: Tensor) -> Result<Self, ConvertError> {
        let path = path.split(':').next().unwrap_or(path);
        let (layer, variable) = path.rsplit_once('/').ok_or_else(|| {
            LoadError::InvalidConfig(format!("weight name '{path}' has no layer prefix").into())
        })?;
        let layer = layer.rsplit('/').next().unwrap_or(layer).to_owned();
        Ok(self.with_weight(layer, variable, tensor))
    }

    /// Shapes for layers, in channel-last order.
    pub fn with_shapes(mut self, shapes: ShapeMap) -> Self {
        self.shapes = shapes;
        self
    }

    fn parse_layer(&mut self, entry: &Json) -> Result<GraphNode, LoadError> {
        let class_name = entry
            .get("class_name")
            .and_then(Json::as_str)
            .ok_or_else(|| LoadError::InvalidConfig("layer without class_name".into()))?;
        let config = entry.get("config").unwrap_or(&Json::Null);
        let name = entry
            .get("name")
            .or_else(|| config.get("name"))
            .and_then(Json::as_str)
            .ok_or_else(|| {
                LoadError::InvalidConfig(format!("{class_name} layer without a name").into())
            })?;

        let mut node = GraphNode::new(name, class_name);
        if let Some(obj) = config.as_object() {
            node.attrs = obj
                .iter()
                .filter(|(k, _)| *k != "name" && *k != "layers")
                .map(|(k, v)| (k.clone(), AttrValue::from_json(v)))
                .collect::<Attributes>();
        }

        node.inbound = match entry.get("inbound_nodes") {
            Some(Json::Array(calls)) => Some(flatten_inbound_nodes(calls)?),
            Some(_) => {
                return Err(LoadError::InvalidConfig(
                    format!("inbound_nodes of '{name}' is not a list").into(),
                ))
            }
            None => None,
        };

        if CONTAINERS.contains(&class_name) {
            for inner in model_layers(config)? {
                node.children.push(self.parse_layer(inner)?);
            }
        }

        if let Some(weights) = self.weights.remove(name) {
            node.weights = weights;
        }

        Ok(node)
    }
}

/// Layer list of a model config, for both the `{"layers": [...]}` and the bare list layouts.
fn model_layers(config: &Json) -> Result<&[Json], LoadError> {
    match config {
        Json::Array(layers) => Ok(layers),
        Json::Object(obj) => match obj.get("layers") {
            Some(Json::Array(layers)) => Ok(layers),
            _ => Err(LoadError::InvalidConfig("model config has no layer list".into())),
        },
        _ => Err(LoadError::InvalidConfig("model config is not an object".into())),
    }
}

/// `[[["a", 0, 0, {}], ["b", 0, 0, {}]]]` -> `["a", "b"]`.
fn flatten_inbound_nodes(calls: &[Json]) -> Result<Vec<String>, LoadError> {
    let mut names = vec![];
    for call in calls {
        let Json::Array(args) = call else {
            return Err(LoadError::InvalidConfig("inbound call is not a list".into()));
        };
        for arg in args {
            let name = match arg {
                Json::Array(parts) => parts.first().and_then(Json::as_str),
                Json::String(s) => Some(s.as_str()),
                _ => None,
            };
            let name = name.ok_or_else(|| {
                LoadError::InvalidConfig(format!("unreadable inbound reference {arg}").into())
            })?;
            names.push(name.to_owned());
        }
    }
    Ok(names)
}

impl GraphLoader for KerasConfigLoader {
    fn format(&self) -> ModelFormat {
        ModelFormat::Keras
    }

    fn load(&mut self) -> Result<LoadedGraph, ConvertError> {
        let config = self.config.clone();
        let root = config.get("model_config").unwrap_or(&config);
        let root = match root {
            // HDF5 attributes keep the config as a JSON string.
            Json::String(s) => serde_json::from_str(s)?,
            other => other.clone(),
        };
        let model = root.get("config").unwrap_or(&root);

        let mut nodes = vec![];
        for entry in model_layers(model)? {
            nodes.push(self.parse_layer(entry)?);
        }

        for layer in self.weights.keys() {
            log::warn!("weights for unknown layer '{layer}' ignored");
        }

        Ok(LoadedGraph {
            nodes,
            shapes: std::mem::take(&mut self.shapes),
        })
    }
}

#[test]
fn functional_model() {
    let config = serde_json::json!({
        "class_name": "Functional",
        "config": {
            "name": "model",
            "layers": [
                {"class_name": "InputLayer", "name": "input_1",
                 "config": {"name": "input_1", "batch_input_shape": [null, 8, 8, 3]},
                 "inbound_nodes": []},
                {"class_name": "Conv2D", "name": "conv",
                 "config": {"name": "conv", "filters": 4, "kernel_size": [3, 3]},
                 "inbound_nodes": [[["input_1", 0, 0, {}]]]},
                {"class_name": "Add", "name": "add",
                 "config": {"name": "add"},
                 "inbound_nodes": [[["conv", 0, 0, {}], ["input_1", 0, 0, {}]]]}
            ]
        }
    });
    let mut loader = KerasConfigLoader::new(config)
        .with_weight_path("conv/kernel:0", Tensor::new(vec![3, 3, 3, 4], vec![0.0; 108]))
        .unwrap();
    let loaded = loader.load().unwrap();
    assert_eq!(loaded.nodes.len(), 3);
    assert_eq!(loaded.nodes[0].inbound, Some(vec![]));
    assert_eq!(loaded.nodes[1].attrs.int("filters"), Some(4));
    assert!(loaded.nodes[1].weights.contains_key("kernel"));
    assert_eq!(loaded.nodes[2].inbound(), &["conv", "input_1"]);
}

#[test]
fn nested_sequential() {
    let config = serde_json::json!({
        "class_name": "Sequential",
        "config": {
            "name": "outer",
            "layers": [
                {"class_name": "InputLayer", "config": {"name": "in"}},
                {"class_name": "Sequential", "config": {"name": "block", "layers": [
                    {"class_name": "Dense", "config": {"name": "d1", "units": 2}},
                    {"class_name": "Dense", "config": {"name": "d2", "units": 2}}
                ]}}
            ]
        }
    });
    let loaded = KerasConfigLoader::new(config).load().unwrap();
    assert_eq!(loaded.nodes.len(), 2);
    assert_eq!(loaded.nodes[0].inbound, None);
    let block = &loaded.nodes[1];
    assert_eq!(block.op_type, "Sequential");
    let inner: Vec<_> = block.children.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(inner, vec!["d1", "d2"]);
}

#[test]
fn missing_class_name() {
    let mut loader = KerasConfigLoader::new(serde_json::json!({"config": {"layers": [{}]}}));
    assert!(matches!(
        loader.load(),
        Err(ConvertError::Load(LoadError::InvalidConfig(_)))
    ));
}
