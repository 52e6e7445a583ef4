use std::{fs, path::Path};

use prost::Message;
use rustc_hash::FxHashMap;

use crate::{
    attr::{AttrValue, Attributes},
    config::ModelFormat,
    loader::{GraphLoader, LoadError, LoadedGraph},
    node::GraphNode,
    shape::ShapeMap,
    tensor::Tensor,
    ConvertError,
};

use proto::{
    tensor_shape_proto::dimension::Value::{DimParam, DimValue},
    AttributeProto, GraphProto, ModelProto, TensorProto, ValueInfoProto,
};

/// The subset of the ONNX schema the converter reads.
pub mod proto {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct ModelProto {
        #[prost(int64, tag = "1")]
        pub ir_version: i64,
        #[prost(message, repeated, tag = "8")]
        pub opset_import: Vec<OperatorSetIdProto>,
        #[prost(string, tag = "2")]
        pub producer_name: String,
        #[prost(message, optional, tag = "7")]
        pub graph: Option<GraphProto>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct OperatorSetIdProto {
        #[prost(string, tag = "1")]
        pub domain: String,
        #[prost(int64, tag = "2")]
        pub version: i64,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct GraphProto {
        #[prost(message, repeated, tag = "1")]
        pub node: Vec<NodeProto>,
        #[prost(string, tag = "2")]
        pub name: String,
        #[prost(message, repeated, tag = "5")]
        pub initializer: Vec<TensorProto>,
        #[prost(message, repeated, tag = "11")]
        pub input: Vec<ValueInfoProto>,
        #[prost(message, repeated, tag = "12")]
        pub output: Vec<ValueInfoProto>,
        #[prost(message, repeated, tag = "13")]
        pub value_info: Vec<ValueInfoProto>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct NodeProto {
        #[prost(string, repeated, tag = "1")]
        pub input: Vec<String>,
        #[prost(string, repeated, tag = "2")]
        pub output: Vec<String>,
        #[prost(string, tag = "3")]
        pub name: String,
        #[prost(string, tag = "4")]
        pub op_type: String,
        #[prost(message, repeated, tag = "5")]
        pub attribute: Vec<AttributeProto>,
        #[prost(string, tag = "7")]
        pub domain: String,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct TensorProto {
        #[prost(int64, repeated, tag = "1")]
        pub dims: Vec<i64>,
        #[prost(int32, tag = "2")]
        pub data_type: i32,
        #[prost(float, repeated, tag = "4")]
        pub float_data: Vec<f32>,
        #[prost(int32, repeated, tag = "5")]
        pub int32_data: Vec<i32>,
        #[prost(int64, repeated, tag = "7")]
        pub int64_data: Vec<i64>,
        #[prost(string, tag = "8")]
        pub name: String,
        #[prost(bytes = "vec", tag = "9")]
        pub raw_data: Vec<u8>,
        #[prost(double, repeated, tag = "10")]
        pub double_data: Vec<f64>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct AttributeProto {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(float, tag = "2")]
        pub f: f32,
        #[prost(int64, tag = "3")]
        pub i: i64,
        #[prost(bytes = "vec", tag = "4")]
        pub s: Vec<u8>,
        #[prost(message, optional, tag = "5")]
        pub t: Option<TensorProto>,
        #[prost(float, repeated, tag = "7")]
        pub floats: Vec<f32>,
        #[prost(int64, repeated, tag = "8")]
        pub ints: Vec<i64>,
        #[prost(bytes = "vec", repeated, tag = "9")]
        pub strings: Vec<Vec<u8>>,
        #[prost(int32, tag = "20")]
        pub r#type: i32,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct ValueInfoProto {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(message, optional, tag = "2")]
        pub r#type: Option<TypeProto>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct TypeProto {
        #[prost(message, optional, tag = "1")]
        pub tensor_type: Option<TensorTypeProto>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct TensorTypeProto {
        #[prost(int32, tag = "1")]
        pub elem_type: i32,
        #[prost(message, optional, tag = "2")]
        pub shape: Option<TensorShapeProto>,
    }

    #[derive(Clone, PartialEq, Message)]
    pub struct TensorShapeProto {
        #[prost(message, repeated, tag = "1")]
        pub dim: Vec<tensor_shape_proto::Dimension>,
    }

    pub mod tensor_shape_proto {
        use prost::Message;

        #[derive(Clone, PartialEq, Message)]
        pub struct Dimension {
            #[prost(oneof = "dimension::Value", tags = "1, 2")]
            pub value: Option<dimension::Value>,
        }

        pub mod dimension {
            #[derive(Clone, PartialEq, prost::Oneof)]
            pub enum Value {
                #[prost(int64, tag = "1")]
                DimValue(i64),
                #[prost(string, tag = "2")]
                DimParam(String),
            }
        }
    }
}

mod data_type {
    pub const FLOAT: i32 = 1;
    pub const INT32: i32 = 6;
    pub const INT64: i32 = 7;
    pub const DOUBLE: i32 = 11;
}

mod attr_type {
    pub const FLOAT: i32 = 1;
    pub const INT: i32 = 2;
    pub const STRING: i32 = 3;
    pub const TENSOR: i32 = 4;
    pub const FLOATS: i32 = 6;
    pub const INTS: i32 = 7;
    pub const STRINGS: i32 = 8;
}

/// Loads an ONNX `ModelProto`.
///
/// Initializers and `Constant` outputs become weights of the nodes consuming them; the full input
/// list is kept in the `operands` attribute so that translators can find weights by position.
/// Inbound lists only name producing nodes (or the graph input).
pub struct OnnxLoader {
    model: ModelProto,
}

impl OnnxLoader {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConvertError> {
        let buf = fs::read(path)?;
        Ok(Self::from_bytes(&buf)?)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, LoadError> {
        let model = ModelProto::decode(buf)?;
        Ok(Self { model })
    }

    pub fn from_model(model: ModelProto) -> Self {
        Self { model }
    }
}

impl GraphLoader for OnnxLoader {
    fn format(&self) -> ModelFormat {
        ModelFormat::Onnx
    }

    fn load(&mut self) -> Result<LoadedGraph, ConvertError> {
        let graph = self.model.graph.as_ref().ok_or(LoadError::NoGraph)?;
        Ok(load_graph(graph)?)
    }
}

fn load_graph(graph: &GraphProto) -> Result<LoadedGraph, LoadError> {
    let mut inits = FxHashMap::default();
    for init in &graph.initializer {
        inits.insert(init.name.clone(), get_tensor(init)?);
    }

    for node in graph.node.iter().filter(|n| n.op_type == "Constant") {
        let (Some(out), Ok(value)) = (node.output.first(), get_attribute(&node.attribute, "value"))
        else {
            log::warn!("Constant '{}' has no tensor value, ignored", node.name);
            continue;
        };
        if let Some(t) = &value.t {
            inits.insert(out.clone(), get_tensor(t)?);
        }
    }

    // Tensor name -> name of the node producing it.
    let mut producer: FxHashMap<&str, String> = FxHashMap::default();
    let mut nodes = Vec::with_capacity(graph.node.len() + 1);
    let mut shapes = ShapeMap::new();

    let input = graph
        .input
        .iter()
        .find(|i| !inits.contains_key(&i.name))
        .ok_or(LoadError::NoInput)?;
    let input_shape = value_shape(input).unwrap_or_default();
    producer.insert(&input.name, input.name.clone());
    shapes.insert(input.name.clone(), input_shape.clone());
    nodes.push(
        GraphNode::new(&input.name, "Input")
            .with_ins(Vec::<String>::new())
            .with_attr("shape", AttrValue::Ints(input_shape)),
    );

    for (idx, node) in graph.node.iter().enumerate() {
        if node.op_type == "Constant" {
            continue;
        }
        let name = if node.name.is_empty() {
            format!("{}_{idx}", node.op_type)
        } else {
            node.name.clone()
        };

        let mut attrs: Attributes = node
            .attribute
            .iter()
            .filter_map(|a| get_attr_value(a).map(|v| (a.name.clone(), v)))
            .collect();
        attrs.set("operands", AttrValue::Strs(node.input.clone()));

        let mut graph_node = GraphNode::new(&name, &node.op_type).with_ins(
            node.input
                .iter()
                .filter_map(|i| producer.get(i.as_str()).cloned())
                .collect::<Vec<_>>(),
        );
        graph_node.attrs = attrs;
        for input in &node.input {
            if let Some(tensor) = inits.get(input) {
                graph_node.weights.insert(input.clone(), tensor.clone());
            }
        }
        nodes.push(graph_node);

        for out in &node.output {
            producer.insert(out, name.clone());
        }
    }

    for info in graph.value_info.iter().chain(&graph.output) {
        match (producer.get(info.name.as_str()), value_shape(info)) {
            (Some(node), Some(dims)) => shapes.insert(node.clone(), dims),
            _ => log::debug!("no shape recorded for '{}'", info.name),
        }
    }

    log::debug!(
        "loaded onnx graph '{}': {} nodes, {} weights, {} shapes",
        graph.name,
        nodes.len(),
        inits.len(),
        shapes.len()
    );

    Ok(LoadedGraph { nodes, shapes })
}

fn value_shape(info: &ValueInfoProto) -> Option<Vec<i64>> {
    let shape = info.r#type.as_ref()?.tensor_type.as_ref()?.shape.as_ref()?;
    Some(
        shape
            .dim
            .iter()
            .map(|d| match d.value {
                Some(DimValue(v)) => v,
                Some(DimParam(_)) | None => -1,
            })
            .collect(),
    )
}

fn get_attribute<'a>(
    attrs: &'a [AttributeProto],
    name: &'static str,
) -> Result<&'a AttributeProto, LoadError> {
    attrs
        .iter()
        .find(|x| x.name == name)
        .ok_or_else(|| LoadError::InvalidConfig(format!("attribute '{name}' is missing").into()))
}

fn get_attr_value(attr: &AttributeProto) -> Option<AttrValue> {
    let decode = |s: &[u8]| String::from_utf8_lossy(s).into_owned();
    Some(match attr.r#type {
        attr_type::FLOAT => AttrValue::Float(attr.f),
        attr_type::INT => AttrValue::Int(attr.i),
        attr_type::STRING => AttrValue::Str(decode(&attr.s)),
        attr_type::FLOATS => AttrValue::Floats(attr.floats.clone()),
        attr_type::INTS => AttrValue::Ints(attr.ints.clone()),
        attr_type::STRINGS => AttrValue::Strs(attr.strings.iter().map(|s| decode(s)).collect()),
        attr_type::TENSOR => {
            log::debug!("tensor attribute '{}' ignored", attr.name);
            return None;
        }
        // Old exporters leave the type unset.
        _ if !attr.ints.is_empty() => AttrValue::Ints(attr.ints.clone()),
        _ if !attr.floats.is_empty() => AttrValue::Floats(attr.floats.clone()),
        _ if !attr.s.is_empty() => AttrValue::Str(decode(&attr.s)),
        _ if attr.f != 0.0 => AttrValue::Float(attr.f),
        _ => AttrValue::Int(attr.i),
    })
}

fn get_tensor(tensor: &TensorProto) -> Result<Tensor, LoadError> {
    let dims: Vec<usize> = tensor.dims.iter().map(|&d| d.max(0) as usize).collect();
    let raw = &tensor.raw_data;
    let t = match tensor.data_type {
        data_type::FLOAT if raw.is_empty() => Tensor::new(dims, tensor.float_data.clone()),
        data_type::FLOAT => Tensor::from_le_f32(dims, raw),
        data_type::INT64 if raw.is_empty() => {
            Tensor::new(dims, tensor.int64_data.iter().map(|&x| x as f32).collect())
        }
        data_type::INT64 => Tensor::from_le_i64(dims, raw),
        data_type::INT32 if raw.is_empty() => {
            Tensor::new(dims, tensor.int32_data.iter().map(|&x| x as f32).collect())
        }
        data_type::INT32 => Tensor::from_le_i32(dims, raw),
        data_type::DOUBLE if raw.is_empty() => {
            Tensor::new(dims, tensor.double_data.iter().map(|&x| x as f32).collect())
        }
        data_type::DOUBLE => Tensor::new(
            dims,
            raw.chunks_exact(8)
                .map(|c| {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(c);
                    f64::from_le_bytes(b) as f32
                })
                .collect(),
        ),
        data_type => {
            return Err(LoadError::UnsupportedDataType {
                name: tensor.name.clone(),
                data_type,
            })
        }
    };
    let expected: usize = t.dims().iter().product();
    if expected != t.len() {
        return Err(LoadError::InvalidConfig(
            format!(
                "tensor '{}' holds {} values, shape {:?} needs {expected}",
                tensor.name,
                t.len(),
                t.dims()
            )
            .into(),
        ));
    }
    Ok(t)
}

#[cfg(test)]
pub(crate) fn float_tensor(name: &str, dims: &[i64], data: Vec<f32>) -> TensorProto {
    TensorProto {
        dims: dims.to_vec(),
        data_type: data_type::FLOAT,
        float_data: data,
        name: name.to_owned(),
        ..Default::default()
    }
}

#[test]
fn decode_conv_graph() {
    use proto::*;

    let raw: Vec<u8> = [1.0f32, 2.0].iter().flat_map(|x| x.to_le_bytes()).collect();
    let model = ModelProto {
        ir_version: 7,
        graph: Some(GraphProto {
            name: "g".into(),
            node: vec![
                NodeProto {
                    input: vec!["x".into(), "w".into(), "b".into()],
                    output: vec!["y".into()],
                    name: "conv0".into(),
                    op_type: "Conv".into(),
                    attribute: vec![AttributeProto {
                        name: "kernel_shape".into(),
                        ints: vec![1, 1],
                        r#type: attr_type::INTS,
                        ..Default::default()
                    }],
                    ..Default::default()
                },
                NodeProto {
                    input: vec!["y".into()],
                    output: vec!["z".into()],
                    op_type: "Relu".into(),
                    ..Default::default()
                },
            ],
            initializer: vec![
                float_tensor("w", &[2, 1, 1, 1], vec![0.5, -0.5]),
                TensorProto {
                    dims: vec![2],
                    data_type: data_type::FLOAT,
                    name: "b".into(),
                    raw_data: raw,
                    ..Default::default()
                },
            ],
            input: vec![ValueInfoProto {
                name: "x".into(),
                r#type: Some(TypeProto {
                    tensor_type: Some(TensorTypeProto {
                        elem_type: data_type::FLOAT,
                        shape: Some(TensorShapeProto {
                            dim: vec![
                                tensor_shape_proto::Dimension {
                                    value: Some(DimParam("N".into())),
                                },
                                tensor_shape_proto::Dimension {
                                    value: Some(DimValue(1)),
                                },
                            ],
                        }),
                    }),
                }),
            }],
            ..Default::default()
        }),
        ..Default::default()
    };

    let buf = model.encode_to_vec();
    let loaded = OnnxLoader::from_bytes(&buf).unwrap().load().unwrap();
    let names: Vec<_> = loaded.nodes.iter().map(|n| n.name.as_str()).collect();
    assert_eq!(names, vec!["x", "conv0", "Relu_1"]);

    let conv = &loaded.nodes[1];
    assert_eq!(conv.inbound(), &["x"]);
    assert_eq!(conv.operands(), vec!["x", "w", "b"]);
    assert_eq!(conv.operand_weight(2).unwrap().data(), &[1.0, 2.0]);
    assert_eq!(conv.attrs.ints("kernel_shape"), Some(vec![1, 1]));
    assert_eq!(loaded.nodes[2].inbound(), &["conv0"]);

    use crate::shape::ShapeOracle;
    assert_eq!(loaded.shapes.shape_of("x"), Some(&[-1i64, 1][..]));
}

#[test]
fn garbage_is_rejected() {
    assert!(matches!(
        OnnxLoader::from_bytes(&[0xff, 0xff, 0xff]),
        Err(LoadError::InvalidModel(_))
    ));
    let mut loader = OnnxLoader::from_model(ModelProto::default());
    assert!(matches!(
        loader.load(),
        Err(ConvertError::Load(LoadError::NoGraph))
    ));
}
