use std::{fs, path::Path};

use irconv_core::{
    loader::{
        onnx::proto::{
            tensor_shape_proto::{dimension::Value::DimValue, Dimension},
            AttributeProto, GraphProto, ModelProto, NodeProto, TensorProto, TensorShapeProto,
            TensorTypeProto, TypeProto, ValueInfoProto,
        },
        GraphLoader, OnnxLoader,
    },
    registry::LayerSupportRegistry,
    ConvertContext, ConvertError, ConvertOptions, Converter, ModelFormat,
};
use prost::Message;

const FLOAT: i32 = 1;
const ATTR_FLOAT: i32 = 1;
const ATTR_INT: i32 = 2;
const ATTR_STRING: i32 = 3;

fn tensor(name: &str, dims: &[i64], data: Vec<f32>) -> TensorProto {
    TensorProto {
        dims: dims.to_vec(),
        data_type: FLOAT,
        float_data: data,
        name: name.to_owned(),
        ..Default::default()
    }
}

fn value_info(name: &str, dims: &[i64]) -> ValueInfoProto {
    ValueInfoProto {
        name: name.to_owned(),
        r#type: Some(TypeProto {
            tensor_type: Some(TensorTypeProto {
                elem_type: FLOAT,
                shape: Some(TensorShapeProto {
                    dim: dims
                        .iter()
                        .map(|&d| Dimension {
                            value: Some(DimValue(d)),
                        })
                        .collect(),
                }),
            }),
        }),
    }
}

fn attr_int(name: &str, i: i64) -> AttributeProto {
    AttributeProto {
        name: name.to_owned(),
        i,
        r#type: ATTR_INT,
        ..Default::default()
    }
}

fn attr_float(name: &str, f: f32) -> AttributeProto {
    AttributeProto {
        name: name.to_owned(),
        f,
        r#type: ATTR_FLOAT,
        ..Default::default()
    }
}

fn attr_str(name: &str, s: &str) -> AttributeProto {
    AttributeProto {
        name: name.to_owned(),
        s: s.as_bytes().to_vec(),
        r#type: ATTR_STRING,
        ..Default::default()
    }
}

fn node(name: &str, op: &str, inputs: &[&str], output: &str) -> NodeProto {
    NodeProto {
        name: name.to_owned(),
        op_type: op.to_owned(),
        input: inputs.iter().map(|s| s.to_string()).collect(),
        output: vec![output.to_owned()],
        ..Default::default()
    }
}

fn model(graph: GraphProto) -> ModelProto {
    ModelProto {
        ir_version: 7,
        producer_name: "test".to_owned(),
        graph: Some(graph),
        ..Default::default()
    }
}

/// x(1, 3, 8, 8) -> Conv(4 filters, 3x3, bias) -> Relu
fn conv_relu_model() -> (ModelProto, Vec<f32>) {
    let kernel: Vec<f32> = (0..108).map(|i| i as f32 / 108.0).collect();
    let graph = GraphProto {
        name: "conv_relu".to_owned(),
        node: vec![
            NodeProto {
                attribute: vec![attr_int("group", 1)],
                ..node("conv", "Conv", &["x", "w", "b"], "c")
            },
            node("relu", "Relu", &["c"], "y"),
        ],
        initializer: vec![
            tensor("w", &[4, 3, 3, 3], kernel.clone()),
            tensor("b", &[4], vec![0.1, 0.2, 0.3, 0.4]),
        ],
        input: vec![value_info("x", &[1, 3, 8, 8])],
        output: vec![value_info("y", &[1, 4, 6, 6])],
        ..Default::default()
    };
    (model(graph), kernel)
}

fn write_model(dir: &Path, name: &str, model: &ModelProto) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, model.encode_to_vec()).unwrap();
    path
}

#[test]
fn decoupled_conv_relu() {
    let _ = env_logger::try_init();

    let dir = tempfile::tempdir().unwrap();
    let (model, kernel) = conv_relu_model();
    let path = write_model(dir.path(), "net.onnx", &model);

    let written = Converter::new(ConvertOptions::new(&path).with_decoupled_weights(true))
        .convert()
        .unwrap();
    assert_eq!(
        written,
        vec![dir.path().join("net_layers.json"), dir.path().join("net_weights.bin")]
    );

    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&written[0]).unwrap()).unwrap();
    assert_eq!(json["numLayers"]["count"], 2);
    assert_eq!(json["numLayers"]["bin_file_name"], "net_weights.bin");

    let conv = &json["Layer_1"];
    assert_eq!(conv["type"], "Conv2D");
    assert_eq!(conv["useBias"], "True");
    assert_eq!(conv["useBatchNormalization"], "False");
    assert_eq!(conv["activation"], "relu");
    assert_eq!(conv["act_name"], "relu");
    assert_eq!(conv["kernel_size"], 3);
    assert_eq!(conv["inputId"], serde_json::json!([0]));
    assert_eq!(conv["inputPlanes"], 3);
    assert_eq!(conv["outputPlanes"], 4);
    assert!(conv.get("weights").is_none());

    let bin = fs::read(&written[1]).unwrap();
    assert_eq!(bin.len(), 112 * 4);
    let floats: Vec<f32> = bin
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    assert_eq!(&floats[..108], kernel.as_slice());
    assert_eq!(&floats[108..], &[0.1, 0.2, 0.3, 0.4]);
}

#[test]
fn embedded_weights_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let (model, _) = conv_relu_model();
    let path = write_model(dir.path(), "net.onnx", &model);

    let written = Converter::new(ConvertOptions::new(&path)).convert().unwrap();
    assert_eq!(written, vec![dir.path().join("net.json")]);

    let text = fs::read_to_string(&written[0]).unwrap();
    assert!(text.starts_with("{\n    \"numLayers\""));
    let json: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert!(json["numLayers"].get("bin_file_name").is_none());
    let weights = &json["Layer_1"]["weights"];
    assert_eq!(weights["kernel"].as_array().unwrap().len(), 108);
    assert_eq!(weights["bias"].as_array().unwrap().len(), 4);
}

#[test]
fn unsupported_layer_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let graph = GraphProto {
        node: vec![node("e", "Einsum", &["x"], "y")],
        input: vec![value_info("x", &[1, 3, 8, 8])],
        ..Default::default()
    };
    let path = write_model(dir.path(), "net.onnx", &model(graph));

    let err = Converter::new(ConvertOptions::new(&path)).convert().unwrap_err();
    assert_eq!(err.code(), 201);
    match err {
        ConvertError::UnsupportedLayer(op) => assert_eq!(op, "Einsum"),
        other => panic!("unexpected {other}"),
    }
    let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(entries.len(), 1);
}

#[test]
fn non_uniform_resize_is_unsupported() {
    let graph = GraphProto {
        node: vec![node("rs", "Resize", &["x", "", "scales"], "y")],
        initializer: vec![tensor("scales", &[4], vec![1.0, 1.0, 2.0, 3.0])],
        input: vec![value_info("x", &[1, 3, 8, 8])],
        ..Default::default()
    };
    let loaded = OnnxLoader::from_model(model(graph)).load().unwrap();
    let cx = ConvertContext::new(ModelFormat::Onnx);
    let err = irconv_core::convert_graph(&cx, loaded.nodes, &loaded.shapes).unwrap_err();
    assert!(matches!(err, ConvertError::UnsupportedLayer(op) if op == "Resize"));
}

#[test]
fn non_uniform_legacy_upsample_is_unsupported() {
    let graph = GraphProto {
        node: vec![node("up", "Upsample", &["x", "scales"], "y")],
        initializer: vec![tensor("scales", &[4], vec![1.0, 1.0, 2.0, 3.0])],
        input: vec![value_info("x", &[1, 3, 8, 8])],
        ..Default::default()
    };
    let loaded = OnnxLoader::from_model(model(graph)).load().unwrap();
    let cx = ConvertContext::new(ModelFormat::Onnx);
    let err = irconv_core::convert_graph(&cx, loaded.nodes, &loaded.shapes).unwrap_err();
    assert!(matches!(err, ConvertError::UnsupportedLayer(op) if op == "Upsample"));
}

#[test]
fn uniform_legacy_upsample_is_upsampling() {
    let graph = GraphProto {
        node: vec![node("up", "Upsample", &["x", "scales"], "y")],
        initializer: vec![tensor("scales", &[4], vec![1.0, 1.0, 2.0, 2.0])],
        input: vec![value_info("x", &[1, 3, 8, 8])],
        ..Default::default()
    };
    let loaded = OnnxLoader::from_model(model(graph)).load().unwrap();
    let cx = ConvertContext::new(ModelFormat::Onnx);
    let doc = irconv_core::convert_graph(&cx, loaded.nodes, &loaded.shapes).unwrap();
    let up = doc.record("up").unwrap();
    assert_eq!(up.ty, "UpSampling2D");
    assert_eq!(up.fields["scaleFactor"], 2.0);
    assert_eq!(up.fields["interpolation"], "nearest");
}

#[test]
fn depthwise_resize_and_global_pool() {
    let graph = GraphProto {
        node: vec![
            NodeProto {
                attribute: vec![attr_int("group", 8)],
                ..node("dw", "Conv", &["x", "w"], "d")
            },
            NodeProto {
                attribute: vec![attr_str("mode", "nearest")],
                ..node("rs", "Resize", &["d", "", "scales"], "r")
            },
            node("gap", "GlobalAveragePool", &["r"], "y"),
        ],
        initializer: vec![
            tensor("w", &[8, 1, 3, 3], vec![0.0; 72]),
            tensor("scales", &[4], vec![1.0, 1.0, 2.0, 2.0]),
        ],
        input: vec![value_info("x", &[1, 8, 16, 16])],
        value_info: vec![value_info("d", &[1, 8, 16, 16]), value_info("r", &[1, 8, 32, 32])],
        output: vec![value_info("y", &[1, 8, 1, 1])],
        ..Default::default()
    };
    let loaded = OnnxLoader::from_model(model(graph)).load().unwrap();
    let cx = ConvertContext::new(ModelFormat::Onnx);
    let doc = irconv_core::convert_graph(&cx, loaded.nodes, &loaded.shapes).unwrap();

    let types: Vec<_> = doc.records.iter().map(|r| r.ty.as_str()).collect();
    assert_eq!(
        types,
        vec!["InputLayer", "DepthwiseConv2D", "UpSampling2D", "AveragePooling2D"]
    );

    let dw = doc.record("dw").unwrap();
    assert_eq!(dw.fields["group"], 1);
    assert_eq!(dw.fields["depth_multiplier"], 1);
    assert_eq!(dw.output_planes, Some(8));

    let up = doc.record("rs").unwrap();
    assert_eq!(up.fields["scaleFactor"], 2.0);
    assert_eq!(up.fields["interpolation"], "nearest");
    assert_eq!(up.input_planes, 8);

    let gap = doc.record("gap").unwrap();
    assert_eq!(gap.fields["pool_size"], serde_json::json!([32, 32]));
    assert_eq!(gap.fields["strides"], serde_json::json!([1, 1]));
    assert_eq!(gap.fields["padding"], "valid");

    for (i, record) in doc.records.iter().enumerate() {
        assert!(record.input_id.iter().all(|&id| id < i));
    }
}

#[test]
fn sigmoid_mul_becomes_fused_swish() {
    let graph = GraphProto {
        node: vec![
            node("conv", "Conv", &["x", "w"], "c"),
            node("sig", "Sigmoid", &["c"], "s"),
            node("mul", "Mul", &["c", "s"], "m"),
            node("out", "Relu", &["m"], "y"),
        ],
        initializer: vec![tensor("w", &[4, 4, 1, 1], vec![1.0; 16])],
        input: vec![value_info("x", &[1, 4, 8, 8])],
        ..Default::default()
    };
    let loaded = OnnxLoader::from_model(model(graph)).load().unwrap();
    let cx = ConvertContext::new(ModelFormat::Onnx);
    let doc = irconv_core::convert_graph(&cx, loaded.nodes, &loaded.shapes).unwrap();

    let names: Vec<_> = doc.records.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["x", "conv", "out"]);
    let conv = doc.record("conv").unwrap();
    assert_eq!(conv.fields["activation"], "swish");
    assert_eq!(conv.fields["act_name"], "sig");
    assert_eq!(conv.fields["useBias"], "False");

    // The conv already carries an activation.
    let out = doc.record("out").unwrap();
    assert_eq!(out.ty, "Activation");
    assert_eq!(out.input_id, vec![1]);
}

#[test]
fn batch_norm_and_leaky_relu_fold_into_conv() {
    let graph = GraphProto {
        node: vec![
            node("conv", "Conv", &["x", "w"], "c"),
            NodeProto {
                attribute: vec![attr_float("epsilon", 0.001)],
                ..node("bn", "BatchNormalization", &["c", "g", "b", "m", "v"], "n")
            },
            NodeProto {
                attribute: vec![attr_float("alpha", 0.1)],
                ..node("lrelu", "LeakyRelu", &["n"], "y")
            },
        ],
        initializer: vec![
            tensor("w", &[2, 1, 1, 1], vec![1.0, 2.0]),
            tensor("g", &[2], vec![1.0, 1.0]),
            tensor("b", &[2], vec![0.0, 0.0]),
            tensor("m", &[2], vec![0.5, 0.5]),
            tensor("v", &[2], vec![2.0, 2.0]),
        ],
        input: vec![value_info("x", &[1, 1, 4, 4])],
        ..Default::default()
    };
    let loaded = OnnxLoader::from_model(model(graph)).load().unwrap();
    let cx = ConvertContext::new(ModelFormat::Onnx);
    let doc = irconv_core::convert_graph(&cx, loaded.nodes, &loaded.shapes).unwrap();

    assert_eq!(doc.records.len(), 2);
    let conv = doc.record("conv").unwrap();
    assert_eq!(conv.fields["useBatchNormalization"], "True");
    assert_eq!(conv.fields["bn_name"], "bn");
    assert_eq!(conv.fields["activation"], "leakyRelu");
    assert_eq!(conv.fields["alpha"], 0.1);
    let bn = conv.batch_norm.as_ref().unwrap();
    assert_eq!(bn.moving_variance, Some(vec![2.0, 2.0]));
}

#[test]
fn relu_fuses_into_conv_with_skip_connection() {
    let graph = GraphProto {
        node: vec![
            node("conv", "Conv", &["x", "w"], "c"),
            node("relu", "Relu", &["c"], "r"),
            node("add", "Add", &["c", "r"], "y"),
        ],
        initializer: vec![tensor("w", &[3, 3, 1, 1], vec![0.0; 9])],
        input: vec![value_info("x", &[1, 3, 8, 8])],
        ..Default::default()
    };
    let loaded = OnnxLoader::from_model(model(graph)).load().unwrap();
    let cx = ConvertContext::new(ModelFormat::Onnx);
    let doc = irconv_core::convert_graph(&cx, loaded.nodes, &loaded.shapes).unwrap();

    let names: Vec<_> = doc.records.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["x", "conv", "add"]);
    assert_eq!(doc.record("conv").unwrap().fields["activation"], "relu");
    assert_eq!(doc.record("add").unwrap().input_id, vec![1, 1]);
}

#[test]
fn registry_can_disable_fusion() {
    let (model, _) = conv_relu_model();
    let loaded = OnnxLoader::from_model(model).load().unwrap();

    let mut registry = LayerSupportRegistry::empty();
    registry
        .extend_from_json(
            ModelFormat::Onnx,
            r#"[{"layerType": "Relu", "isFusible": "FALSE", "fusibleWith": null}]"#,
        )
        .unwrap();
    let cx = ConvertContext::new(ModelFormat::Onnx).with_registry(registry);
    let doc = irconv_core::convert_graph(&cx, loaded.nodes, &loaded.shapes).unwrap();

    assert_eq!(doc.records.len(), 3);
    let relu = doc.record("relu").unwrap();
    assert_eq!(relu.ty, "Activation");
    assert_eq!(relu.fields["activation"], "relu");
    assert_eq!(relu.input_planes, 4);
    assert!(doc.record("conv").unwrap().field("act_name").is_none());
}

#[test]
fn option_validation_order() {
    let dir = tempfile::tempdir().unwrap();

    let missing = dir.path().join("missing.onnx");
    let err = Converter::new(ConvertOptions::new(&missing)).convert().unwrap_err();
    assert_eq!(err.code(), 103);

    let wrong_ext = dir.path().join("model.pb");
    fs::write(&wrong_ext, b"x").unwrap();
    let err = Converter::new(ConvertOptions::new(&wrong_ext)).convert().unwrap_err();
    assert_eq!(err.code(), 101);

    let empty = dir.path().join("empty.onnx");
    fs::write(&empty, b"").unwrap();
    let err = Converter::new(ConvertOptions::new(&empty).with_framework("TFLite"))
        .convert()
        .unwrap_err();
    assert_eq!(err.code(), 102);

    let (model, _) = conv_relu_model();
    let path = write_model(dir.path(), "net.onnx", &model);
    let err = Converter::new(ConvertOptions::new(&path).with_framework("TFLite"))
        .convert()
        .unwrap_err();
    assert_eq!(err.code(), 104);

    let custom = dir.path().join("custom.txt");
    fs::write(&custom, b"{}").unwrap();
    let err = Converter::new(ConvertOptions::new(&path).with_custom_layers(&custom))
        .convert()
        .unwrap_err();
    assert_eq!(err.code(), 105);

    // Nothing was written along the way.
    assert!(!dir.path().join("net.json").exists());
}

#[test]
fn garbage_model_is_a_load_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.onnx");
    fs::write(&path, [0xff, 0xff, 0xff, 0xff]).unwrap();
    let err = Converter::new(ConvertOptions::new(&path)).convert().unwrap_err();
    assert!(matches!(err, ConvertError::Load(_)));
}
