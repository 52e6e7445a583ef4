use std::fs;

use irconv_core::{
    loader::{GraphLoader, KerasConfigLoader},
    tensor::Tensor,
    ConvertContext, ConvertError, ConvertOptions, Converter, ModelFormat,
};
use serde_json::json;

fn layer(class_name: &str, name: &str, config: serde_json::Value, inbound: &[&str]) -> serde_json::Value {
    let mut config = config;
    config["name"] = json!(name);
    let calls: Vec<_> = inbound.iter().map(|i| json!([i, 0, 0, {}])).collect();
    let inbound_nodes = if calls.is_empty() {
        json!([])
    } else {
        json!([calls])
    };
    json!({
        "class_name": class_name,
        "name": name,
        "config": config,
        "inbound_nodes": inbound_nodes,
    })
}

fn functional(layers: Vec<serde_json::Value>) -> serde_json::Value {
    json!({"class_name": "Functional", "config": {"name": "model", "layers": layers}})
}

fn input(name: &str, channels: i64) -> serde_json::Value {
    layer(
        "InputLayer",
        name,
        json!({"batch_input_shape": [null, 4, 4, channels]}),
        &[],
    )
}

fn bn_weights(loader: KerasConfigLoader, name: &str, n: usize) -> KerasConfigLoader {
    loader
        .with_weight(name, "gamma", Tensor::from_vec(vec![1.0; n]))
        .with_weight(name, "beta", Tensor::from_vec(vec![0.0; n]))
        .with_weight(name, "moving_mean", Tensor::from_vec(vec![0.0; n]))
        .with_weight(name, "moving_variance", Tensor::from_vec(vec![1.0; n]))
}

#[test]
fn conv_chain_reorders_and_fuses() {
    let config = functional(vec![
        input("in", 3),
        layer(
            "Conv2D",
            "conv",
            json!({"filters": 2, "kernel_size": [1, 1], "strides": [1, 1], "padding": "same",
                   "activation": "linear", "use_bias": false}),
            &["in"],
        ),
        layer("BatchNormalization", "bn", json!({"epsilon": 0.001}), &["conv"]),
        layer("ReLU", "relu", json!({}), &["bn"]),
        layer("Dropout", "drop", json!({"rate": 0.5}), &["relu"]),
        layer("Add", "add", json!({}), &["drop", "in"]),
    ]);
    // (kh, kw, in, out) = (1, 1, 3, 2); value = in * 2 + out
    let kernel = Tensor::new(vec![1, 1, 3, 2], (0..6).map(|x| x as f32).collect());
    let loader = KerasConfigLoader::new(config)
        .with_weight_path("model/conv/kernel:0", kernel)
        .unwrap();
    let mut loader = bn_weights(loader, "bn", 2);
    let loaded = loader.load().unwrap();

    let cx = ConvertContext::new(ModelFormat::Keras);
    let doc = irconv_core::convert_graph(&cx, loaded.nodes, &loaded.shapes).unwrap();

    let names: Vec<_> = doc.records.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["in", "conv", "add"]);

    let conv = doc.record("conv").unwrap();
    assert_eq!(conv.weights.as_ref().unwrap().kernel, vec![0., 2., 4., 1., 3., 5.]);
    assert_eq!(conv.fields["useBias"], "False");
    assert_eq!(conv.fields["useBatchNormalization"], "True");
    assert_eq!(conv.fields["bn_name"], "bn");
    assert_eq!(conv.fields["activation"], "relu");
    assert_eq!(conv.fields["act_name"], "relu");
    assert_eq!(conv.fields["padding"], "same");
    assert_eq!(conv.input_planes, 3);
    assert_eq!(conv.output_planes, Some(2));

    let add = doc.record("add").unwrap();
    assert_eq!(add.input_id, vec![1, 0]);
    assert_eq!(add.num_inputs, 2);
    assert_eq!(add.input_planes, 2);
}

#[test]
fn depthwise_kernel_is_reordered() {
    let config = functional(vec![
        input("in", 2),
        layer(
            "DepthwiseConv2D",
            "dw",
            json!({"kernel_size": [1, 1], "strides": [1, 1], "padding": "valid",
                   "depth_multiplier": 2, "activation": "linear", "use_bias": false}),
            &["in"],
        ),
    ]);
    // (kh, kw, in, multiplier) = (1, 1, 2, 2); value = in * 2 + m
    let kernel = Tensor::new(vec![1, 1, 2, 2], (0..4).map(|x| x as f32).collect());
    let mut loader = KerasConfigLoader::new(config)
        .with_weight_path("model/dw/depthwise_kernel:0", kernel)
        .unwrap();
    let loaded = loader.load().unwrap();

    let cx = ConvertContext::new(ModelFormat::Keras);
    let doc = irconv_core::convert_graph(&cx, loaded.nodes, &loaded.shapes).unwrap();

    let dw = doc.record("dw").unwrap();
    assert_eq!(dw.ty, "DepthwiseConv2D");
    assert_eq!(dw.weights.as_ref().unwrap().kernel, vec![0., 2., 1., 3.]);
    assert_eq!(dw.fields["depth_multiplier"], 2);
    assert_eq!(dw.input_planes, 2);
    assert_eq!(dw.output_planes, Some(4));
}

#[test]
fn container_reference_goes_to_last_leaf() {
    let block = json!({
        "class_name": "Sequential",
        "name": "block",
        "config": {"name": "block", "layers": [
            {"class_name": "Activation", "config": {"name": "l1", "activation": "relu"}},
            {"class_name": "Activation", "config": {"name": "l2", "activation": "tanh"}},
            {"class_name": "Activation", "config": {"name": "l3", "activation": "sigmoid"}}
        ]},
        "inbound_nodes": [[["in", 0, 0, {}]]]
    });
    let config = functional(vec![
        input("in", 8),
        block,
        layer("Flatten", "flat", json!({}), &["block"]),
    ]);
    let loaded = KerasConfigLoader::new(config).load().unwrap();
    let cx = ConvertContext::new(ModelFormat::Keras);
    let doc = irconv_core::convert_graph(&cx, loaded.nodes, &loaded.shapes).unwrap();

    let names: Vec<_> = doc.records.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["in", "l1", "l2", "l3", "flat"]);
    assert!(doc.record("block").is_none());

    let flat = doc.record("flat").unwrap();
    assert_eq!(flat.input_id, vec![3]);
    assert_eq!(flat.input_planes, 8);
    assert_eq!(flat.output_planes, Some(8));
    assert_eq!(doc.record("l1").unwrap().input_id, vec![0]);
}

#[test]
fn backward_reference_is_rejected() {
    let config = functional(vec![
        input("in", 3),
        layer("Activation", "a", json!({"activation": "relu"}), &["b"]),
        layer("Activation", "b", json!({"activation": "relu"}), &["in"]),
    ]);
    let loaded = KerasConfigLoader::new(config).load().unwrap();
    let cx = ConvertContext::new(ModelFormat::Keras);
    let err = irconv_core::convert_graph(&cx, loaded.nodes, &loaded.shapes).unwrap_err();
    assert!(matches!(err, ConvertError::InvalidGraph(_)));
}

#[test]
fn h5_needs_a_loader() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.h5");
    fs::write(&path, b"\x89HDF").unwrap();

    let err = Converter::new(ConvertOptions::new(&path)).convert().unwrap_err();
    assert!(matches!(err, ConvertError::NoLoader(ModelFormat::Keras)));
}

#[test]
fn custom_layers_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.h5");
    fs::write(&path, b"\x89HDF").unwrap();
    let custom = dir.path().join("custom.json");
    fs::write(
        &custom,
        r#"{"layers": [{"layerType": "SubPixel", "irType": "PixelShuffle", "outputPlanes": 3,
                        "attributes": ["upscale"]}],
            "constants": {"scale_x": 2}}"#,
    )
    .unwrap();

    let config = functional(vec![
        input("in", 12),
        layer("SubPixel", "sp", json!({"upscale": "scale_x"}), &["in"]),
        layer("Calculate", "calc", json!({}), &["sp"]),
    ]);
    let loader = KerasConfigLoader::new(config);
    let written = Converter::new(
        ConvertOptions::new(&path)
            .with_custom_layers(&custom)
            .with_output_dir(dir.path().join("ir")),
    )
    .with_loader(Box::new(loader))
    .convert()
    .unwrap();
    assert_eq!(written, vec![dir.path().join("ir/model.json")]);

    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&written[0]).unwrap()).unwrap();
    let sp = &json["Layer_1"];
    assert_eq!(sp["type"], "PixelShuffle");
    assert_eq!(sp["upscale"], 2);
    assert_eq!(sp["inputPlanes"], 12);
    assert_eq!(sp["outputPlanes"], 3);
    let calc = &json["Layer_2"];
    assert_eq!(calc["type"], "Calculate");
    assert_eq!(calc["outputPlanes"], 3);
}

#[test]
fn malformed_custom_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.h5");
    fs::write(&path, b"\x89HDF").unwrap();
    let custom = dir.path().join("custom.json");
    fs::write(&custom, r#"{"layer": []}"#).unwrap();

    let loader = KerasConfigLoader::new(functional(vec![input("in", 3)]));
    let err = Converter::new(ConvertOptions::new(&path).with_custom_layers(&custom))
        .with_loader(Box::new(loader))
        .convert()
        .unwrap_err();
    assert_eq!(err.code(), 105);
}
