use serde::{ser::SerializeMap, Serialize, Serializer};
use serde_json::{Map, Number, Value as Json};

use crate::weights::BatchNormWeights;

/// How a record's input plane count is derived from its operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaneRule {
    /// Sum over all operands.
    #[default]
    Sum,
    /// First operand only (elementwise ops).
    First,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KernelWeights {
    pub kernel: Vec<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bias: Option<Vec<f32>>,
}

/// One layer of the output IR.
#[derive(Debug, Clone, PartialEq)]
pub struct IrRecord {
    pub name: String,
    pub ty: String,
    /// Symbolic inbound references, resolved into `input_id`.
    pub inbounds: Vec<String>,
    pub input_id: Vec<usize>,
    pub num_inputs: usize,
    pub input_planes: u32,
    pub output_planes: Option<u32>,
    /// Type-specific fields, in emission order.
    pub fields: Map<String, Json>,
    pub weights: Option<KernelWeights>,
    pub batch_norm: Option<BatchNormWeights>,
    pub plane_rule: PlaneRule,
}

impl IrRecord {
    pub fn new(name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
            inbounds: Vec::new(),
            input_id: Vec::new(),
            num_inputs: 0,
            input_planes: 0,
            output_planes: None,
            fields: Map::new(),
            weights: None,
            batch_norm: None,
            plane_rule: PlaneRule::Sum,
        }
    }

    pub fn with_inbounds(mut self, inbounds: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.inbounds = inbounds.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_output_planes(mut self, planes: impl Into<Option<u32>>) -> Self {
        self.output_planes = planes.into();
        self
    }

    pub fn with_plane_rule(mut self, rule: PlaneRule) -> Self {
        self.plane_rule = rule;
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<Json>) {
        self.fields.insert(key.to_owned(), value.into());
    }

    pub fn set_opt(&mut self, key: &str, value: Option<impl Into<Json>>) {
        if let Some(value) = value {
            self.set(key, value);
        }
    }

    pub fn field(&self, key: &str) -> Option<&Json> {
        self.fields.get(key)
    }

    /// Record as a JSON object; weight arrays are included only when `embed_weights` is set.
    pub fn to_json(&self, embed_weights: bool) -> Json {
        serde_json::to_value(RecordJson {
            record: self,
            embed_weights,
        })
        .unwrap_or(Json::Null)
    }
}

/// Engine-facing spelling of a boolean.
pub fn py_bool(b: bool) -> &'static str {
    if b {
        "True"
    } else {
        "False"
    }
}

/// JSON number holding the shortest decimal that round-trips `x` as an `f32`.
pub fn json_f32(x: f32) -> Json {
    x.to_string()
        .parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map_or(Json::Null, Json::Number)
}

struct RecordJson<'a> {
    record: &'a IrRecord,
    embed_weights: bool,
}

impl Serialize for RecordJson<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let r = self.record;
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("name", &r.name)?;
        map.serialize_entry("type", &r.ty)?;
        for (key, value) in &r.fields {
            map.serialize_entry(key, value)?;
        }
        if self.embed_weights {
            if let Some(weights) = &r.weights {
                map.serialize_entry("weights", weights)?;
            }
            if let Some(bn) = &r.batch_norm {
                map.serialize_entry("batchNormalization", bn)?;
            }
        }
        map.serialize_entry("numInputs", &r.num_inputs)?;
        map.serialize_entry("inputId", &r.input_id)?;
        map.serialize_entry("inputPlanes", &r.input_planes)?;
        map.serialize_entry("outputPlanes", &r.output_planes.unwrap_or(r.input_planes))?;
        map.end()
    }
}

/// The complete IR: a header followed by `Layer_<i>` records.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IrDocument {
    pub records: Vec<IrRecord>,
    /// Set when weights live in a separate binary file.
    pub bin_file_name: Option<String>,
}

#[derive(Serialize)]
struct Header<'a> {
    count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    bin_file_name: Option<&'a str>,
}

impl Serialize for IrDocument {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.records.len() + 1))?;
        map.serialize_entry(
            "numLayers",
            &Header {
                count: self.records.len(),
                bin_file_name: self.bin_file_name.as_deref(),
            },
        )?;
        let embed_weights = self.bin_file_name.is_none();
        for (i, record) in self.records.iter().enumerate() {
            map.serialize_entry(
                &format!("Layer_{i}"),
                &RecordJson {
                    record,
                    embed_weights,
                },
            )?;
        }
        map.end()
    }
}

impl IrDocument {
    /// Pretty-printed with four-space indentation.
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.serialize(&mut ser)?;
        // serde_json only ever writes UTF-8.
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    pub fn record(&self, name: &str) -> Option<&IrRecord> {
        self.records.iter().find(|r| r.name == name)
    }
}

#[test]
fn record_layout() {
    let mut record = IrRecord::new("conv", "Conv2D").with_output_planes(4u32);
    record.set("kernel_size", 3);
    record.set("useBias", py_bool(true));
    record.weights = Some(KernelWeights {
        kernel: vec![0.5],
        bias: None,
    });
    record.input_id = vec![0];
    record.num_inputs = 1;
    record.input_planes = 3;

    let embedded = record.to_json(true);
    let keys: Vec<_> = embedded.as_object().unwrap().keys().cloned().collect();
    assert_eq!(
        keys,
        vec![
            "name",
            "type",
            "kernel_size",
            "useBias",
            "weights",
            "numInputs",
            "inputId",
            "inputPlanes",
            "outputPlanes"
        ]
    );
    assert!(record.to_json(false).get("weights").is_none());
}

#[test]
fn document_text() {
    let mut input = IrRecord::new("in", "InputLayer").with_output_planes(3u32);
    input.set("alpha", json_f32(0.3));
    let doc = IrDocument {
        records: vec![input],
        bin_file_name: None,
    };
    insta::assert_snapshot!(doc.to_json_string().unwrap(), @r###"
    {
        "numLayers": {
            "count": 1
        },
        "Layer_0": {
            "name": "in",
            "type": "InputLayer",
            "alpha": 0.3,
            "numInputs": 0,
            "inputId": [],
            "inputPlanes": 0,
            "outputPlanes": 3
        }
    }
    "###);
}
