use serde_json::Value as Json;

/// A single attribute value as found in a model file.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Int(i64),
    Float(f32),
    Bool(bool),
    Str(String),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
    Strs(Vec<String>),
    /// Anything that does not fit the shapes above (nested lists, objects).
    Json(Json),
}

impl AttrValue {
    /// Converts a JSON value from a Keras layer config.
    pub fn from_json(value: &Json) -> Self {
        match value {
            Json::Bool(b) => AttrValue::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => AttrValue::Int(i),
                None => AttrValue::Float(n.as_f64().unwrap_or_default() as f32),
            },
            Json::String(s) => AttrValue::Str(s.clone()),
            Json::Array(xs) if !xs.is_empty() && xs.iter().all(|x| x.is_i64()) => {
                AttrValue::Ints(xs.iter().filter_map(Json::as_i64).collect())
            }
            Json::Array(xs) if !xs.is_empty() && xs.iter().all(Json::is_number) => {
                AttrValue::Floats(xs.iter().filter_map(|x| x.as_f64().map(|f| f as f32)).collect())
            }
            Json::Array(xs) if !xs.is_empty() && xs.iter().all(Json::is_string) => {
                AttrValue::Strs(
                    xs.iter()
                        .filter_map(|x| x.as_str().map(str::to_owned))
                        .collect(),
                )
            }
            other => AttrValue::Json(other.clone()),
        }
    }

    /// Converts back into JSON for emission.
    pub fn to_json(&self) -> Json {
        match self {
            AttrValue::Int(i) => Json::from(*i),
            AttrValue::Float(f) => Json::from(*f as f64),
            AttrValue::Bool(b) => Json::from(*b),
            AttrValue::Str(s) => Json::from(s.as_str()),
            AttrValue::Ints(xs) => Json::from(xs.clone()),
            AttrValue::Floats(xs) => xs.iter().map(|&x| Json::from(x as f64)).collect(),
            AttrValue::Strs(xs) => Json::from(xs.clone()),
            AttrValue::Json(j) => j.clone(),
        }
    }
}

/// Ordered attribute list. Keys are unique; `set` replaces in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes(Vec<(String, AttrValue)>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn set(&mut self, key: impl Into<String>, value: AttrValue) {
        let key = key.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn int(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            AttrValue::Int(i) => Some(*i),
            AttrValue::Float(f) => Some(*f as i64),
            AttrValue::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn float(&self, key: &str) -> Option<f32> {
        match self.get(key)? {
            AttrValue::Float(f) => Some(*f),
            AttrValue::Int(i) => Some(*i as f32),
            _ => None,
        }
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            AttrValue::Bool(b) => Some(*b),
            AttrValue::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        match self.get(key)? {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Integer list; a scalar integer is returned as a one-element list.
    pub fn ints(&self, key: &str) -> Option<Vec<i64>> {
        match self.get(key)? {
            AttrValue::Ints(xs) => Some(xs.clone()),
            AttrValue::Int(i) => Some(vec![*i]),
            AttrValue::Floats(xs) => Some(xs.iter().map(|&x| x as i64).collect()),
            AttrValue::Json(Json::Array(xs)) => {
                // Keras input shapes carry `null` for the batch dimension.
                Some(xs.iter().map(|x| x.as_i64().unwrap_or(-1)).collect())
            }
            _ => None,
        }
    }

    pub fn strs(&self, key: &str) -> Option<&[String]> {
        match self.get(key)? {
            AttrValue::Strs(xs) => Some(xs),
            _ => None,
        }
    }
}

impl FromIterator<(String, AttrValue)> for Attributes {
    fn from_iter<T: IntoIterator<Item = (String, AttrValue)>>(iter: T) -> Self {
        let mut attrs = Attributes::new();
        for (k, v) in iter {
            attrs.set(k, v);
        }
        attrs
    }
}

#[test]
fn attrs_from_keras_json() {
    let config: Json = serde_json::json!({
        "filters": 16,
        "kernel_size": [3, 3],
        "padding": "same",
        "use_bias": true,
        "batch_input_shape": [null, 32, 32, 3],
        "alpha": 0.3,
    });
    let attrs: Attributes = config
        .as_object()
        .unwrap()
        .iter()
        .map(|(k, v)| (k.clone(), AttrValue::from_json(v)))
        .collect();
    assert_eq!(attrs.int("filters"), Some(16));
    assert_eq!(attrs.ints("kernel_size"), Some(vec![3, 3]));
    assert_eq!(attrs.str("padding"), Some("same"));
    assert_eq!(attrs.bool("use_bias"), Some(true));
    assert_eq!(attrs.ints("batch_input_shape"), Some(vec![-1, 32, 32, 3]));
    assert!((attrs.float("alpha").unwrap() - 0.3).abs() < 1e-6);
}
