//! Expected field shapes for each stage's structured reply.

use serde_json::{Map, Value};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Bool,
    Text,
    TextList,
    Number,
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    /// Value used when the reply omits the field or it cannot be coerced.
    pub default: Value,
}

/// The set of fields a stage expects back from the text generator.
///
/// ```
/// use sql_agent::parser::StageSchema;
/// use serde_json::json;
///
/// let schema = StageSchema::new("validate")
///     .bool("is_sql_valid", false)
///     .list("issues");
/// let fields = schema.normalize(json!({"is_sql_valid": "yes"}).as_object().unwrap().clone());
/// assert!(fields.get_bool("is_sql_valid"));
/// assert!(fields.get_list("issues").is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct StageSchema {
    name: &'static str,
    fields: Vec<FieldSpec>,
}

impl StageSchema {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            fields: Vec::new(),
        }
    }

    pub fn bool(self, name: &'static str, default: bool) -> Self {
        self.field(name, FieldKind::Bool, Value::Bool(default))
    }

    pub fn text(self, name: &'static str, default: &str) -> Self {
        self.field(name, FieldKind::Text, Value::String(default.to_string()))
    }

    pub fn list(self, name: &'static str) -> Self {
        self.field(name, FieldKind::TextList, Value::Array(Vec::new()))
    }

    pub fn number(self, name: &'static str) -> Self {
        self.field(name, FieldKind::Number, Value::Null)
    }

    fn field(mut self, name: &'static str, kind: FieldKind, default: Value) -> Self {
        self.fields.push(FieldSpec { name, kind, default });
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Whether any declared field appears in `raw`.
    pub fn matches_any(&self, raw: &Map<String, Value>) -> bool {
        self.fields.iter().any(|f| raw.contains_key(f.name))
    }

    /// Coerce `raw` into the declared shape. Missing or uncoercible fields
    /// take their defaults; undeclared keys are kept as-is.
    pub fn normalize(&self, mut raw: Map<String, Value>) -> FieldMap {
        let mut values = Map::new();
        let mut present = BTreeSet::new();

        for spec in &self.fields {
            match raw.remove(spec.name).and_then(|v| coerce(spec.kind, v)) {
                Some(v) => {
                    present.insert(spec.name.to_string());
                    values.insert(spec.name.to_string(), v);
                }
                None => {
                    values.insert(spec.name.to_string(), spec.default.clone());
                }
            }
        }
        for (key, value) in raw {
            present.insert(key.clone());
            values.insert(key, value);
        }

        FieldMap { values, present }
    }

    /// A map holding only defaults.
    pub fn defaults(&self) -> FieldMap {
        self.normalize(Map::new())
    }
}

fn coerce(kind: FieldKind, value: Value) -> Option<Value> {
    match (kind, value) {
        (_, Value::Null) => None,
        (FieldKind::Bool, Value::Bool(b)) => Some(Value::Bool(b)),
        (FieldKind::Bool, Value::Number(n)) => Some(Value::Bool(n.as_f64().is_some_and(|f| f != 0.0))),
        (FieldKind::Bool, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "y" | "1" => Some(Value::Bool(true)),
            "false" | "no" | "n" | "0" => Some(Value::Bool(false)),
            _ => None,
        },
        (FieldKind::Bool, _) => None,

        (FieldKind::Text, Value::String(s)) => Some(Value::String(s)),
        (FieldKind::Text, Value::Array(items)) => {
            let joined = items.iter().map(scalar_text).collect::<Vec<_>>().join("; ");
            Some(Value::String(joined))
        }
        (FieldKind::Text, other) => Some(Value::String(scalar_text(&other))),

        (FieldKind::TextList, Value::Array(items)) => Some(Value::Array(
            items
                .iter()
                .filter(|v| !v.is_null())
                .map(|v| Value::String(scalar_text(v)))
                .collect(),
        )),
        (FieldKind::TextList, Value::String(s)) => {
            if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(&s) {
                return coerce(FieldKind::TextList, Value::Array(items));
            }
            Some(Value::Array(
                s.split(',')
                    .map(str::trim)
                    .filter(|part| !part.is_empty())
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
            ))
        }
        (FieldKind::TextList, _) => None,

        (FieldKind::Number, Value::Number(n)) => Some(Value::Number(n)),
        (FieldKind::Number, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number),
        (FieldKind::Number, _) => None,
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A stage reply after normalization, with typed accessors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldMap {
    values: Map<String, Value>,
    present: BTreeSet<String>,
}

impl FieldMap {
    /// Whether the reply actually supplied `name`, as opposed to a default.
    pub fn is_present(&self, name: &str) -> bool {
        self.present.contains(name)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn get_bool(&self, name: &str) -> bool {
        self.values.get(name).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn get_text(&self, name: &str) -> String {
        self.values
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    pub fn get_list(&self, name: &str) -> Vec<String> {
        self.values
            .get(name)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get_number(&self, name: &str) -> Option<f64> {
        self.values.get(name).and_then(Value::as_f64)
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.values
    }
}
