//! Closed representation for the free-form JSON carried in tool inputs,
//! tool outputs and push payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnyValue {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<AnyValue>),
    Map(BTreeMap<String, AnyValue>),
}

impl AnyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AnyValue::String(value) => Some(value.as_str()),
            _ => None,
        }
    }

    /// Renders scalars as text. Push providers are inconsistent about
    /// sending ids as strings or numbers, so both are accepted.
    pub fn as_text(&self) -> Option<String> {
        match self {
            AnyValue::String(value) => Some(value.clone()),
            AnyValue::Number(value) if value.fract() == 0.0 && value.is_finite() => {
                Some(format!("{}", *value as i64))
            }
            AnyValue::Number(value) => Some(value.to_string()),
            AnyValue::Bool(value) => Some(value.to_string()),
            AnyValue::Null | AnyValue::List(_) | AnyValue::Map(_) => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, AnyValue::Null)
    }

    pub fn get(&self, key: &str) -> Option<&AnyValue> {
        match self {
            AnyValue::Map(map) => map.get(key),
            _ => None,
        }
    }
}

impl From<Value> for AnyValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => AnyValue::Null,
            Value::Bool(value) => AnyValue::Bool(value),
            Value::Number(number) => AnyValue::Number(number.as_f64().unwrap_or(0.0)),
            Value::String(value) => AnyValue::String(value),
            Value::Array(items) => AnyValue::List(items.into_iter().map(AnyValue::from).collect()),
            Value::Object(map) => AnyValue::Map(
                map.into_iter()
                    .map(|(key, value)| (key, AnyValue::from(value)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for AnyValue {
    fn from(value: &str) -> Self {
        AnyValue::String(value.to_string())
    }
}

impl From<String> for AnyValue {
    fn from(value: String) -> Self {
        AnyValue::String(value)
    }
}
