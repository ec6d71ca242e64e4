//! Argument and result values carried by requests and responses.
//!
//! [`RpcValue`] is a self-describing value tree. Unlike `serde_json::Value`
//! it round-trips through non-self-describing formats such as postcard,
//! which is what lets the binary and JSON codecs share one data model.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RpcValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<RpcValue>),
    Map(BTreeMap<String, RpcValue>),
}

impl RpcValue {
    /// Type descriptor sent alongside each argument.
    pub fn type_name(&self) -> &'static str {
        match self {
            RpcValue::Null => "null",
            RpcValue::Bool(_) => "bool",
            RpcValue::Int(_) => "int",
            RpcValue::Float(_) => "float",
            RpcValue::Str(_) => "string",
            RpcValue::Bytes(_) => "bytes",
            RpcValue::List(_) => "list",
            RpcValue::Map(_) => "map",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RpcValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RpcValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RpcValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for RpcValue {
    fn from(s: &str) -> Self {
        RpcValue::Str(s.to_string())
    }
}

impl From<String> for RpcValue {
    fn from(s: String) -> Self {
        RpcValue::Str(s)
    }
}

impl From<i64> for RpcValue {
    fn from(n: i64) -> Self {
        RpcValue::Int(n)
    }
}

impl From<bool> for RpcValue {
    fn from(b: bool) -> Self {
        RpcValue::Bool(b)
    }
}

impl From<f64> for RpcValue {
    fn from(f: f64) -> Self {
        RpcValue::Float(f)
    }
}

impl From<Vec<RpcValue>> for RpcValue {
    fn from(items: Vec<RpcValue>) -> Self {
        RpcValue::List(items)
    }
}

impl From<serde_json::Value> for RpcValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => RpcValue::Null,
            serde_json::Value::Bool(b) => RpcValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => RpcValue::Int(i),
                None => RpcValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => RpcValue::Str(s),
            serde_json::Value::Array(items) => {
                RpcValue::List(items.into_iter().map(RpcValue::from).collect())
            }
            serde_json::Value::Object(map) => RpcValue::Map(
                map.into_iter().map(|(k, v)| (k, RpcValue::from(v))).collect(),
            ),
        }
    }
}

impl From<RpcValue> for serde_json::Value {
    fn from(value: RpcValue) -> Self {
        match value {
            RpcValue::Null => serde_json::Value::Null,
            RpcValue::Bool(b) => serde_json::Value::Bool(b),
            RpcValue::Int(n) => serde_json::Value::from(n),
            // NaN and infinities have no JSON form
            RpcValue::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            RpcValue::Str(s) => serde_json::Value::String(s),
            RpcValue::Bytes(bytes) => serde_json::Value::Array(
                bytes.into_iter().map(serde_json::Value::from).collect(),
            ),
            RpcValue::List(items) => {
                serde_json::Value::Array(items.into_iter().map(serde_json::Value::from).collect())
            }
            RpcValue::Map(map) => serde_json::Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}
