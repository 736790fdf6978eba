//! Value model for telemetry state.
//!
//! Telemetry has no fixed schema, so state is a tree of tagged values.
//! Merge and interpolation policies recurse over this tree structurally.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Rolled-up (or partial) state: field name to value.
///
/// Ordered so that iteration, diffing and JSON export are deterministic.
pub type State = BTreeMap<String, Value>;

/// A single telemetry value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    /// Opaque binary payload (image bytes, packed point clouds)
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Map(State),
}

impl Value {
    /// Returns the number if this is `Value::Number`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }
    
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
    
    pub fn as_map(&self) -> Option<&State> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
    
    pub fn as_map_mut(&mut self) -> Option<&mut State> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
    
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }
    
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
    
    /// Converts to a `serde_json::Value`.
    ///
    /// Bytes become an array of numbers; non-finite numbers become null.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(bytes) => serde_json::Value::Array(
                bytes.iter().map(|b| serde_json::Value::from(*b)).collect(),
            ),
            Value::Array(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => state_to_json(map),
        }
    }
}

/// Converts a whole state to a JSON object.
pub fn state_to_json(state: &State) -> serde_json::Value {
    serde_json::Value::Object(
        state
            .iter()
            .map(|(key, value)| (key.clone(), value.to_json()))
            .collect(),
    )
}

/// Linear interpolation between `a` and `b`.
pub fn lerp(a: f64, b: f64, ratio: f64) -> f64 {
    a + (b - a) * ratio
}

// ============================================================================
// CONVERSIONS
// ============================================================================

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => n.as_f64().map(Value::Number).unwrap_or(Value::Null),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<f32> for Value {
    fn from(n: f32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

impl From<Vec<f64>> for Value {
    fn from(items: Vec<f64>) -> Self {
        Value::Array(items.into_iter().map(Value::Number).collect())
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<State> for Value {
    fn from(map: State) -> Self {
        Value::Map(map)
    }
}

/// Builds a [`State`] from `key => value` pairs.
///
/// ```ignore
/// let s = state! { "a" => 1.0, "mode" => "drive" };
/// ```
#[macro_export]
macro_rules! state {
    () => {
        $crate::value::State::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut state = $crate::value::State::new();
        $(
            state.insert(($key).to_string(), $crate::value::Value::from($value));
        )+
        state
    }};
}
