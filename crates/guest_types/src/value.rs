//! Owned copy of a guest value
//!
//! `GuestValue` is what a guest value becomes once it has been copied out of
//! the engine. It keeps the distinctions a script can observe (undefined vs
//! null, int vs float, key order of objects) and nothing that points back into
//! the guest heap.

use std::fmt;

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Guest Value
// ─────────────────────────────────────────────────────────────────────────────

/// A guest value copied into host memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum GuestValue {
    /// `undefined`
    Undefined,
    /// `null`
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer-valued number
    Int(i64),
    /// Any other number
    Float(f64),
    /// UTF-8 string
    String(String),
    /// Dense array, element order preserved
    Array(Vec<GuestValue>),
    /// Plain object, own enumerable keys in enumeration order
    Object(Vec<(String, GuestValue)>),
}

impl Default for GuestValue {
    fn default() -> Self {
        GuestValue::Undefined
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Accessors
// ─────────────────────────────────────────────────────────────────────────────

impl GuestValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            GuestValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as i64 (also converts from float if lossless)
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            GuestValue::Int(i) => Some(*i),
            GuestValue::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    /// Get as f64 (also converts from int)
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            GuestValue::Float(f) => Some(*f),
            GuestValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            GuestValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[GuestValue]> {
        match self {
            GuestValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&[(String, GuestValue)]> {
        match self {
            GuestValue::Object(fields) => Some(fields),
            _ => None,
        }
    }

    /// Look up an object field by key.
    pub fn get(&self, key: &str) -> Option<&GuestValue> {
        self.as_object()
            .and_then(|fields| fields.iter().find(|(k, _)| k == key).map(|(_, v)| v))
    }

    /// Nesting depth; scalars are depth 0.
    pub fn depth(&self) -> usize {
        match self {
            GuestValue::Array(items) => 1 + items.iter().map(GuestValue::depth).max().unwrap_or(0),
            GuestValue::Object(fields) => {
                1 + fields.iter().map(|(_, v)| v.depth()).max().unwrap_or(0)
            }
            _ => 0,
        }
    }

    /// Build an object from key/value pairs, keeping their order.
    pub fn object_from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<GuestValue>,
    {
        GuestValue::Object(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Display
// ─────────────────────────────────────────────────────────────────────────────

impl fmt::Display for GuestValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuestValue::Undefined => f.write_str("undefined"),
            GuestValue::Null => f.write_str("null"),
            GuestValue::Bool(b) => write!(f, "{b}"),
            GuestValue::Int(i) => write!(f, "{i}"),
            GuestValue::Float(x) => write!(f, "{x}"),
            GuestValue::String(s) => write!(f, "{s:?}"),
            GuestValue::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            GuestValue::Object(fields) => {
                if fields.is_empty() {
                    return f.write_str("{}");
                }
                f.write_str("{ ")?;
                for (i, (key, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}: {value}")?;
                }
                f.write_str(" }")
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// From Implementations
// ─────────────────────────────────────────────────────────────────────────────

impl From<()> for GuestValue {
    fn from(_: ()) -> Self {
        GuestValue::Undefined
    }
}

impl From<bool> for GuestValue {
    fn from(v: bool) -> Self {
        GuestValue::Bool(v)
    }
}

impl From<i32> for GuestValue {
    fn from(v: i32) -> Self {
        GuestValue::Int(v as i64)
    }
}

impl From<i64> for GuestValue {
    fn from(v: i64) -> Self {
        GuestValue::Int(v)
    }
}

impl From<u32> for GuestValue {
    fn from(v: u32) -> Self {
        GuestValue::Int(v as i64)
    }
}

impl From<f64> for GuestValue {
    fn from(v: f64) -> Self {
        GuestValue::Float(v)
    }
}

impl From<String> for GuestValue {
    fn from(v: String) -> Self {
        GuestValue::String(v)
    }
}

impl From<&str> for GuestValue {
    fn from(v: &str) -> Self {
        GuestValue::String(v.to_string())
    }
}

impl<T: Into<GuestValue>> From<Vec<T>> for GuestValue {
    fn from(v: Vec<T>) -> Self {
        GuestValue::Array(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<GuestValue>> From<Option<T>> for GuestValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => GuestValue::Null,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// serde_json::Value Interop
// ─────────────────────────────────────────────────────────────────────────────

impl From<serde_json::Value> for GuestValue {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => GuestValue::Null,
            serde_json::Value::Bool(b) => GuestValue::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    GuestValue::Int(i)
                } else if let Some(f) = n.as_f64() {
                    GuestValue::Float(f)
                } else {
                    GuestValue::Null
                }
            }
            serde_json::Value::String(s) => GuestValue::String(s),
            serde_json::Value::Array(arr) => {
                GuestValue::Array(arr.into_iter().map(GuestValue::from).collect())
            }
            serde_json::Value::Object(obj) => {
                GuestValue::Object(obj.into_iter().map(|(k, v)| (k, GuestValue::from(v))).collect())
            }
        }
    }
}

/// JSON has no `undefined`; it becomes `null`, the same as `JSON.stringify`
/// does for array slots.
impl From<GuestValue> for serde_json::Value {
    fn from(v: GuestValue) -> Self {
        match v {
            GuestValue::Undefined | GuestValue::Null => serde_json::Value::Null,
            GuestValue::Bool(b) => serde_json::Value::Bool(b),
            GuestValue::Int(i) => serde_json::Value::Number(i.into()),
            GuestValue::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            GuestValue::String(s) => serde_json::Value::String(s),
            GuestValue::Array(items) => {
                serde_json::Value::Array(items.into_iter().map(serde_json::Value::from).collect())
            }
            GuestValue::Object(fields) => serde_json::Value::Object(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
