//! Runtime values and their serializable wire form.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A raised throwable: type name plus optional message
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Throwable {
    pub type_name: String,
    pub message: Option<String>,
}

impl Throwable {
    pub fn new(type_name: &str, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.to_string(),
            message: Some(message.into()),
        }
    }

    pub fn bare(type_name: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            message: None,
        }
    }

    /// Message text, `"null"` when absent
    pub fn message_text(&self) -> &str {
        self.message.as_deref().unwrap_or("null")
    }
}

impl fmt::Display for Throwable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{}: {}", self.type_name, msg),
            None => write!(f, "{}", self.type_name),
        }
    }
}

/// Instance of a compiled unit
#[derive(Debug)]
pub struct Object {
    pub class: String,
    pub fields: BTreeMap<String, Value>,
}

pub type ObjectRef = Arc<Mutex<Object>>;
pub type ArrayRef = Arc<Mutex<Vec<Value>>>;

#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    Str(String),
    Object(ObjectRef),
    Array(ArrayRef),
    Throwable(Arc<Throwable>),
    Map(Arc<BTreeMap<String, Value>>),
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric value widened to double
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_throwable(&self) -> Option<&Arc<Throwable>> {
        match self {
            Value::Throwable(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Runtime type name as used in parameter lists
    pub fn type_name(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(_) => "bool".to_string(),
            Value::Int(_) => "int".to_string(),
            Value::Double(_) => "double".to_string(),
            Value::Str(_) => "std.String".to_string(),
            Value::Object(obj) => lock(obj).class.clone(),
            Value::Array(_) => "std.Array".to_string(),
            Value::Throwable(t) => t.type_name.clone(),
            Value::Map(_) => "std.Map".to_string(),
        }
    }

    /// String conversion used by concatenation and console output
    pub fn render(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Double(d) => render_double(*d),
            Value::Str(s) => s.clone(),
            Value::Object(obj) => format!("{}@{:x}", lock(obj).class, Arc::as_ptr(obj) as usize),
            Value::Array(items) => {
                let items = lock(items);
                let parts: Vec<String> = items.iter().map(Value::render).collect();
                format!("[{}]", parts.join(", "))
            }
            Value::Throwable(t) => t.to_string(),
            Value::Map(map) => {
                let parts: Vec<String> = map
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v.render()))
                    .collect();
                format!("{{{}}}", parts.join(", "))
            }
        }
    }

    pub fn to_wire(&self) -> WireValue {
        match self {
            Value::Null => WireValue::Null,
            Value::Bool(b) => WireValue::Bool(*b),
            Value::Int(i) => WireValue::Int(*i),
            Value::Double(d) => WireValue::Double(*d),
            Value::Str(s) => WireValue::Str(s.clone()),
            Value::Object(obj) => {
                let obj = lock(obj);
                WireValue::Object {
                    class: obj.class.clone(),
                    fields: obj
                        .fields
                        .iter()
                        .map(|(k, v)| (k.clone(), v.to_wire()))
                        .collect(),
                }
            }
            Value::Array(items) => WireValue::Array(lock(items).iter().map(Value::to_wire).collect()),
            Value::Throwable(t) => WireValue::Throwable(t.as_ref().clone()),
            Value::Map(map) => {
                WireValue::Map(map.iter().map(|(k, v)| (k.clone(), v.to_wire())).collect())
            }
        }
    }
}

fn render_double(d: f64) -> String {
    if d.is_finite() && d.fract() == 0.0 && d.abs() < 1e15 {
        format!("{:.1}", d)
    } else {
        d.to_string()
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::Int(a), Value::Double(b)) | (Value::Double(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(a, b),
            (Value::Throwable(a), Value::Throwable(b)) => Arc::ptr_eq(a, b) || a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

/// Serializable value for crossing process boundaries and report output
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value")]
pub enum WireValue {
    #[serde(rename = "null")]
    Null,
    #[serde(rename = "bool")]
    Bool(bool),
    #[serde(rename = "int")]
    Int(i64),
    #[serde(rename = "double")]
    Double(f64),
    #[serde(rename = "string")]
    Str(String),
    #[serde(rename = "object")]
    Object {
        class: String,
        fields: BTreeMap<String, WireValue>,
    },
    #[serde(rename = "array")]
    Array(Vec<WireValue>),
    #[serde(rename = "throwable")]
    Throwable(Throwable),
    #[serde(rename = "map")]
    Map(BTreeMap<String, WireValue>),
}

impl WireValue {
    pub fn into_value(self) -> Value {
        match self {
            WireValue::Null => Value::Null,
            WireValue::Bool(b) => Value::Bool(b),
            WireValue::Int(i) => Value::Int(i),
            WireValue::Double(d) => Value::Double(d),
            WireValue::Str(s) => Value::Str(s),
            WireValue::Object { class, fields } => Value::Object(Arc::new(Mutex::new(Object {
                class,
                fields: fields
                    .into_iter()
                    .map(|(k, v)| (k, v.into_value()))
                    .collect(),
            }))),
            WireValue::Array(items) => Value::Array(Arc::new(Mutex::new(
                items.into_iter().map(WireValue::into_value).collect(),
            ))),
            WireValue::Throwable(t) => Value::Throwable(Arc::new(t)),
            WireValue::Map(map) => Value::Map(Arc::new(
                map.into_iter().map(|(k, v)| (k, v.into_value())).collect(),
            )),
        }
    }
}

/// Lock a runtime cell, ignoring poisoning left behind by an abandoned worker
pub(crate) fn lock<T>(cell: &Mutex<T>) -> MutexGuard<'_, T> {
    cell.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_matches_console_conventions() {
        assert_eq!(Value::Double(2.0).render(), "2.0");
        assert_eq!(Value::Double(2.5).render(), "2.5");
        assert_eq!(Value::Int(-7).render(), "-7");
        assert_eq!(Value::Null.render(), "null");
        let t = Value::Throwable(Arc::new(Throwable::new("std.Exception", "boom")));
        assert_eq!(t.render(), "std.Exception: boom");
    }

    #[test]
    fn test_numeric_equality_widens() {
        assert_eq!(Value::Int(3), Value::Double(3.0));
        assert_ne!(Value::Int(3), Value::Str("3".into()));
    }

    #[test]
    fn test_object_equality_is_identity() {
        let a = Value::Object(Arc::new(Mutex::new(Object {
            class: "P".into(),
            fields: BTreeMap::new(),
        })));
        let b = WireValue::Object {
            class: "P".into(),
            fields: BTreeMap::new(),
        }
        .into_value();
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert_eq!(b.type_name(), "P");
    }

    #[test]
    fn test_wire_conversion_keeps_throwable_details() {
        let mut map = BTreeMap::new();
        map.insert(
            "throwable".to_string(),
            Value::Throwable(Arc::new(Throwable::new("std.AssertionError", "expected 1"))),
        );
        map.insert("score".to_string(), Value::Null);
        let wire = Value::Map(Arc::new(map)).to_wire();
        let json = serde_json::to_string(&wire).unwrap();
        let back: WireValue = serde_json::from_str(&json).unwrap();
        let value = back.into_value();
        let thrown = value.as_map().unwrap()["throwable"].as_throwable().unwrap().clone();
        assert_eq!(thrown.type_name, "std.AssertionError");
        assert_eq!(thrown.message_text(), "expected 1");
    }
}
