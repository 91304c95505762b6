//! Value types stored under keys
//!
//! This module defines:
//! - Value: Scalar payload stored by a committed version or an intent
//! - IntentValue: What an intent does to its key once resolved (put or delete)
//!
//! Different variants are never equal: `Int(1) != Float(1.0)` and
//! `Bytes(b"a") != String("a")`. Float equality follows IEEE-754.

use serde::{Deserialize, Serialize};

/// Scalar value stored under a key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// Null value
    Null,
    /// Boolean value
    Bool(bool),
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit floating point (IEEE-754)
    Float(f64),
    /// UTF-8 string
    String(String),
    /// Raw bytes
    Bytes(Vec<u8>),
}

// Custom PartialEq implementation for IEEE-754 float semantics
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            _ => false,
        }
    }
}

impl Value {
    /// Get the type name as a string
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::String(_) => "String",
            Value::Bytes(_) => "Bytes",
        }
    }

    /// Get as i64 if this is an Int value
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as &str if this is a String value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
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

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

/// Effect of a provisional write once its transaction commits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IntentValue {
    /// Store a value
    Put(Value),
    /// Remove the key (tombstone)
    Delete,
}

impl IntentValue {
    /// Value a reader observes for this write; `None` for a tombstone
    pub fn visible_value(&self) -> Option<Value> {
        match self {
            IntentValue::Put(v) => Some(v.clone()),
            IntentValue::Delete => None,
        }
    }

    /// Whether this write is a tombstone
    pub fn is_delete(&self) -> bool {
        matches!(self, IntentValue::Delete)
    }
}
