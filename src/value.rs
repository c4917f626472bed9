//! Dynamic setting values and their coercion rules.
//!
//! Settings carry one of a fixed set of scalar kinds (plus a float array for
//! sweep data). The [`Value`] enum is the type-erased representation that
//! flows through the path router, the persisted-settings dictionary and the
//! listener callbacks; [`Dtype`] is the kind a setting is declared with at
//! creation time and never changes afterwards.
//!
//! `Value` serializes untagged, so a flat `{path: value}` map written by a
//! persistence collaborator round-trips through plain JSON or TOML without
//! any wrapper objects.

use serde::{Deserialize, Serialize};

// =============================================================================
// Dtype
// =============================================================================

/// The fixed kind of a setting's value, immutable after creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dtype {
    Bool,
    Int,
    Float,
    Str,
    /// Array of floats, used by sweep/acquisition settings.
    Array,
}

impl Dtype {
    /// Short lowercase name, as used in error messages and snapshots.
    pub fn as_str(&self) -> &'static str {
        match self {
            Dtype::Bool => "bool",
            Dtype::Int => "int",
            Dtype::Float => "float",
            Dtype::Str => "str",
            Dtype::Array => "array",
        }
    }

    /// Whether values of this kind are checked against `vmin`/`vmax`.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Dtype::Int | Dtype::Float | Dtype::Array)
    }
}

impl std::fmt::Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Value
// =============================================================================

/// A dynamically typed setting value.
///
/// Equality is kind-appropriate: scalars compare directly, arrays compare
/// element-wise. Two values of different variants are never equal; callers
/// coerce to the setting's dtype before comparing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<f64>),
}

impl Value {
    /// The kind of this value.
    pub fn dtype(&self) -> Dtype {
        match self {
            Value::Bool(_) => Dtype::Bool,
            Value::Int(_) => Dtype::Int,
            Value::Float(_) => Dtype::Float,
            Value::Str(_) => Dtype::Str,
            Value::Array(_) => Dtype::Array,
        }
    }

    /// Coerce this value to the given dtype.
    ///
    /// Returns `None` when no sensible conversion exists (the caller wraps
    /// that into [`LabError::Coercion`](crate::error::LabError::Coercion)
    /// with the setting's name attached). Conversions follow the rules a
    /// settings file or GUI widget would expect:
    ///
    /// - numerics convert freely (floats round to int);
    /// - strings parse (`"42"`, `"3.5"`, `"true"`, `"on"`, ...);
    /// - any scalar formats to a string;
    /// - a single numeric scalar becomes a one-element array.
    pub fn coerce_to(&self, dtype: Dtype) -> Option<Value> {
        match dtype {
            Dtype::Bool => self.to_bool().map(Value::Bool),
            Dtype::Int => self.to_i64().map(Value::Int),
            Dtype::Float => self.to_f64().map(Value::Float),
            Dtype::Str => match self {
                Value::Array(_) => None,
                other => Some(Value::Str(other.to_string())),
            },
            Dtype::Array => match self {
                Value::Array(v) => Some(Value::Array(v.clone())),
                Value::Int(i) => Some(Value::Array(vec![*i as f64])),
                Value::Float(f) => Some(Value::Array(vec![*f])),
                _ => None,
            },
        }
    }

    fn to_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            Value::Float(f) => Some(*f != 0.0),
            Value::Str(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Some(true),
                "false" | "0" | "no" | "off" => Some(false),
                _ => None,
            },
            Value::Array(_) => None,
        }
    }

    fn to_i64(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(f.round() as i64),
            Value::Str(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().map(|f| f.round() as i64))
            }
            Value::Array(_) => None,
        }
    }

    fn to_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Str(s) => s.trim().parse::<f64>().ok(),
            Value::Array(_) => None,
        }
    }

    /// The value as a bool, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The value as an i64, if it is one.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// The value as an f64; integers widen.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// The value as a string slice, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The value as a float array, if it is one.
    pub fn as_array(&self) -> Option<&[f64]> {
        match self {
            Value::Array(v) => Some(v),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(s) => f.write_str(s),
            Value::Array(v) => {
                f.write_str("[")?;
                for (i, x) in v.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{x}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v.into())
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Value::Array(v)
    }
}

impl From<&[f64]> for Value {
    fn from(v: &[f64]) -> Self {
        Value::Array(v.to_vec())
    }
}

// =============================================================================
// Tests
// =============================================================================
