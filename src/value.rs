//! Parameter kinds and value rendering.
//!
//! Every value crossing the dispatch boundary is a [`serde_json::Value`]. The
//! declared shape of a parameter or property is a closed [`ParamKind`]; the
//! conversion pipeline in [`crate::convert`] turns argument text into a value
//! of that kind.

use std::cmp::Ordering;
use std::fmt;

pub use serde_json::Value;

/// Declared kind of an operation parameter or state property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Int,
    Float,
    Bool,
    /// Any structured JSON value.
    Json,
    /// One of a closed set of names, matched case-insensitively.
    Enum { name: String, variants: Vec<String> },
    List(Box<ParamKind>),
}

impl ParamKind {
    pub fn enumeration(name: &str, variants: &[&str]) -> Self {
        Self::Enum {
            name: name.to_string(),
            variants: variants.iter().map(|v| v.to_string()).collect(),
        }
    }

    pub fn list_of(inner: ParamKind) -> Self {
        Self::List(Box::new(inner))
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Self::List(_))
    }

    /// Accepted input format, for conversion error messages.
    pub fn format_hint(&self) -> Option<String> {
        match self {
            Self::String => None,
            Self::Int => Some("integer, e.g. 42".into()),
            Self::Float => Some("number, e.g. 1.5".into()),
            Self::Bool => Some("true|false".into()),
            Self::Json => Some("JSON".into()),
            Self::Enum { variants, .. } => Some(variants.join("|")),
            Self::List(_) => Some("JSON array, e.g. [1,2]".into()),
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => write!(f, "String"),
            Self::Int => write!(f, "Int"),
            Self::Float => write!(f, "Float"),
            Self::Bool => write!(f, "Bool"),
            Self::Json => write!(f, "Json"),
            Self::Enum { name, .. } => write!(f, "{name}"),
            Self::List(inner) => write!(f, "List<{inner}>"),
        }
    }
}

/// Render a value for the line-oriented protocol.
///
/// Strings are written bare, `null` as an empty string, and arrays/objects as
/// compact JSON.
pub fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

/// Order two values for cancel-condition evaluation.
///
/// Numbers compare numerically, booleans and strings natively. Anything else
/// (including mismatched types) falls back to comparing the rendered text.
pub fn compare(actual: &Value, expected: &Value) -> Option<Ordering> {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => Some(render(actual).cmp(&render(expected))),
    }
}
