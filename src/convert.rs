//! Argument conversion pipeline.
//!
//! An argument string is converted to its declared [`ParamKind`] by the first
//! stage that applies:
//!
//! 1. the converter attached to the operation or property itself,
//! 2. JSON: if the text parses as JSON and the value fits the kind,
//! 3. the interpreter-wide converter registered for the parameter name,
//! 4. primitive parsing.

use serde_json::Number;

use crate::error::ConvertError;
use crate::value::{ParamKind, Value};

/// Converts argument text into a value of the requested kind.
pub trait ArgConverter: Send + Sync {
    fn convert(&self, raw: &str, kind: &ParamKind) -> Result<Value, ConvertError>;
}

impl<F> ArgConverter for F
where
    F: Fn(&str, &ParamKind) -> Result<Value, ConvertError> + Send + Sync,
{
    fn convert(&self, raw: &str, kind: &ParamKind) -> Result<Value, ConvertError> {
        self(raw, kind)
    }
}

/// Run the full conversion pipeline for one argument.
pub fn convert_argument(
    raw: &str,
    kind: &ParamKind,
    specific: Option<&dyn ArgConverter>,
    named: Option<&dyn ArgConverter>,
) -> Result<Value, ConvertError> {
    if let Some(conv) = specific {
        return conv.convert(raw, kind);
    }
    if let Ok(json) = serde_json::from_str::<Value>(raw)
        && let Some(value) = coerce_json(&json, kind)
    {
        return Ok(value);
    }
    if let Some(conv) = named {
        return conv.convert(raw, kind);
    }
    primitive(raw, kind)
}

/// Fit an already-parsed JSON value to `kind`, or `None` if it does not fit.
pub fn coerce_json(value: &Value, kind: &ParamKind) -> Option<Value> {
    match (kind, value) {
        (ParamKind::Json, v) => Some(v.clone()),
        (ParamKind::String, Value::String(_)) => Some(value.clone()),
        (ParamKind::Bool, Value::Bool(_)) => Some(value.clone()),
        (ParamKind::Int, Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                Some(Value::from(i))
            } else {
                let f = n.as_f64()?;
                (f.fract() == 0.0 && f.abs() < i64::MAX as f64).then(|| Value::from(f as i64))
            }
        }
        (ParamKind::Float, Value::Number(n)) => n.as_f64().and_then(float_value),
        (ParamKind::Enum { variants, .. }, Value::String(s)) => match_variant(variants, s),
        (ParamKind::List(inner), Value::Array(items)) => items
            .iter()
            .map(|item| {
                coerce_json(item, inner).or_else(|| match item {
                    Value::String(s) => primitive(s, inner).ok(),
                    _ => None,
                })
            })
            .collect::<Option<Vec<_>>>()
            .map(Value::Array),
        _ => None,
    }
}

/// Parse plain argument text as `kind`.
pub fn primitive(raw: &str, kind: &ParamKind) -> Result<Value, ConvertError> {
    let text = raw.trim();
    let fail = || ConvertError::new(raw, kind);
    match kind {
        ParamKind::String => Ok(Value::String(raw.to_string())),
        ParamKind::Int => text.parse::<i64>().map(Value::from).map_err(|_| fail()),
        ParamKind::Float => text
            .parse::<f64>()
            .ok()
            .and_then(float_value)
            .ok_or_else(fail),
        ParamKind::Bool => parse_bool(text).map(Value::Bool).ok_or_else(fail),
        ParamKind::Enum { variants, .. } => {
            if let Some(v) = match_variant(variants, text) {
                return Ok(v);
            }
            // Numeric index into the variant list.
            text.parse::<usize>()
                .ok()
                .and_then(|i| variants.get(i))
                .map(|v| Value::String(v.clone()))
                .ok_or_else(fail)
        }
        ParamKind::Json => serde_json::from_str(text).map_err(|_| fail()),
        ParamKind::List(_) => {
            let parsed: Value = serde_json::from_str(text).map_err(|_| fail())?;
            coerce_json(&parsed, kind).ok_or_else(fail)
        }
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn float_value(f: f64) -> Option<Value> {
    Number::from_f64(f).map(Value::Number)
}

fn match_variant(variants: &[String], text: &str) -> Option<Value> {
    variants
        .iter()
        .find(|v| v.eq_ignore_ascii_case(text))
        .map(|v| Value::String(v.clone()))
}
