//! Cancel-when guards on operations and properties.
//!
//! A [`CancelGuard`] is a conjunction of [`CancelCondition`]s. It trips when
//! every condition holds against the owner's *current* state. An operation
//! with several guards is cancelled when any one of them trips.
//!
//! A condition whose property cannot be resolved never holds, so a renamed
//! or missing property disables the guard instead of failing dispatch.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::value::{self, Value};

/// Source of live property values, addressed by dotted path.
pub trait StateSource {
    fn read(&self, path: &str) -> Option<Value>;
}

/// Relational operator of a [`CancelCondition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
}

impl Operator {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Le => "<=",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
        }
    }

    fn accepts(self, ord: Ordering) -> bool {
        match self {
            Self::Lt => ord == Ordering::Less,
            Self::Gt => ord == Ordering::Greater,
            Self::Le => ord != Ordering::Greater,
            Self::Ge => ord != Ordering::Less,
            Self::Eq => ord == Ordering::Equal,
            Self::Ne => ord != Ordering::Equal,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// One comparison of a live property against a fixed value.
#[derive(Debug, Clone, PartialEq)]
pub struct CancelCondition {
    pub path: String,
    pub op: Operator,
    pub value: Value,
}

impl CancelCondition {
    pub fn new(path: &str, op: Operator, value: impl Into<Value>) -> Self {
        Self {
            path: path.to_string(),
            op,
            value: value.into(),
        }
    }

    pub fn holds(&self, state: &dyn StateSource) -> bool {
        let Some(actual) = state.read(&self.path) else {
            return false;
        };
        match value::compare(&actual, &self.value) {
            Some(ord) => self.op.accepts(ord),
            // Incomparable (NaN) values only satisfy `!=`.
            None => self.op == Operator::Ne,
        }
    }
}

impl fmt::Display for CancelCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.path, self.op, value::render(&self.value))
    }
}

/// Error parsing a condition such as `IsRecording == true`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid cancel condition '{0}': expected `<path> <op> <value>`")]
pub struct ConditionParseError(pub String);

impl FromStr for CancelCondition {
    type Err = ConditionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Two-character operators first so `<=` is not read as `<`.
        const OPERATORS: [(&str, Operator); 6] = [
            ("<=", Operator::Le),
            (">=", Operator::Ge),
            ("==", Operator::Eq),
            ("!=", Operator::Ne),
            ("<", Operator::Lt),
            (">", Operator::Gt),
        ];
        let err = || ConditionParseError(s.to_string());
        let (idx, token, op) = OPERATORS
            .iter()
            .filter_map(|&(token, op)| s.find(token).map(|idx| (idx, token, op)))
            .min_by_key(|&(idx, token, _)| (idx, std::cmp::Reverse(token.len())))
            .ok_or_else(err)?;

        let path = s[..idx].trim();
        let raw = s[idx + token.len()..].trim();
        if path.is_empty() || raw.is_empty() {
            return Err(err());
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        Ok(Self::new(path, op, value))
    }
}

/// A set of AND-combined conditions with an optional operator-facing message.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CancelGuard {
    conditions: Vec<CancelCondition>,
    message: Option<String>,
}

impl CancelGuard {
    pub fn when(path: &str, op: Operator, value: impl Into<Value>) -> Self {
        Self {
            conditions: vec![CancelCondition::new(path, op, value)],
            message: None,
        }
    }

    pub fn and(mut self, path: &str, op: Operator, value: impl Into<Value>) -> Self {
        self.conditions.push(CancelCondition::new(path, op, value));
        self
    }

    pub fn with_condition(mut self, condition: CancelCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Replace the generated `Cannot execute ...` text.
    pub fn message(mut self, text: &str) -> Self {
        self.message = Some(text.to_string());
        self
    }

    pub fn conditions(&self) -> &[CancelCondition] {
        &self.conditions
    }

    /// True when every condition holds. An empty guard never trips.
    pub fn is_tripped(&self, state: &dyn StateSource) -> bool {
        !self.conditions.is_empty() && self.conditions.iter().all(|c| c.holds(state))
    }

    /// Operator-facing text for a tripped guard on `command`.
    pub fn describe(&self, command: &str) -> String {
        if let Some(msg) = &self.message {
            return msg.clone();
        }
        let conditions: Vec<String> = self.conditions.iter().map(ToString::to_string).collect();
        format!("Cannot execute {command} when {}", conditions.join(" and "))
    }
}

/// Message of the first tripped guard, if any.
pub fn check(guards: &[CancelGuard], state: &dyn StateSource, command: &str) -> Option<String> {
    guards
        .iter()
        .find(|g| g.is_tripped(state))
        .map(|g| g.describe(command))
}
