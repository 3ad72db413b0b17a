use std::path::PathBuf;

use thiserror::Error;

use crate::value::ParamKind;

/// Boxed error returned by operation handlers and property setters.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// An argument string that could not be converted to its declared kind.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Conversion error: '{value}' is not a valid {expected}{}", format_hint(hint))]
pub struct ConvertError {
    pub value: String,
    pub expected: String,
    /// Accepted input format, shown to the operator (e.g. `true|false`).
    pub hint: Option<String>,
}

impl ConvertError {
    pub fn new(value: &str, kind: &ParamKind) -> Self {
        Self {
            value: value.to_string(),
            expected: kind.to_string(),
            hint: kind.format_hint(),
        }
    }

    /// Conversion failure for a custom converter with its own expectation text.
    pub fn custom(value: &str, expected: impl Into<String>) -> Self {
        Self {
            value: value.to_string(),
            expected: expected.into(),
            hint: None,
        }
    }
}

fn format_hint(hint: &Option<String>) -> String {
    match hint {
        Some(h) => format!(" (expected format: {h})"),
        None => String::new(),
    }
}

/// Per-match dispatch failures. Each one becomes an error line in the
/// interpretation result; none of them abort sibling matches.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Conversion(#[from] ConvertError),

    /// A cancel guard tripped. The payload is the operator-facing message.
    #[error("{0}")]
    Cancelled(String),

    #[error("Execution error in {command}: {message}")]
    Execution { command: String, message: String },

    #[error("Execution error in {command}: timed out after {timeout_ms} ms")]
    Timeout { command: String, timeout_ms: u64 },
}

impl DispatchError {
    pub(crate) fn execution(command: &str, err: impl std::fmt::Display) -> Self {
        Self::Execution {
            command: command.to_string(),
            message: err.to_string(),
        }
    }
}

/// Errors from alias administration.
#[derive(Debug, Error)]
pub enum AliasError {
    #[error("unknown command '{0}': aliases can only target registered operations")]
    UnknownCommand(String),

    #[error("alias must not be empty")]
    EmptyAlias,

    #[error("'{alias}' is already an alias of {existing}")]
    Conflict { alias: String, existing: String },

    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),
}

/// Errors from a settings store.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed settings file {}: {source}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid settings path '{0}'")]
    InvalidPath(String),
}

/// Errors loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid framer pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Errors from a transport session.
#[derive(Debug, Error)]
pub enum ConnError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed by peer")]
    Disconnected,

    #[error("invalid framer pattern: {0}")]
    Framer(#[from] regex::Error),
}
