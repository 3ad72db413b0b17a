//! Runtime configuration, loaded from a JSON file.
//!
//! Every field has a default, so an empty object `{}` is a valid config.
//!
//! ```json
//! {
//!   "framer": { "terminator": "\r\n", "data_timeout_ms": 100 },
//!   "interpreter": { "suggestions": true },
//!   "server": { "bind": "0.0.0.0:5000" },
//!   "settings_path": "/data/rayfin/aliases.json"
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::suggest;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub framer: FramerConfig,
    pub interpreter: InterpreterConfig,
    pub server: ServerConfig,
    /// JSON file backing persisted command aliases. In-memory when absent.
    pub settings_path: Option<PathBuf>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.framer.compiled_pattern()?;
        Ok(config)
    }
}

/// Message framer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FramerConfig {
    /// Characters that end a message. Empty disables terminator framing.
    pub terminator: String,
    /// Regex a complete message must match. The first capture group, if
    /// present, is the emitted message.
    pub pattern: Option<String>,
    /// Flush this long after the first fragment, regardless of traffic.
    pub master_timeout_ms: u64,
    /// Flush after this much silence.
    pub data_timeout_ms: u64,
}

impl Default for FramerConfig {
    fn default() -> Self {
        Self {
            terminator: "\n".into(),
            pattern: None,
            master_timeout_ms: 5000,
            data_timeout_ms: 500,
        }
    }
}

impl FramerConfig {
    /// Serial-port preset: CR or LF ends a message, short timeouts.
    pub fn serial() -> Self {
        Self {
            terminator: "\r\n".into(),
            pattern: None,
            master_timeout_ms: 2000,
            data_timeout_ms: 100,
        }
    }

    /// Request/response preset: a message is whatever matches `pattern`.
    pub fn with_pattern(pattern: &str) -> Self {
        Self {
            terminator: String::new(),
            pattern: Some(pattern.to_string()),
            ..Self::default()
        }
    }

    pub fn master_timeout(&self) -> Duration {
        Duration::from_millis(self.master_timeout_ms)
    }

    pub fn data_timeout(&self) -> Duration {
        Duration::from_millis(self.data_timeout_ms)
    }

    pub fn compiled_pattern(&self) -> Result<Option<Regex>, regex::Error> {
        self.pattern.as_deref().map(Regex::new).transpose()
    }
}

/// Command interpreter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    /// Answer unresolved commands with "Did you mean ...?".
    pub suggestions: bool,
    pub suggestion_threshold: f64,
    pub suggestion_window: f64,
    /// Abandon an operation that runs longer than this.
    pub invoke_timeout_ms: Option<u64>,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            suggestions: false,
            suggestion_threshold: suggest::DEFAULT_THRESHOLD,
            suggestion_window: suggest::DEFAULT_WINDOW,
            invoke_timeout_ms: None,
        }
    }
}

impl InterpreterConfig {
    pub fn invoke_timeout(&self) -> Option<Duration> {
        self.invoke_timeout_ms.map(Duration::from_millis)
    }
}

/// TCP command server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:5000".into(),
        }
    }
}
