//! Hierarchical settings stores.
//!
//! Keys are `/`-separated paths such as
//! `CustomCommands/StartRecording/Aliases/rec`. Every stored path implicitly
//! creates its ancestors as nodes, so [`SettingsStore::load_all`] can list
//! intermediate levels too.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tracing::debug;

use crate::error::SettingsError;

pub const PATH_DELIMITER: char = '/';

/// One direct child of a listed settings path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingEntry {
    /// Last path segment.
    pub name: String,
    /// Stored value; empty for a node that only has children.
    pub value: String,
    /// Extra metadata. `path` always holds the full key.
    pub attributes: BTreeMap<String, String>,
}

/// Settings persistence used by alias management.
pub trait SettingsStore: Send + Sync {
    /// Direct children of `path`, in key order.
    fn load_all(&self, path: &str) -> Result<Vec<SettingEntry>, SettingsError>;

    /// Create or overwrite the value at `path`.
    fn update(&self, path: &str, value: &str) -> Result<(), SettingsError>;

    /// Remove `path` and everything below it. Removing a missing path is not
    /// an error.
    fn remove(&self, path: &str) -> Result<(), SettingsError>;
}

/// Join segments into a settings path, rejecting segments that would break
/// the hierarchy.
pub fn join_path(segments: &[&str]) -> Result<String, SettingsError> {
    for segment in segments {
        if segment.is_empty() || segment.contains(PATH_DELIMITER) {
            return Err(SettingsError::InvalidPath(segments.join("/")));
        }
    }
    Ok(segments.join("/"))
}

fn validate(path: &str) -> Result<&str, SettingsError> {
    let trimmed = path.trim_matches(PATH_DELIMITER);
    if trimmed.is_empty() || trimmed.split(PATH_DELIMITER).any(str::is_empty) {
        return Err(SettingsError::InvalidPath(path.to_string()));
    }
    Ok(trimmed)
}

fn children(tree: &BTreeMap<String, String>, path: &str) -> Vec<SettingEntry> {
    let parent = path.trim_matches(PATH_DELIMITER);
    let prefix = if parent.is_empty() {
        String::new()
    } else {
        format!("{parent}{PATH_DELIMITER}")
    };

    let mut found: BTreeMap<&str, Option<&str>> = BTreeMap::new();
    for (key, value) in tree.range(prefix.clone()..) {
        let Some(rest) = key.strip_prefix(&prefix) else {
            break;
        };
        match rest.split_once(PATH_DELIMITER) {
            Some((name, _)) => {
                found.entry(name).or_insert(None);
            }
            None => {
                found.insert(rest, Some(value.as_str()));
            }
        }
    }

    found
        .into_iter()
        .map(|(name, value)| SettingEntry {
            name: name.to_string(),
            value: value.unwrap_or_default().to_string(),
            attributes: BTreeMap::from([("path".to_string(), format!("{prefix}{name}"))]),
        })
        .collect()
}

fn remove_subtree(tree: &mut BTreeMap<String, String>, path: &str) -> bool {
    let prefix = format!("{path}{PATH_DELIMITER}");
    let before = tree.len();
    tree.retain(|key, _| key != path && !key.starts_with(&prefix));
    tree.len() != before
}

/// Settings held in memory only.
#[derive(Debug, Default)]
pub struct MemorySettings {
    tree: Mutex<BTreeMap<String, String>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn load_all(&self, path: &str) -> Result<Vec<SettingEntry>, SettingsError> {
        let tree = self.tree.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(children(&tree, path))
    }

    fn update(&self, path: &str, value: &str) -> Result<(), SettingsError> {
        let path = validate(path)?;
        self.tree
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, path: &str) -> Result<(), SettingsError> {
        let path = validate(path)?;
        remove_subtree(&mut self.tree.lock().unwrap_or_else(PoisonError::into_inner), path);
        Ok(())
    }
}

/// Settings persisted to a JSON object of `path -> value`.
///
/// Every mutation rewrites the file atomically (write tmp, then rename).
#[derive(Debug)]
pub struct JsonFileSettings {
    path: PathBuf,
    tree: Mutex<BTreeMap<String, String>>,
}

impl JsonFileSettings {
    /// Open `path`, starting empty if the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
        let path = path.into();
        let tree = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).map_err(|source| SettingsError::Malformed {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(SettingsError::Io { path, source }),
        };
        Ok(Self {
            path,
            tree: Mutex::new(tree),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, tree: &BTreeMap<String, String>) -> Result<(), SettingsError> {
        let io_err = |source| SettingsError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let json = serde_json::to_string_pretty(tree).map_err(|source| SettingsError::Malformed {
            path: self.path.clone(),
            source,
        })?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json).map_err(io_err)?;
        std::fs::rename(&tmp_path, &self.path).map_err(io_err)?;
        debug!(path = %self.path.display(), entries = tree.len(), "settings saved");
        Ok(())
    }
}

impl SettingsStore for JsonFileSettings {
    fn load_all(&self, path: &str) -> Result<Vec<SettingEntry>, SettingsError> {
        let tree = self.tree.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(children(&tree, path))
    }

    fn update(&self, path: &str, value: &str) -> Result<(), SettingsError> {
        let path = validate(path)?;
        let mut tree = self.tree.lock().unwrap_or_else(PoisonError::into_inner);
        if tree.get(path).map(String::as_str) == Some(value) {
            return Ok(());
        }
        tree.insert(path.to_string(), value.to_string());
        self.save(&tree)
    }

    fn remove(&self, path: &str) -> Result<(), SettingsError> {
        let path = validate(path)?;
        let mut tree = self.tree.lock().unwrap_or_else(PoisonError::into_inner);
        if remove_subtree(&mut tree, path) {
            self.save(&tree)?;
        }
        Ok(())
    }
}
