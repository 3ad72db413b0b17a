//! Operator-defined command aliases and reply aliases.
//!
//! An *input alias* is an extra name for an internal command: `rec:5` is
//! rewritten to `StartRecording:5`. A *reply alias* is text a peer may send
//! verbatim to trigger the command, and the text written back when the
//! command completes.
//!
//! Aliases are persisted under
//! `CustomCommands/{internal}/Aliases/{alias}` and
//! `CustomCommands/{internal}/Replies/{reply}` and replayed through the same
//! validation as live registration on [`AliasManager::load`].

use std::sync::{Arc, PoisonError, RwLock};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::AliasError;
use crate::interpreter::{CommandInterpreter, InterpretationResult};
use crate::parse::COMMAND_SEPARATOR;
use crate::settings::{SettingsStore, join_path};

const ROOT: &str = "CustomCommands";
const ALIASES: &str = "Aliases";
const REPLIES: &str = "Replies";

/// The alias and reply sets of one internal command.
///
/// Two records are equal when they name the same internal command.
#[derive(Debug, Clone)]
pub struct CommandAlias {
    internal: String,
    inputs: Vec<String>,
    replies: Vec<String>,
}

impl PartialEq for CommandAlias {
    fn eq(&self, other: &Self) -> bool {
        self.internal == other.internal
    }
}

impl Eq for CommandAlias {}

impl CommandAlias {
    pub fn new(internal: &str) -> Self {
        Self {
            internal: internal.to_string(),
            inputs: Vec::new(),
            replies: Vec::new(),
        }
    }

    pub fn internal_command(&self) -> &str {
        &self.internal
    }

    pub fn input_commands(&self) -> &[String] {
        &self.inputs
    }

    pub fn reply_commands(&self) -> &[String] {
        &self.replies
    }

    /// Add an input alias. Returns false if it was already present.
    pub fn add_input(&mut self, alias: &str) -> bool {
        insert_unique(&mut self.inputs, alias)
    }

    pub fn add_reply(&mut self, reply: &str) -> bool {
        insert_unique(&mut self.replies, reply)
    }

    pub fn remove_input(&mut self, alias: &str) -> bool {
        remove_entry(&mut self.inputs, alias)
    }

    pub fn remove_reply(&mut self, reply: &str) -> bool {
        remove_entry(&mut self.replies, reply)
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty() && self.replies.is_empty()
    }

    /// Rewrite `input` if it starts with one of this command's aliases.
    ///
    /// Text after the alias (separated by `:` or whitespace) is carried over
    /// as the argument section.
    fn rewrite(&self, input: &str) -> Option<String> {
        for alias in &self.inputs {
            let Some(head) = input.get(..alias.len()) else {
                continue;
            };
            if !head.eq_ignore_ascii_case(alias) {
                continue;
            }
            let rest = &input[alias.len()..];
            let params = match rest.chars().next() {
                None => "",
                Some(c) if c == COMMAND_SEPARATOR || c.is_whitespace() => {
                    rest[c.len_utf8()..].trim()
                }
                Some(_) => continue,
            };
            return Some(if params.is_empty() {
                self.internal.clone()
            } else {
                format!("{}{COMMAND_SEPARATOR}{params}", self.internal)
            });
        }
        None
    }
}

fn insert_unique(set: &mut Vec<String>, item: &str) -> bool {
    if set.iter().any(|s| s.eq_ignore_ascii_case(item)) {
        return false;
    }
    set.push(item.to_string());
    true
}

fn remove_entry(set: &mut Vec<String>, item: &str) -> bool {
    let before = set.len();
    set.retain(|s| !s.eq_ignore_ascii_case(item));
    set.len() != before
}

#[derive(Debug, Clone, Copy)]
enum AliasKind {
    Input,
    Reply,
}

impl AliasKind {
    fn segment(self) -> &'static str {
        match self {
            Self::Input => ALIASES,
            Self::Reply => REPLIES,
        }
    }
}

/// The alias table, validated against an interpreter and persisted to a
/// settings store.
pub struct AliasManager {
    interpreter: Arc<CommandInterpreter>,
    settings: Arc<dyn SettingsStore>,
    table: RwLock<Vec<CommandAlias>>,
}

impl AliasManager {
    pub fn new(interpreter: Arc<CommandInterpreter>, settings: Arc<dyn SettingsStore>) -> Self {
        Self {
            interpreter,
            settings,
            table: RwLock::new(Vec::new()),
        }
    }

    pub fn interpreter(&self) -> &Arc<CommandInterpreter> {
        &self.interpreter
    }

    /// Replay every persisted alias and reply. Entries that no longer
    /// validate are skipped with a warning. Returns the number loaded.
    pub fn load(&self) -> Result<usize, AliasError> {
        let mut loaded = 0;
        for command in self.settings.load_all(ROOT)? {
            for kind in [AliasKind::Input, AliasKind::Reply] {
                let path = join_path(&[ROOT, command.name.as_str(), kind.segment()])?;
                for entry in self.settings.load_all(&path)? {
                    let text = if entry.value.is_empty() { &entry.name } else { &entry.value };
                    match self.insert(&command.name, text, kind) {
                        Ok(_) => loaded += 1,
                        Err(e) => warn!(
                            command = %command.name,
                            alias = %text,
                            error = %e,
                            "skipping persisted alias"
                        ),
                    }
                }
            }
        }
        info!(loaded, "command aliases loaded");
        Ok(loaded)
    }

    /// Make `alias` an input synonym of `internal` and persist it.
    pub fn add_command_alias(&self, internal: &str, alias: &str) -> Result<(), AliasError> {
        self.add(internal, alias, AliasKind::Input)
    }

    /// Make `reply` a reply alias of `internal` and persist it.
    pub fn add_command_reply(&self, internal: &str, reply: &str) -> Result<(), AliasError> {
        self.add(internal, reply, AliasKind::Reply)
    }

    fn add(&self, internal: &str, text: &str, kind: AliasKind) -> Result<(), AliasError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AliasError::EmptyAlias);
        }
        let path = join_path(&[ROOT, internal, kind.segment(), text])?;
        if self.insert(internal, text, kind)? {
            if let Err(e) = self.settings.update(&path, text) {
                self.forget(internal, text, kind);
                return Err(e.into());
            }
            info!(internal, alias = text, kind = ?kind, "alias added");
        }
        Ok(())
    }

    /// Validate and insert into the in-memory table. Returns false when the
    /// alias was already present.
    fn insert(&self, internal: &str, text: &str, kind: AliasKind) -> Result<bool, AliasError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AliasError::EmptyAlias);
        }
        if !self.interpreter.has_operation(internal) {
            return Err(AliasError::UnknownCommand(internal.to_string()));
        }

        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if let AliasKind::Input = kind
            && let Some(other) = table.iter().find(|a| {
                a.internal != internal && a.inputs.iter().any(|i| i.eq_ignore_ascii_case(text))
            })
        {
            return Err(AliasError::Conflict {
                alias: text.to_string(),
                existing: other.internal.clone(),
            });
        }

        let record = match table.iter_mut().position(|a| a.internal == internal) {
            Some(idx) => &mut table[idx],
            None => {
                table.push(CommandAlias::new(internal));
                let last = table.len() - 1;
                &mut table[last]
            }
        };
        Ok(match kind {
            AliasKind::Input => record.add_input(text),
            AliasKind::Reply => record.add_reply(text),
        })
    }

    pub fn remove_command_alias(&self, internal: &str, alias: &str) -> Result<bool, AliasError> {
        self.remove(internal, alias, AliasKind::Input)
    }

    pub fn remove_command_reply(&self, internal: &str, reply: &str) -> Result<bool, AliasError> {
        self.remove(internal, reply, AliasKind::Reply)
    }

    fn remove(&self, internal: &str, text: &str, kind: AliasKind) -> Result<bool, AliasError> {
        let text = text.trim();
        let removed = self.forget(internal, text, kind);
        if removed {
            self.settings
                .remove(&join_path(&[ROOT, internal, kind.segment(), text])?)?;
            info!(internal, alias = text, kind = ?kind, "alias removed");
        }
        Ok(removed)
    }

    /// Remove `text` from the in-memory table only, purging an emptied record.
    fn forget(&self, internal: &str, text: &str, kind: AliasKind) -> bool {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let Some(idx) = table.iter().position(|a| a.internal == internal) else {
            return false;
        };
        let record = &mut table[idx];
        let removed = match kind {
            AliasKind::Input => record.remove_input(text),
            AliasKind::Reply => record.remove_reply(text),
        };
        if record.is_empty() {
            table.remove(idx);
        }
        removed
    }

    /// Drop every alias and reply of `internal`, in memory and in settings.
    pub fn clear_command(&self, internal: &str) -> Result<bool, AliasError> {
        let removed = {
            let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
            let before = table.len();
            table.retain(|a| a.internal != internal);
            table.len() != before
        };
        self.settings.remove(&join_path(&[ROOT, internal])?)?;
        if removed {
            info!(internal, "aliases cleared");
        }
        Ok(removed)
    }

    /// Snapshot of the alias table.
    pub fn aliases(&self) -> Vec<CommandAlias> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Reply aliases to send after `internal` completes.
    pub fn replies_for(&self, internal: &str) -> Vec<String> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|a| a.internal.eq_ignore_ascii_case(internal))
            .map(|a| a.replies.clone())
            .unwrap_or_default()
    }

    /// Rewrite aliased input to its internal command; `None` when `input`
    /// uses no alias.
    pub fn translate(&self, input: &str) -> Option<String> {
        let input = input.trim();
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        let translated = table
            .iter()
            .find(|a| a.replies.iter().any(|r| r.eq_ignore_ascii_case(input)))
            .map(|a| a.internal.clone())
            .or_else(|| table.iter().find_map(|a| a.rewrite(input)));
        if let Some(command) = &translated {
            debug!(input, command = %command, "alias translated");
        }
        translated
    }

    /// Translate `input` and, if it used an alias, interpret the internal
    /// command on a spawned task.
    pub fn receive_notification(&self, input: &str) -> Option<JoinHandle<InterpretationResult>> {
        let command = self.translate(input)?;
        let interpreter = Arc::clone(&self.interpreter);
        Some(tokio::spawn(async move { interpreter.interpret(&command).await }))
    }
}
