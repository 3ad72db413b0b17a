//! Command interpreter: resolves text commands against registered objects.
//!
//! A request line is parsed into a command path and arguments, matched
//! against every registered [`ControlObject`]'s operations (by name or alias
//! and arity) and properties (get with no argument, set with one), guarded by
//! cancel conditions, converted, invoked, and rendered back to text. Each
//! result is also published to subscribers as a [`Notification`].
//!
//! The registry is snapshotted before anything is awaited, so concurrent
//! [`register`](CommandInterpreter::register) calls never block or corrupt an
//! in-flight dispatch; an object registered mid-dispatch may or may not be
//! seen by it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde_json::Map;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::cancel;
use crate::config::InterpreterConfig;
use crate::convert::{ArgConverter, convert_argument};
use crate::error::{DispatchError, HandlerError};
use crate::object::{
    self, ControlObject, HandlerFuture, ListHandle, ObjectId, Operation, OutputConverter,
    StateProperty,
};
use crate::parse::{ParsedInput, PATH_SEPARATOR};
use crate::suggest;
use crate::value::{self, Value};

const HELP_COMMANDS: [&str; 3] = ["Help", "?", "GetCommands"];
const STATE_COMMANDS: [&str; 2] = ["State", "GetState"];
const JSON_STATE_COMMAND: &str = "GetJSONState";

/// Severity of a [`Notification`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Information,
    Error,
}

/// One dispatch result, published to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    /// Resolved command name.
    pub command: String,
    pub message: String,
}

/// Aggregate result of [`CommandInterpreter::interpret`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterpretationResult {
    /// False when nothing matched or any match failed.
    pub success: bool,
    /// Result lines joined with `\n`.
    pub message: String,
}

/// Result of one matched operation or property.
#[derive(Debug)]
pub struct CommandOutcome {
    pub command: String,
    pub result: Result<String, DispatchError>,
}

impl CommandOutcome {
    fn ok(command: &str, text: String) -> Self {
        Self {
            command: command.to_string(),
            result: Ok(text),
        }
    }

    fn err(command: &str, err: DispatchError) -> Self {
        Self {
            command: command.to_string(),
            result: Err(err),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    /// The result line: the rendered value, or the error text.
    pub fn message(&self) -> String {
        match &self.result {
            Ok(text) => text.clone(),
            Err(e) => e.to_string(),
        }
    }
}

/// Marshals list-property merges onto a host-designated execution context.
///
/// `invoke` must run `action` before returning.
pub trait Dispatcher: Send + Sync {
    fn invoke<'a>(&self, action: Box<dyn FnOnce() + Send + 'a>);
}

/// The central command dispatcher.
pub struct CommandInterpreter {
    objects: RwLock<Vec<Arc<ControlObject>>>,
    converters: RwLock<HashMap<String, Arc<dyn ArgConverter>>>,
    subscribers: Mutex<Vec<UnboundedSender<Notification>>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    config: InterpreterConfig,
}

impl Default for CommandInterpreter {
    fn default() -> Self {
        Self::new(InterpreterConfig::default())
    }
}

impl fmt::Debug for CommandInterpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandInterpreter")
            .field("objects", &self.objects().len())
            .field("dispatcher", &self.dispatcher.is_some())
            .field("config", &self.config)
            .finish()
    }
}

/// Where a command resolved to: the objects searched, the effective name, and
/// the argument strings.
struct Target {
    owners: Vec<Arc<ControlObject>>,
    command: String,
    args: Vec<String>,
}

impl CommandInterpreter {
    pub fn new(config: InterpreterConfig) -> Self {
        Self {
            objects: RwLock::new(Vec::new()),
            converters: RwLock::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            dispatcher: None,
            config,
        }
    }

    /// Route list-property merges through `dispatcher` instead of running inline.
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn config(&self) -> &InterpreterConfig {
        &self.config
    }

    // -- registry -----------------------------------------------------------

    /// Register `object`, replacing any earlier registration of the same object.
    pub fn register(&self, object: Arc<ControlObject>) {
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        info!(
            object = object.name(),
            id = %object.id(),
            operations = object.operations().len(),
            properties = object.properties().len(),
            "registered control object"
        );
        match objects.iter_mut().find(|o| o.id() == object.id()) {
            Some(slot) => *slot = object,
            None => objects.push(object),
        }
    }

    /// Remove a registration. Returns false if `id` was not registered.
    pub fn unregister(&self, id: ObjectId) -> bool {
        let mut objects = self.objects.write().unwrap_or_else(PoisonError::into_inner);
        let before = objects.len();
        objects.retain(|o| o.id() != id);
        let removed = objects.len() != before;
        if removed {
            info!(%id, "unregistered control object");
        }
        removed
    }

    /// Snapshot of the registered objects, in registration order.
    pub fn objects(&self) -> Vec<Arc<ControlObject>> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Converter for every parameter or property named `param`
    /// (case-insensitive), consulted after JSON coercion.
    pub fn add_converter(&self, param: &str, converter: impl ArgConverter + 'static) {
        self.converters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(param.to_lowercase(), Arc::new(converter));
    }

    fn named_converter(&self, param: &str) -> Option<Arc<dyn ArgConverter>> {
        self.converters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&param.to_lowercase())
            .cloned()
    }

    /// Whether `command` names a built-in or an operation it would resolve
    /// to. Operations of nested objects need their dotted path
    /// (`Lens.Zoom` or `Camera.Lens.Zoom`).
    pub fn has_operation(&self, command: &str) -> bool {
        if is_builtin(command) {
            return true;
        }
        let parsed = ParsedInput::parse(command);
        let objects = self.objects();
        let owners = match parsed.qualifiers() {
            [] => objects,
            qualifiers => qualified_owners(&objects, qualifiers),
        };
        owners
            .iter()
            .any(|o| o.operations().iter().any(|op| op.answers_to(parsed.name())))
    }

    // -- notifications ------------------------------------------------------

    /// Receive every future [`Notification`]. Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> UnboundedReceiver<Notification> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    fn notify(&self, outcome: &CommandOutcome) {
        let notification = Notification {
            kind: if outcome.is_ok() {
                NotificationKind::Information
            } else {
                NotificationKind::Error
            },
            command: outcome.command.clone(),
            message: outcome.message(),
        };
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(notification.clone()).is_ok());
    }

    // -- dispatch -----------------------------------------------------------

    /// Interpret one request line. Never fails: errors become result lines.
    pub async fn interpret(&self, input: &str) -> InterpretationResult {
        let outcomes = self.dispatch(input).await;
        for outcome in &outcomes {
            self.notify(outcome);
        }

        if outcomes.is_empty() {
            debug!(input, "no operation or property matched");
            let message = self.unresolved_message(input);
            return InterpretationResult {
                success: false,
                message,
            };
        }

        let lines: Vec<String> = outcomes.iter().map(CommandOutcome::message).collect();
        InterpretationResult {
            success: outcomes.iter().all(CommandOutcome::is_ok),
            message: lines.join("\n"),
        }
    }

    fn unresolved_message(&self, input: &str) -> String {
        if !self.config.suggestions {
            return String::new();
        }
        let parsed = ParsedInput::parse(input);
        let hits = self.suggest(parsed.name());
        if hits.is_empty() {
            String::new()
        } else {
            format!("Did you mean {}?", hits.join(" or "))
        }
    }

    /// Resolve and execute `input`, returning one outcome per match, without
    /// publishing notifications. Empty when nothing matched.
    pub async fn dispatch(&self, input: &str) -> Vec<CommandOutcome> {
        let parsed = ParsedInput::parse(input);
        if parsed.segments.is_empty() {
            return Vec::new();
        }
        if let Some(outcome) = self.builtin(&parsed).await {
            return vec![outcome];
        }

        let objects = self.objects();
        for target in resolve_targets(&objects, &parsed) {
            debug!(
                command = %target.command,
                args = target.args.len(),
                owners = target.owners.len(),
                "resolving"
            );
            if let Some(outcomes) = self.run_matches(&target).await {
                return outcomes;
            }
        }
        Vec::new()
    }

    async fn builtin(&self, parsed: &ParsedInput) -> Option<CommandOutcome> {
        if parsed.has_arguments || parsed.segments.len() != 1 {
            return None;
        }
        let name = parsed.name();
        if let Some(help) = HELP_COMMANDS.iter().find(|c| c.eq_ignore_ascii_case(name)) {
            return Some(CommandOutcome::ok(help, self.get_commands()));
        }
        if let Some(state) = STATE_COMMANDS.iter().find(|c| c.eq_ignore_ascii_case(name)) {
            return Some(CommandOutcome::ok(state, self.get_state().await));
        }
        if JSON_STATE_COMMAND.eq_ignore_ascii_case(name) {
            return Some(CommandOutcome::ok(JSON_STATE_COMMAND, self.get_json_state().await));
        }
        None
    }

    async fn run_matches(&self, target: &Target) -> Option<Vec<CommandOutcome>> {
        let command = target.command.as_str();
        let argc = target.args.len();

        let mut ops: Vec<(&Arc<ControlObject>, &Operation)> = Vec::new();
        let mut props: Vec<(&Arc<ControlObject>, &StateProperty)> = Vec::new();
        for owner in &target.owners {
            ops.extend(
                owner
                    .operations()
                    .iter()
                    .filter(|op| op.answers_to(command) && op.params().len() == argc)
                    .map(|op| (owner, op)),
            );
            if argc <= 1 {
                props.extend(
                    owner
                        .properties()
                        .iter()
                        .filter(|p| p.answers_to(command) && (argc == 0 || p.remotely_settable()))
                        .map(|p| (owner, p)),
                );
            }
        }
        if ops.iter().any(|(_, op)| op.overrides) {
            ops.retain(|(_, op)| op.overrides);
        }
        if ops.is_empty() && props.is_empty() {
            return None;
        }

        // Any tripped guard cancels the whole dispatch before anything runs.
        let tripped = ops
            .iter()
            .find_map(|&(owner, op)| cancel::check(&op.guards, &**owner, op.name()))
            .or_else(|| {
                (argc == 1)
                    .then(|| {
                        props
                            .iter()
                            .find_map(|&(owner, p)| cancel::check(&p.guards, &**owner, p.name()))
                    })
                    .flatten()
            });
        if let Some(message) = tripped {
            info!(command, %message, "dispatch cancelled by guard");
            return Some(vec![CommandOutcome::err(
                command,
                DispatchError::Cancelled(message),
            )]);
        }

        let mut outcomes = Vec::new();
        let mut index = 0;
        while index < ops.len() {
            let owner_id = ops[index].0.id();
            let group_len = ops[index..]
                .iter()
                .take_while(|(o, _)| o.id() == owner_id)
                .count();
            let group = &ops[index..index + group_len];
            index += group_len;

            // Overloads on one owner: first success wins.
            let mut failures = Vec::new();
            let mut succeeded = false;
            for (_, op) in group {
                let outcome = match self.run_operation(op, &target.args).await {
                    Ok(text) => CommandOutcome::ok(op.name(), text),
                    Err(e) => CommandOutcome::err(op.name(), e),
                };
                if outcome.is_ok() {
                    outcomes.push(outcome);
                    succeeded = true;
                    break;
                }
                failures.push(outcome);
            }
            if !succeeded {
                outcomes.extend(failures);
            }
        }

        for (_, prop) in props {
            let result = match target.args.first() {
                None => render_property(prop),
                Some(raw) => self.set_property(prop, raw),
            };
            outcomes.push(CommandOutcome {
                command: prop.name().to_string(),
                result,
            });
        }
        Some(outcomes)
    }

    async fn run_operation(
        &self,
        op: &Operation,
        args: &[String],
    ) -> Result<String, DispatchError> {
        let mut values = Vec::with_capacity(args.len());
        for (raw, param) in args.iter().zip(op.params()) {
            let named = self.named_converter(&param.name);
            values.push(convert_argument(
                raw,
                &param.kind,
                op.converter.as_deref(),
                named.as_deref(),
            )?);
        }

        let value = self.invoke(op.name(), op.invoke(values)).await?;
        let value = apply_output(op.output.as_ref(), value)
            .map_err(|e| DispatchError::execution(op.name(), e))?;
        let text = if value.is_null() {
            op.name().to_string()
        } else {
            value::render(&value)
        };
        Ok(match &op.prefix {
            Some(prefix) => format!("{prefix}:{text}"),
            None => text,
        })
    }

    /// Run a handler future on its own task so a panic is contained, subject
    /// to the configured invocation timeout.
    async fn invoke(&self, command: &str, future: HandlerFuture) -> Result<Value, DispatchError> {
        let mut handle = tokio::spawn(future);
        let joined = match self.config.invoke_timeout() {
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    handle.abort();
                    warn!(command, timeout_ms = limit.as_millis() as u64, "operation timed out");
                    return Err(DispatchError::Timeout {
                        command: command.to_string(),
                        timeout_ms: limit.as_millis() as u64,
                    });
                }
            },
            None => handle.await,
        };
        match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(DispatchError::execution(command, e)),
            Err(join) if join.is_panic() => {
                let message = object::panic_message(&*join.into_panic());
                error!(command, %message, "operation handler panicked");
                Err(DispatchError::execution(command, message))
            }
            Err(join) => {
                error!(command, error = %join, "operation task failed");
                Err(DispatchError::execution(command, "handler cancelled"))
            }
        }
    }

    fn set_property(&self, prop: &StateProperty, raw: &str) -> Result<String, DispatchError> {
        let named = self.named_converter(prop.name());
        let value =
            convert_argument(raw, prop.kind(), prop.converter.as_deref(), named.as_deref())?;

        let written = match prop.list_handle() {
            Some(handle) => {
                let items = match value {
                    Value::Array(items) => items,
                    other => vec![other],
                };
                object::contain(|| self.merge_list(&handle, items))
            }
            None => prop.set(value),
        };
        written.map_err(|e| DispatchError::execution(prop.name(), e))?;
        debug!(property = prop.name(), "property set");
        render_property(prop)
    }

    fn merge_list(
        &self,
        handle: &Arc<dyn ListHandle>,
        items: Vec<Value>,
    ) -> Result<(), HandlerError> {
        let Some(dispatcher) = &self.dispatcher else {
            return handle.make_equal(items);
        };
        let mut result = None;
        dispatcher.invoke(Box::new(|| result = Some(handle.make_equal(items))));
        result.unwrap_or_else(|| Err("dispatcher did not run the list update".into()))
    }

    // -- introspection ------------------------------------------------------

    /// Every visible operation signature, one per line, sorted.
    ///
    /// Operations of nested objects are listed with their dotted path.
    pub fn get_commands(&self) -> String {
        let mut lines: Vec<String> = Vec::new();
        for (path, object) in walk(&self.objects()) {
            for op in object.operations().iter().filter(|op| !op.is_hidden()) {
                lines.push(qualify(&path, &op.signature()));
            }
        }
        lines.sort_by_key(|l| l.to_lowercase());
        lines.dedup();
        lines.join("\n")
    }

    /// Remote-state properties and operations as `Name:Value` lines.
    pub async fn get_state(&self) -> String {
        let lines: Vec<String> = self
            .collect_state()
            .await
            .into_iter()
            .map(|(name, value)| format!("{name}:{}", value::render(&value)))
            .collect();
        lines.join("\n")
    }

    /// Remote-state properties and operations as one JSON object.
    pub async fn get_json_state(&self) -> String {
        let map: Map<String, Value> = self.collect_state().await.into_iter().collect();
        Value::Object(map).to_string()
    }

    async fn collect_state(&self) -> Vec<(String, Value)> {
        let mut state = Vec::new();
        for (path, object) in walk(&self.objects()) {
            for prop in object.properties().iter().filter(|p| p.remote_state) {
                match output_value(prop) {
                    Ok(value) => state.push((qualify(&path, prop.name()), value)),
                    Err(e) => warn!(property = prop.name(), error = %e, "state property failed"),
                }
            }
            let reporters = object
                .operations()
                .iter()
                .filter(|op| op.remote_state && op.params().is_empty());
            for op in reporters {
                if cancel::check(&op.guards, &*object, op.name()).is_some() {
                    continue;
                }
                let value = match self.invoke(op.name(), op.invoke(Vec::new())).await {
                    Ok(value) => apply_output(op.output.as_ref(), value)
                        .map_err(|e| DispatchError::execution(op.name(), e)),
                    Err(e) => Err(e),
                };
                match value {
                    Ok(value) => state.push((qualify(&path, op.name()), value)),
                    Err(e) => warn!(operation = op.name(), error = %e, "state operation failed"),
                }
            }
        }
        state
    }

    /// Registered names resembling `input`, best first.
    pub fn suggest(&self, input: &str) -> Vec<String> {
        let mut names: Vec<String> = HELP_COMMANDS
            .iter()
            .chain(STATE_COMMANDS.iter())
            .chain(std::iter::once(&JSON_STATE_COMMAND))
            .map(|s| s.to_string())
            .collect();
        for (_, object) in walk(&self.objects()) {
            for op in object.operations().iter().filter(|op| !op.is_hidden()) {
                names.push(op.name.clone());
                names.extend(op.aliases.iter().cloned());
            }
            for prop in object.properties() {
                names.push(prop.name.clone());
                names.extend(prop.aliases.iter().cloned());
            }
        }
        suggest::rank(
            input,
            names.iter().map(String::as_str),
            self.config.suggestion_threshold,
            self.config.suggestion_window,
        )
    }
}

fn is_builtin(command: &str) -> bool {
    HELP_COMMANDS
        .iter()
        .chain(STATE_COMMANDS.iter())
        .chain(std::iter::once(&JSON_STATE_COMMAND))
        .any(|c| c.eq_ignore_ascii_case(command))
}

/// Candidate interpretations of `parsed`, most specific first.
fn resolve_targets(objects: &[Arc<ControlObject>], parsed: &ParsedInput) -> Vec<Target> {
    let mut targets = Vec::new();
    let qualifiers = parsed.qualifiers();

    if qualifiers.is_empty() {
        targets.push(Target {
            owners: objects.to_vec(),
            command: parsed.name().to_string(),
            args: parsed.arguments.clone(),
        });
        return targets;
    }

    let owners = qualified_owners(objects, qualifiers);
    if !owners.is_empty() {
        targets.push(Target {
            owners,
            command: parsed.name().to_string(),
            args: parsed.arguments.clone(),
        });
    }

    // `Command.arg1.arg2` with no `:` section: dotted segments are arguments.
    if !parsed.has_arguments {
        let segments = &parsed.segments;
        let qualified: Vec<Arc<ControlObject>> = objects
            .iter()
            .filter(|o| o.name().eq_ignore_ascii_case(&segments[0]))
            .cloned()
            .collect();
        if !qualified.is_empty() && segments.len() > 2 {
            targets.push(Target {
                owners: qualified,
                command: segments[1].clone(),
                args: segments[2..].to_vec(),
            });
        }
        targets.push(Target {
            owners: objects.to_vec(),
            command: segments[0].clone(),
            args: segments[1..].to_vec(),
        });
    }
    targets
}

/// Objects named by a non-empty qualifier chain.
fn qualified_owners(
    objects: &[Arc<ControlObject>],
    qualifiers: &[String],
) -> Vec<Arc<ControlObject>> {
    // `Object.Child.Command`: a leading registered object name, then children.
    let owners: Vec<Arc<ControlObject>> = objects
        .iter()
        .filter(|o| o.name().eq_ignore_ascii_case(&qualifiers[0]))
        .filter_map(|o| o.descend(&qualifiers[1..]).cloned())
        .collect();
    if !owners.is_empty() {
        return owners;
    }
    // `Child.Command`: a child chain under any registered object.
    objects
        .iter()
        .filter_map(|o| o.descend(qualifiers).cloned())
        .collect()
}

/// Every object and nested child with its dotted path prefix ("" for roots).
fn walk(objects: &[Arc<ControlObject>]) -> Vec<(String, Arc<ControlObject>)> {
    let mut out = Vec::new();
    let mut stack: Vec<(String, Arc<ControlObject>)> = objects
        .iter()
        .rev()
        .map(|o| (String::new(), Arc::clone(o)))
        .collect();
    while let Some((path, object)) = stack.pop() {
        for child in object.children().iter().rev() {
            stack.push((qualify(&path, child.name()), Arc::clone(child)));
        }
        out.push((path, object));
    }
    out
}

fn qualify(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}{PATH_SEPARATOR}{name}")
    }
}

fn apply_output(output: Option<&OutputConverter>, value: Value) -> Result<Value, HandlerError> {
    match output {
        Some(output) => object::contain(|| Ok(output(&value))),
        None => Ok(value),
    }
}

fn output_value(prop: &StateProperty) -> Result<Value, HandlerError> {
    apply_output(prop.output.as_ref(), prop.try_get()?)
}

fn render_property(prop: &StateProperty) -> Result<String, DispatchError> {
    let value = output_value(prop).map_err(|e| DispatchError::execution(prop.name(), e))?;
    Ok(format!("{}:{}", prop.name(), value::render(&value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::{CancelGuard, Operator};
    use crate::error::ConvertError;
    use crate::object::SharedList;
    use crate::value::ParamKind;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn flag(initial: bool) -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(initial))
    }

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    fn interpreter_with(objects: Vec<Arc<ControlObject>>) -> CommandInterpreter {
        let interp = CommandInterpreter::default();
        for object in objects {
            interp.register(object);
        }
        interp
    }

    #[tokio::test]
    async fn set_time_zone_scenario() {
        let zone = Arc::new(Mutex::new(String::new()));
        let sink = Arc::clone(&zone);
        let clock = ControlObject::builder("Clock")
            .operation(
                Operation::action("SetTimeZone", move |args| {
                    *sink.lock().unwrap() = args[0].as_str().unwrap_or_default().to_string();
                    Ok(())
                })
                .param("zone", ParamKind::String),
            )
            .build();
        let interp = interpreter_with(vec![clock]);
        let mut rx = interp.subscribe();

        let result = interp.interpret("SetTimeZone:America/Toronto").await;
        assert!(result.success);
        assert_eq!(*zone.lock().unwrap(), "America/Toronto");

        let note = rx.recv().await.unwrap();
        assert_eq!(note.kind, NotificationKind::Information);
        assert!(note.message.contains("TimeZone"));
    }

    #[tokio::test]
    async fn unknown_command_fails_silently() {
        let interp = interpreter_with(vec![
            ControlObject::builder("Camera")
                .operation(Operation::action("Snap", |_| Ok(())))
                .build(),
        ]);
        let mut rx = interp.subscribe();
        let result = interp.interpret("Frobnicate").await;
        assert!(!result.success);
        assert!(result.message.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn arity_selects_overload() {
        let no_arg = counter();
        let one_arg = counter();
        let (a, b) = (Arc::clone(&no_arg), Arc::clone(&one_arg));
        let object = ControlObject::builder("Widget")
            .operation(Operation::action("Foo", move |_| {
                a.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .operation(
                Operation::query("Foo", move |args| {
                    b.fetch_add(1, Ordering::SeqCst);
                    Ok(args[0].clone())
                })
                .param("n", ParamKind::Int),
            )
            .build();
        let interp = interpreter_with(vec![object]);

        let result = interp.interpret("Foo:5").await;
        assert_eq!(result.message, "5");
        assert_eq!(no_arg.load(Ordering::SeqCst), 0);
        assert_eq!(one_arg.load(Ordering::SeqCst), 1);

        let result = interp.interpret("foo").await;
        assert_eq!(result.message, "Foo");
        assert_eq!(no_arg.load(Ordering::SeqCst), 1);
        assert_eq!(one_arg.load(Ordering::SeqCst), 1);

        assert!(!interp.interpret("Foo:1,2").await.success);
    }

    #[tokio::test]
    async fn first_successful_overload_wins() {
        let object = ControlObject::builder("Widget")
            .operation(
                Operation::query("Pick", |args| Ok(args[0].clone())).param("n", ParamKind::Int),
            )
            .operation(
                Operation::query("Pick", |args| {
                    Ok(json!(format!("text {}", value::render(&args[0]))))
                })
                .param("s", ParamKind::String),
            )
            .build();
        let interp = interpreter_with(vec![object]);
        assert_eq!(interp.interpret("Pick:7").await.message, "7");
        assert_eq!(interp.interpret("Pick:seven").await.message, "text seven");
    }

    #[tokio::test]
    async fn failed_overloads_all_reported() {
        let object = ControlObject::builder("Widget")
            .operation(
                Operation::query("Pick", |args| Ok(args[0].clone())).param("n", ParamKind::Int),
            )
            .operation(
                Operation::query("Pick", |args| Ok(args[0].clone())).param("b", ParamKind::Bool),
            )
            .build();
        let interp = interpreter_with(vec![object]);
        let result = interp.interpret("Pick:maybe").await;
        assert!(!result.success);
        assert_eq!(result.message.lines().count(), 2);
        assert!(result.message.lines().all(|l| l.starts_with("Conversion error")));
    }

    #[tokio::test]
    async fn matches_across_objects_in_registration_order() {
        let a = ControlObject::builder("Left")
            .operation(Operation::query("Ping", |_| Ok(json!("left"))))
            .build();
        let b = ControlObject::builder("Right")
            .operation(Operation::query("Ping", |_| Ok(json!("right"))))
            .build();
        let interp = interpreter_with(vec![a, b]);
        let result = interp.interpret("Ping").await;
        assert!(result.success);
        assert_eq!(result.message, "left\nright");
        assert_eq!(interp.interpret("Right.Ping").await.message, "right");
    }

    #[tokio::test]
    async fn override_suppresses_plain_matches() {
        let a = ControlObject::builder("Base")
            .operation(Operation::query("Status", |_| Ok(json!("base"))))
            .build();
        let b = ControlObject::builder("Custom")
            .operation(Operation::query("Status", |_| Ok(json!("custom"))).overriding())
            .build();
        let interp = interpreter_with(vec![a, b]);
        assert_eq!(interp.interpret("Status").await.message, "custom");
    }

    #[tokio::test]
    async fn property_round_trip() {
        let iso = Arc::new(Mutex::new(100i64));
        let (get, set) = (Arc::clone(&iso), Arc::clone(&iso));
        let camera = ControlObject::builder("Camera")
            .property(
                StateProperty::new("Iso", ParamKind::Int, move || json!(*get.lock().unwrap()))
                    .setter(move |v| {
                        *set.lock().unwrap() = v.as_i64().ok_or("not an integer")?;
                        Ok(())
                    }),
            )
            .build();
        let interp = interpreter_with(vec![camera]);
        assert_eq!(interp.interpret("Iso:400").await.message, "Iso:400");
        assert_eq!(interp.interpret("Iso").await.message, "Iso:400");
        assert_eq!(*iso.lock().unwrap(), 400);
    }

    #[tokio::test]
    async fn read_only_and_private_properties_reject_sets() {
        let camera = ControlObject::builder("Camera")
            .property(StateProperty::new("Depth", ParamKind::Float, || json!(12.5)))
            .property(
                StateProperty::new("Serial", ParamKind::String, || json!("RF-1"))
                    .setter(|_| Ok(()))
                    .private_set(),
            )
            .build();
        let interp = interpreter_with(vec![camera]);
        assert_eq!(interp.interpret("Depth").await.message, "Depth:12.5");
        assert!(!interp.interpret("Depth:3").await.success);
        assert!(!interp.interpret("Serial:RF-2").await.success);
        assert_eq!(interp.interpret("Serial").await.message, "Serial:RF-1");
    }

    #[tokio::test]
    async fn list_property_merges_into_same_container() {
        let presets = Arc::new(Mutex::new(vec![1i64, 2, 3]));
        let camera = ControlObject::builder("Camera")
            .property(StateProperty::list(
                "Presets",
                ParamKind::Int,
                SharedList::new(Arc::clone(&presets)),
            ))
            .build();
        let interp = interpreter_with(vec![camera]);
        let before = Arc::as_ptr(&presets);

        let result = interp.interpret("Presets:[1,2,3,4]").await;
        assert_eq!(result.message, "Presets:[1,2,3,4]");
        assert_eq!(*presets.lock().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(Arc::as_ptr(&presets), before);
    }

    struct CountingDispatcher(AtomicUsize);

    impl Dispatcher for CountingDispatcher {
        fn invoke<'a>(&self, action: Box<dyn FnOnce() + Send + 'a>) {
            self.0.fetch_add(1, Ordering::SeqCst);
            action();
        }
    }

    #[tokio::test]
    async fn list_merge_goes_through_dispatcher() {
        let presets = Arc::new(Mutex::new(vec![1i64]));
        let camera = ControlObject::builder("Camera")
            .property(StateProperty::list(
                "Presets",
                ParamKind::Int,
                SharedList::new(Arc::clone(&presets)),
            ))
            .build();
        let dispatcher = Arc::new(CountingDispatcher(AtomicUsize::new(0)));
        let interp = CommandInterpreter::default().with_dispatcher(dispatcher.clone());
        interp.register(camera);

        assert!(interp.interpret("Presets:[5,6]").await.success);
        assert_eq!(dispatcher.0.load(Ordering::SeqCst), 1);
        assert_eq!(*presets.lock().unwrap(), vec![5, 6]);
    }

    #[tokio::test]
    async fn guard_blocks_invocation() {
        let recording = flag(true);
        let formats = counter();
        let (rec, runs) = (Arc::clone(&recording), Arc::clone(&formats));
        let camera = ControlObject::builder("Camera")
            .property(StateProperty::new("IsRecording", ParamKind::Bool, move || {
                json!(rec.load(Ordering::SeqCst))
            }))
            .operation(
                Operation::action("FormatStorage", move |_| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .cancel_when(CancelGuard::when("IsRecording", Operator::Eq, true)),
            )
            .build();
        let interp = interpreter_with(vec![camera]);
        let mut rx = interp.subscribe();

        let result = interp.interpret("FormatStorage").await;
        assert!(!result.success);
        assert!(result.message.contains("Cannot"));
        assert_eq!(formats.load(Ordering::SeqCst), 0);
        assert_eq!(rx.recv().await.unwrap().kind, NotificationKind::Error);

        recording.store(false, Ordering::SeqCst);
        assert!(interp.interpret("FormatStorage").await.success);
        assert_eq!(formats.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn property_guard_applies_on_set_only() {
        let camera = ControlObject::builder("Camera")
            .property(StateProperty::new("IsRecording", ParamKind::Bool, || json!(true)))
            .property(
                StateProperty::new("Resolution", ParamKind::String, || json!("4K"))
                    .setter(|_| Ok(()))
                    .cancel_when(
                        CancelGuard::when("IsRecording", Operator::Eq, true)
                            .message("Stop recording before changing resolution"),
                    ),
            )
            .build();
        let interp = interpreter_with(vec![camera]);
        assert_eq!(interp.interpret("Resolution").await.message, "Resolution:4K");
        let result = interp.interpret("Resolution:1080p").await;
        assert!(!result.success);
        assert_eq!(result.message, "Stop recording before changing resolution");
    }

    #[tokio::test]
    async fn conversion_error_names_value() {
        let object = ControlObject::builder("Lights")
            .operation(Operation::action("SetLevel", |_| Ok(())).param("level", ParamKind::Int))
            .build();
        let interp = interpreter_with(vec![object]);
        let result = interp.interpret("SetLevel:bright").await;
        assert!(!result.success);
        assert!(result.message.starts_with("Conversion error"));
        assert!(result.message.contains("'bright'"));
    }

    #[tokio::test]
    async fn named_converter_applies_by_parameter_name() {
        let object = ControlObject::builder("Lights")
            .operation(
                Operation::query("SetLevel", |args| Ok(args[0].clone()))
                    .param("level", ParamKind::Int),
            )
            .build();
        let interp = interpreter_with(vec![object]);
        let named = |raw: &str, _kind: &ParamKind| -> Result<Value, ConvertError> {
            match raw {
                "max" => Ok(json!(100)),
                other => Err(ConvertError::custom(other, "level name")),
            }
        };
        interp.add_converter("Level", named);
        assert_eq!(interp.interpret("SetLevel:max").await.message, "100");
        // JSON coercion still comes first.
        assert_eq!(interp.interpret("SetLevel:42").await.message, "42");
    }

    #[tokio::test]
    async fn execution_error_and_panic_are_contained() {
        let object = ControlObject::builder("Sensor")
            .operation(Operation::query("Read", |_| Err("sensor offline".into())))
            .operation(Operation::action("Crash", |_| panic!("boom")))
            .build();
        let interp = interpreter_with(vec![object]);

        let result = interp.interpret("Read").await;
        assert!(!result.success);
        assert_eq!(result.message, "Execution error in Read: sensor offline");

        let result = interp.interpret("Crash").await;
        assert!(!result.success);
        assert_eq!(result.message, "Execution error in Crash: handler panicked: boom");
    }

    #[tokio::test]
    async fn panicking_property_accessors_are_contained() {
        let object = ControlObject::builder("Sensor")
            .property(
                StateProperty::new("Depth", ParamKind::Float, || panic!("gauge fault"))
                    .remote_state(),
            )
            .property(
                StateProperty::new("Gain", ParamKind::Int, || json!(1))
                    .setter(|_| panic!("gain stuck"))
                    .remote_state(),
            )
            .property(
                StateProperty::new("Temp", ParamKind::Int, || json!(4))
                    .output(|_| panic!("bad units"))
                    .remote_state(),
            )
            .property(StateProperty::new("Heading", ParamKind::Int, || json!(270)).remote_state())
            .build();
        let interp = interpreter_with(vec![object]);

        let result = interp.interpret("Depth").await;
        assert!(!result.success);
        assert_eq!(result.message, "Execution error in Depth: handler panicked: gauge fault");

        let result = interp.interpret("Gain:3").await;
        assert!(!result.success);
        assert_eq!(result.message, "Execution error in Gain: handler panicked: gain stuck");

        assert!(!interp.interpret("Temp").await.success);

        // Failing entries are left out of the dump; the rest still report.
        assert_eq!(interp.get_state().await, "Gain:1\nHeading:270");
    }

    #[tokio::test]
    async fn panicking_getter_does_not_trip_guard() {
        let fired = counter();
        let hits = Arc::clone(&fired);
        let object = ControlObject::builder("Camera")
            .property(StateProperty::new("IsRecording", ParamKind::Bool, || panic!("no sensor")))
            .operation(
                Operation::action("Snap", move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .cancel_when(CancelGuard::when("IsRecording", Operator::Eq, true)),
            )
            .build();
        let interp = interpreter_with(vec![object]);
        assert!(interp.interpret("Snap").await.success);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invoke_timeout_abandons_hung_operation() {
        let object = ControlObject::builder("Sensor")
            .operation(Operation::task("Calibrate", |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Value::Null)
            }))
            .build();
        let config = InterpreterConfig {
            invoke_timeout_ms: Some(100),
            ..InterpreterConfig::default()
        };
        let interp = CommandInterpreter::new(config);
        interp.register(object);
        let result = interp.interpret("Calibrate").await;
        assert!(!result.success);
        assert!(result.message.contains("timed out after 100 ms"));
    }

    #[tokio::test]
    async fn async_operation_result_is_awaited() {
        let object = ControlObject::builder("Storage")
            .operation(Operation::task("FreeSpace", |_| async { Ok(json!(512)) }).prefix("Free"))
            .operation(Operation::query("Files", |_| Ok(json!(["a.mp4", "b.mp4"]))))
            .build();
        let interp = interpreter_with(vec![object]);
        assert_eq!(interp.interpret("FreeSpace").await.message, "Free:512");
        assert_eq!(interp.interpret("Files").await.message, r#"["a.mp4","b.mp4"]"#);
    }

    #[tokio::test]
    async fn nested_object_paths() {
        let focus = Arc::new(Mutex::new(1.0f64));
        let (get, set) = (Arc::clone(&focus), Arc::clone(&focus));
        let lens = ControlObject::builder("Lens")
            .property(
                StateProperty::new("Focus", ParamKind::Float, move || json!(*get.lock().unwrap()))
                    .setter(move |v| {
                        *set.lock().unwrap() = v.as_f64().ok_or("not a number")?;
                        Ok(())
                    }),
            )
            .build();
        let camera = ControlObject::builder("Camera").child(lens).build();
        let interp = interpreter_with(vec![camera]);

        assert_eq!(interp.interpret("Camera.Lens.Focus:2.5").await.message, "Focus:2.5");
        assert_eq!(interp.interpret("Lens.Focus").await.message, "Focus:2.5");
        assert!(!interp.interpret("Focus").await.success);
    }

    #[tokio::test]
    async fn dotted_segments_become_arguments() {
        let object = ControlObject::builder("Camera")
            .operation(
                Operation::query("SetMode", |args| Ok(args[0].clone()))
                    .param("mode", ParamKind::enumeration("Mode", &["Photo", "Video"])),
            )
            .build();
        let interp = interpreter_with(vec![object]);
        assert_eq!(interp.interpret("SetMode.video").await.message, "Video");
        assert_eq!(interp.interpret("Camera.SetMode.Photo").await.message, "Photo");
    }

    #[tokio::test]
    async fn help_lists_visible_signatures_sorted() {
        let object = ControlObject::builder("Camera")
            .operation(Operation::action("Snap", |_| Ok(())))
            .operation(Operation::action("Debug", |_| Ok(())).hidden())
            .operation(
                Operation::action("SetExposure", |_| Ok(()))
                    .param("iso", ParamKind::Int)
                    .param("ev", ParamKind::Float),
            )
            .build();
        let interp = interpreter_with(vec![object]);
        let result = interp.interpret("?").await;
        assert!(result.success);
        assert_eq!(result.message, "SetExposure: Int iso, Float ev\nSnap");
        assert_eq!(interp.interpret("help").await.message, result.message);
    }

    #[tokio::test]
    async fn state_dumps() {
        let lens = ControlObject::builder("Lens")
            .property(StateProperty::new("Focus", ParamKind::Float, || json!(1.5)).remote_state())
            .build();
        let camera = ControlObject::builder("Camera")
            .property(
                StateProperty::new("IsRecording", ParamKind::Bool, || json!(false)).remote_state(),
            )
            .property(StateProperty::new("Secret", ParamKind::String, || json!("x")))
            .property(
                StateProperty::new("Presets", ParamKind::list_of(ParamKind::Int), || json!([1, 2]))
                    .remote_state(),
            )
            .operation(Operation::query("Battery", |_| Ok(json!(87))).remote_state())
            .child(lens)
            .build();
        let interp = interpreter_with(vec![camera]);

        let state = interp.interpret("State").await.message;
        assert_eq!(
            state,
            "IsRecording:false\nPresets:[1,2]\nBattery:87\nLens.Focus:1.5"
        );

        let message = interp.interpret("GetJSONState").await.message;
        let json_state: Value = serde_json::from_str(&message).unwrap();
        assert_eq!(
            json_state,
            json!({"IsRecording": false, "Presets": [1, 2], "Battery": 87, "Lens.Focus": 1.5})
        );
    }

    #[tokio::test]
    async fn suggestions_when_enabled() {
        let object = ControlObject::builder("Camera")
            .operation(Operation::action("StartRecording", |_| Ok(())))
            .build();
        let config = InterpreterConfig {
            suggestions: true,
            ..InterpreterConfig::default()
        };
        let interp = CommandInterpreter::new(config);
        interp.register(object);
        let result = interp.interpret("StartRecordin").await;
        assert!(!result.success);
        assert_eq!(result.message, "Did you mean StartRecording?");
    }

    #[test]
    fn register_replaces_and_unregister_removes() {
        let object = ControlObject::builder("Camera").build();
        let interp = CommandInterpreter::default();
        interp.register(Arc::clone(&object));
        interp.register(Arc::clone(&object));
        assert_eq!(interp.objects().len(), 1);
        assert!(interp.unregister(object.id()));
        assert!(!interp.unregister(object.id()));
        assert!(interp.objects().is_empty());
    }

    #[test]
    fn has_operation_matches_what_dispatch_resolves() {
        let lens = ControlObject::builder("Lens")
            .operation(Operation::action("Zoom", |_| Ok(())))
            .build();
        let camera = ControlObject::builder("Camera")
            .operation(Operation::action("Snap", |_| Ok(())))
            .child(lens)
            .build();
        let interp = interpreter_with(vec![camera]);
        assert!(interp.has_operation("snap"));
        assert!(interp.has_operation("Camera.Snap"));
        assert!(interp.has_operation("Lens.Zoom"));
        assert!(interp.has_operation("camera.lens.zoom"));
        assert!(interp.has_operation("Help"));
        assert!(!interp.has_operation("Zoom"));
        assert!(!interp.has_operation("Lens.Snap"));
        assert!(!interp.has_operation("Frobnicate"));
    }

    #[tokio::test]
    async fn closed_subscribers_are_pruned() {
        let interp = interpreter_with(vec![
            ControlObject::builder("Camera")
                .operation(Operation::action("Snap", |_| Ok(())))
                .build(),
        ]);
        drop(interp.subscribe());
        let mut live = interp.subscribe();
        interp.interpret("Snap").await;
        assert_eq!(live.recv().await.unwrap().command, "Snap");
        assert_eq!(interp.subscribers.lock().unwrap().len(), 1);
    }
}
