//! Controllable objects and their operation/property descriptors.
//!
//! A device component exposes itself to the interpreter by building a
//! [`ControlObject`]: a named table of [`Operation`]s (invocable with typed
//! parameters), [`StateProperty`]s (readable, optionally settable), and nested
//! child objects reachable with dotted paths.
//!
//! ```
//! use std::sync::{Arc, Mutex};
//! use rayfin::object::{ControlObject, Operation, StateProperty};
//! use rayfin::value::{ParamKind, Value};
//!
//! let iso = Arc::new(Mutex::new(100i64));
//! let get = Arc::clone(&iso);
//! let set = Arc::clone(&iso);
//! let camera = ControlObject::builder("Camera")
//!     .property(
//!         StateProperty::new("Iso", ParamKind::Int, move || Value::from(*get.lock().unwrap()))
//!             .setter(move |v| {
//!                 *set.lock().unwrap() = v.as_i64().unwrap_or_default();
//!                 Ok(())
//!             }),
//!     )
//!     .operation(Operation::action("Snap", |_| Ok(())))
//!     .build();
//! assert_eq!(camera.name(), "Camera");
//! ```

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::cancel::{CancelGuard, StateSource};
use crate::convert::ArgConverter;
use crate::error::HandlerError;
use crate::parse::PATH_SEPARATOR;
use crate::value::{ParamKind, Value};

/// Boxed future returned by asynchronous operation handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send>>;

type Handler = Arc<dyn Fn(Vec<Value>) -> HandlerFuture + Send + Sync>;
type Getter = Arc<dyn Fn() -> Value + Send + Sync>;
type Setter = Arc<dyn Fn(Value) -> Result<(), HandlerError> + Send + Sync>;

/// Maps a result value before it is rendered.
pub type OutputConverter = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a built [`ControlObject`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// A named, typed parameter slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub kind: ParamKind,
}

/// What an operation hands back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnKind {
    /// Nothing; the interpreter confirms with the operation name.
    Void,
    Value,
    /// A value produced by an awaited future.
    Async,
}

/// An invocable command on a control object.
pub struct Operation {
    pub(crate) name: String,
    pub(crate) aliases: Vec<String>,
    pub(crate) params: Vec<Param>,
    pub(crate) returns: ReturnKind,
    pub(crate) hidden: bool,
    pub(crate) overrides: bool,
    pub(crate) remote_state: bool,
    pub(crate) converter: Option<Arc<dyn ArgConverter>>,
    pub(crate) output: Option<OutputConverter>,
    pub(crate) prefix: Option<String>,
    pub(crate) guards: Vec<CancelGuard>,
    handler: Handler,
}

impl Operation {
    fn with_handler(name: &str, returns: ReturnKind, handler: Handler) -> Self {
        Self {
            name: name.to_string(),
            aliases: Vec::new(),
            params: Vec::new(),
            returns,
            hidden: false,
            overrides: false,
            remote_state: false,
            converter: None,
            output: None,
            prefix: None,
            guards: Vec::new(),
            handler,
        }
    }

    /// An operation with no result value.
    pub fn action<F>(name: &str, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let handler: Handler = Arc::new(move |args| -> HandlerFuture {
            let f = Arc::clone(&f);
            Box::pin(async move { f(args).map(|()| Value::Null) })
        });
        Self::with_handler(name, ReturnKind::Void, handler)
    }

    /// An operation returning a value synchronously.
    pub fn query<F>(name: &str, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let handler: Handler = Arc::new(move |args| -> HandlerFuture {
            let f = Arc::clone(&f);
            Box::pin(async move { f(args) })
        });
        Self::with_handler(name, ReturnKind::Value, handler)
    }

    /// An operation whose result is awaited.
    pub fn task<F, Fut>(name: &str, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: Handler = Arc::new(move |args| -> HandlerFuture {
            let f = Arc::clone(&f);
            Box::pin(async move { f(args).await })
        });
        Self::with_handler(name, ReturnKind::Async, handler)
    }

    pub fn param(mut self, name: &str, kind: ParamKind) -> Self {
        self.params.push(Param {
            name: name.to_string(),
            kind,
        });
        self
    }

    pub fn alias(mut self, alias: &str) -> Self {
        self.aliases.push(alias.to_string());
        self
    }

    /// Leave this operation out of the `Help` listing.
    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    /// Suppress every non-overriding operation resolved under the same name.
    pub fn overriding(mut self) -> Self {
        self.overrides = true;
        self
    }

    /// Include this (zero-parameter) operation's result in state dumps.
    pub fn remote_state(mut self) -> Self {
        self.remote_state = true;
        self
    }

    pub fn converter(mut self, converter: impl ArgConverter + 'static) -> Self {
        self.converter = Some(Arc::new(converter));
        self
    }

    pub fn output(mut self, f: impl Fn(&Value) -> Value + Send + Sync + 'static) -> Self {
        self.output = Some(Arc::new(f));
        self
    }

    /// Prepend `prefix:` to every rendered result.
    pub fn prefix(mut self, prefix: &str) -> Self {
        self.prefix = Some(prefix.to_string());
        self
    }

    pub fn cancel_when(mut self, guard: CancelGuard) -> Self {
        self.guards.push(guard);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn returns(&self) -> ReturnKind {
        self.returns
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden
    }

    /// Case-insensitive match against the name and every alias.
    pub fn answers_to(&self, command: &str) -> bool {
        matches_name(&self.name, &self.aliases, command)
    }

    /// `Name: Kind param, Kind param` as listed by `Help`.
    pub fn signature(&self) -> String {
        if self.params.is_empty() {
            return self.name.clone();
        }
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| format!("{} {}", p.kind, p.name))
            .collect();
        format!("{}: {}", self.name, params.join(", "))
    }

    /// The handler's future. Handler code runs only when it is polled.
    pub(crate) fn invoke(&self, args: Vec<Value>) -> HandlerFuture {
        (self.handler)(args)
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .field("params", &self.params)
            .field("returns", &self.returns)
            .field("hidden", &self.hidden)
            .field("overrides", &self.overrides)
            .field("guards", &self.guards.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// StateProperty
// ---------------------------------------------------------------------------

/// How a property accepts remote writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settability {
    ReadOnly,
    /// Settable through the setter, subject to cancel guards.
    Settable,
    /// List merged element-wise into the existing container.
    ListMerge,
}

/// A list container that can be merged in place.
pub trait ListHandle: Send + Sync {
    /// Current contents as a JSON array.
    fn snapshot(&self) -> Value;

    /// Make the list equal to `incoming` without replacing the container:
    /// differing elements are overwritten, surplus ones truncated, missing
    /// ones appended.
    fn make_equal(&self, incoming: Vec<Value>) -> Result<(), HandlerError>;
}

/// A shared `Vec<T>` exposed as a mergeable list property.
pub struct SharedList<T>(Arc<Mutex<Vec<T>>>);

impl<T> SharedList<T> {
    pub fn new(list: Arc<Mutex<Vec<T>>>) -> Self {
        Self(list)
    }
}

impl<T> ListHandle for SharedList<T>
where
    T: Serialize + DeserializeOwned + PartialEq + Send + 'static,
{
    fn snapshot(&self) -> Value {
        let list = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_value(&*list).unwrap_or(Value::Null)
    }

    fn make_equal(&self, incoming: Vec<Value>) -> Result<(), HandlerError> {
        let incoming = incoming
            .into_iter()
            .map(serde_json::from_value::<T>)
            .collect::<Result<Vec<T>, _>>()?;
        let mut list = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        make_equal(&mut *list, incoming);
        Ok(())
    }
}

/// Element-wise merge of `incoming` into `list`.
pub fn make_equal<T: PartialEq>(list: &mut Vec<T>, incoming: Vec<T>) {
    list.truncate(incoming.len());
    for (i, item) in incoming.into_iter().enumerate() {
        match list.get_mut(i) {
            Some(slot) if *slot == item => {}
            Some(slot) => *slot = item,
            None => list.push(item),
        }
    }
}

enum Access {
    Scalar { get: Getter, set: Option<Setter> },
    List(Arc<dyn ListHandle>),
}

/// A readable (and optionally writable) piece of object state.
pub struct StateProperty {
    pub(crate) name: String,
    pub(crate) aliases: Vec<String>,
    pub(crate) kind: ParamKind,
    pub(crate) private_set: bool,
    pub(crate) remote_state: bool,
    pub(crate) converter: Option<Arc<dyn ArgConverter>>,
    pub(crate) output: Option<OutputConverter>,
    pub(crate) guards: Vec<CancelGuard>,
    access: Access,
}

impl StateProperty {
    /// A read-only property; add [`setter`](Self::setter) to make it writable.
    pub fn new<G>(name: &str, kind: ParamKind, get: G) -> Self
    where
        G: Fn() -> Value + Send + Sync + 'static,
    {
        Self::with_access(
            name,
            kind,
            Access::Scalar {
                get: Arc::new(get),
                set: None,
            },
        )
    }

    /// A list property backed by a mergeable container.
    pub fn list(name: &str, element: ParamKind, handle: impl ListHandle + 'static) -> Self {
        Self::with_access(name, ParamKind::list_of(element), Access::List(Arc::new(handle)))
    }

    fn with_access(name: &str, kind: ParamKind, access: Access) -> Self {
        Self {
            name: name.to_string(),
            aliases: Vec::new(),
            kind,
            private_set: false,
            remote_state: false,
            converter: None,
            output: None,
            guards: Vec::new(),
            access,
        }
    }

    pub fn setter<S>(mut self, set: S) -> Self
    where
        S: Fn(Value) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        if let Access::Scalar { set: slot, .. } = &mut self.access {
            *slot = Some(Arc::new(set));
        }
        self
    }

    pub fn alias(mut self, alias: &str) -> Self {
        self.aliases.push(alias.to_string());
        self
    }

    /// Settable locally but never from a remote command.
    pub fn private_set(mut self) -> Self {
        self.private_set = true;
        self
    }

    /// Include this property in `State` and `GetJSONState` dumps.
    pub fn remote_state(mut self) -> Self {
        self.remote_state = true;
        self
    }

    pub fn converter(mut self, converter: impl ArgConverter + 'static) -> Self {
        self.converter = Some(Arc::new(converter));
        self
    }

    pub fn output(mut self, f: impl Fn(&Value) -> Value + Send + Sync + 'static) -> Self {
        self.output = Some(Arc::new(f));
        self
    }

    pub fn cancel_when(mut self, guard: CancelGuard) -> Self {
        self.guards.push(guard);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ParamKind {
        &self.kind
    }

    pub fn settability(&self) -> Settability {
        match &self.access {
            Access::List(_) => Settability::ListMerge,
            Access::Scalar { set: Some(_), .. } => Settability::Settable,
            Access::Scalar { set: None, .. } => Settability::ReadOnly,
        }
    }

    /// Whether a remote command may write this property.
    pub fn remotely_settable(&self) -> bool {
        match self.settability() {
            Settability::ListMerge => true,
            Settability::Settable => !self.private_set,
            Settability::ReadOnly => false,
        }
    }

    pub fn answers_to(&self, command: &str) -> bool {
        matches_name(&self.name, &self.aliases, command)
    }

    /// Current raw value (before any output converter).
    pub fn get(&self) -> Value {
        match &self.access {
            Access::Scalar { get, .. } => get(),
            Access::List(handle) => handle.snapshot(),
        }
    }

    /// [`get`](Self::get) with a panicking getter reported as an error.
    pub fn try_get(&self) -> Result<Value, HandlerError> {
        contain(|| Ok(self.get()))
    }

    /// Write through the setter. A panicking setter is reported as an error.
    pub(crate) fn set(&self, value: Value) -> Result<(), HandlerError> {
        contain(|| match &self.access {
            Access::Scalar { set: Some(set), .. } => set(value),
            Access::Scalar { set: None, .. } => Err(format!("{} is read-only", self.name).into()),
            Access::List(handle) => match value {
                Value::Array(items) => handle.make_equal(items),
                other => handle.make_equal(vec![other]),
            },
        })
    }

    pub(crate) fn list_handle(&self) -> Option<Arc<dyn ListHandle>> {
        match &self.access {
            Access::List(handle) => Some(Arc::clone(handle)),
            Access::Scalar { .. } => None,
        }
    }
}

impl fmt::Debug for StateProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateProperty")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("settability", &self.settability())
            .field("private_set", &self.private_set)
            .field("remote_state", &self.remote_state)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ControlObject
// ---------------------------------------------------------------------------

/// A registrable component: its operations, properties, and child objects.
#[derive(Debug)]
pub struct ControlObject {
    id: ObjectId,
    name: String,
    operations: Vec<Operation>,
    properties: Vec<StateProperty>,
    children: Vec<Arc<ControlObject>>,
}

impl ControlObject {
    pub fn builder(name: &str) -> ObjectBuilder {
        ObjectBuilder {
            name: name.to_string(),
            operations: Vec::new(),
            properties: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn properties(&self) -> &[StateProperty] {
        &self.properties
    }

    pub fn children(&self) -> &[Arc<ControlObject>] {
        &self.children
    }

    /// Child object by name (case-insensitive).
    pub fn child(&self, name: &str) -> Option<&Arc<ControlObject>> {
        self.children.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn property(&self, name: &str) -> Option<&StateProperty> {
        self.properties.iter().find(|p| p.answers_to(name))
    }

    /// Walk `chain` through child objects, starting at this object.
    pub fn descend<'a>(self: &'a Arc<Self>, chain: &[String]) -> Option<&'a Arc<ControlObject>> {
        let mut current = self;
        for segment in chain {
            current = current.child(segment)?;
        }
        Some(current)
    }
}

impl StateSource for ControlObject {
    /// Resolve a dotted property path (`Child.Property`) to its current value.
    fn read(&self, path: &str) -> Option<Value> {
        let mut segments: Vec<&str> = path.split(PATH_SEPARATOR).map(str::trim).collect();
        let last = segments.pop()?;
        let mut current = self;
        for segment in segments {
            current = current.child(segment)?;
        }
        // A getter that panics reads as missing.
        current.property(last)?.try_get().ok()
    }
}

/// Builder for [`ControlObject`].
pub struct ObjectBuilder {
    name: String,
    operations: Vec<Operation>,
    properties: Vec<StateProperty>,
    children: Vec<Arc<ControlObject>>,
}

impl ObjectBuilder {
    pub fn operation(mut self, op: Operation) -> Self {
        self.operations.push(op);
        self
    }

    pub fn property(mut self, prop: StateProperty) -> Self {
        self.properties.push(prop);
        self
    }

    /// Nest another object, reachable as `Parent.Child.Command`.
    pub fn child(mut self, child: Arc<ControlObject>) -> Self {
        self.children.push(child);
        self
    }

    pub fn build(self) -> Arc<ControlObject> {
        Arc::new(ControlObject {
            id: ObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)),
            name: self.name,
            operations: self.operations,
            properties: self.properties,
            children: self.children,
        })
    }
}

/// Run user code, turning a panic into a [`HandlerError`].
pub(crate) fn contain<T>(f: impl FnOnce() -> Result<T, HandlerError>) -> Result<T, HandlerError> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| Err(panic_message(&*payload).into()))
}

/// `handler panicked`, plus the panic text when it carried one.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    let text = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str));
    match text {
        Some(text) => format!("handler panicked: {text}"),
        None => "handler panicked".to_string(),
    }
}

fn matches_name(name: &str, aliases: &[String], command: &str) -> bool {
    name.eq_ignore_ascii_case(command) || aliases.iter().any(|a| a.eq_ignore_ascii_case(command))
}
