//! Remote command interpretation and message framing for the Rayfin subsea
//! camera.
//!
//! Device components register as [`ControlObject`]s. Text commands arriving
//! over a transport are framed by [`DataAppender`], translated by
//! [`AliasManager`], and resolved, guarded, converted, and invoked by
//! [`CommandInterpreter`].

pub mod alias;
pub mod appender;
pub mod cancel;
pub mod config;
pub mod convert;
pub mod error;
pub mod interpreter;
pub mod object;
pub mod parse;
pub mod server;
pub mod settings;
pub mod suggest;
pub mod value;

pub use alias::{AliasManager, CommandAlias};
pub use appender::{DataAppender, FrameBuffer};
pub use cancel::{CancelCondition, CancelGuard, Operator, StateSource};
pub use config::{Config, FramerConfig, InterpreterConfig, ServerConfig};
pub use convert::ArgConverter;
pub use error::{
    AliasError, ConfigError, ConnError, ConvertError, DispatchError, HandlerError, SettingsError,
};
pub use interpreter::{
    CommandInterpreter, CommandOutcome, Dispatcher, InterpretationResult, Notification,
    NotificationKind,
};
pub use object::{ControlObject, ObjectId, Operation, StateProperty};
pub use parse::ParsedInput;
pub use server::{CommandServer, StreamTransport, Transport};
pub use settings::{JsonFileSettings, MemorySettings, SettingEntry, SettingsStore};
pub use value::{ParamKind, Value};
