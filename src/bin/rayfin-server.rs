//! Serve the Rayfin text command protocol over TCP.
//!
//! Registers a simulated camera, loads persisted command aliases, and
//! accepts connections on the configured address.
//!
//! ```text
//! RUST_LOG=rayfin=debug rayfin-server --config rayfin.json --bind 0.0.0.0:5000
//! ```

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rayfin::object::SharedList;
use rayfin::{
    AliasManager, CancelGuard, CommandInterpreter, CommandServer, Config, ControlObject,
    JsonFileSettings, MemorySettings, NotificationKind, Operation, Operator, ParamKind,
    SettingsStore, StateProperty, Value,
};

/// Rayfin command server.
#[derive(Parser, Debug)]
#[command(name = "rayfin-server", version, about)]
struct Cli {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address (overrides the config file)
    #[arg(long)]
    bind: Option<String>,

    /// Alias settings file (overrides the config file)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Answer unknown commands with "Did you mean ...?"
    #[arg(long)]
    suggest: bool,
}

#[derive(Debug, Serialize)]
struct CameraState {
    recording: bool,
    iso: i64,
    mode: String,
    time_zone: String,
}

type Shared = Arc<Mutex<CameraState>>;

fn with_state<T>(state: &Shared, f: impl FnOnce(&mut CameraState) -> T) -> T {
    f(&mut state.lock().unwrap_or_else(PoisonError::into_inner))
}

/// A simulated camera exposing the usual recording controls.
fn camera() -> Arc<ControlObject> {
    let state: Shared = Arc::new(Mutex::new(CameraState {
        recording: false,
        iso: 100,
        mode: "Video".into(),
        time_zone: "UTC".into(),
    }));
    let presets = Arc::new(Mutex::new(vec![100i64, 400, 1600]));
    let not_while_recording = || CancelGuard::when("IsRecording", Operator::Eq, true);

    ControlObject::builder("Camera")
        .property(
            StateProperty::new("IsRecording", ParamKind::Bool, {
                let state = state.clone();
                move || Value::from(with_state(&state, |s| s.recording))
            })
            .alias("Recording")
            .remote_state(),
        )
        .property(
            StateProperty::new("Iso", ParamKind::Int, {
                let state = state.clone();
                move || Value::from(with_state(&state, |s| s.iso))
            })
            .setter({
                let state = state.clone();
                move |v| {
                    let iso = v
                        .as_i64()
                        .filter(|i| (50..=6400).contains(i))
                        .ok_or("ISO must be 50..6400")?;
                    with_state(&state, |s| s.iso = iso);
                    Ok(())
                }
            })
            .cancel_when(not_while_recording())
            .remote_state(),
        )
        .property(
            StateProperty::new(
                "Mode",
                ParamKind::enumeration("CaptureMode", &["Photo", "Video", "Timelapse"]),
                {
                    let state = state.clone();
                    move || Value::from(with_state(&state, |s| s.mode.clone()))
                },
            )
            .setter({
                let state = state.clone();
                move |v| {
                    let mode = v.as_str().ok_or("mode must be text")?.to_string();
                    with_state(&state, |s| s.mode = mode);
                    Ok(())
                }
            })
            .cancel_when(not_while_recording())
            .remote_state(),
        )
        .property(
            StateProperty::list("IsoPresets", ParamKind::Int, SharedList::new(presets))
                .remote_state(),
        )
        .operation(Operation::action("StartRecording", {
            let state = state.clone();
            move |_| {
                with_state(&state, |s| s.recording = true);
                Ok(())
            }
        }))
        .operation(Operation::action("StopRecording", {
            let state = state.clone();
            move |_| {
                with_state(&state, |s| s.recording = false);
                Ok(())
            }
        }))
        .operation(
            Operation::action("FormatStorage", |_| Ok(()))
                .cancel_when(
                    not_while_recording().message("Stop recording before formatting storage"),
                ),
        )
        .operation(
            Operation::action("SetTimeZone", {
                let state = state.clone();
                move |args| {
                    let zone = args
                        .first()
                        .and_then(Value::as_str)
                        .ok_or("time zone required")?
                        .to_string();
                    with_state(&state, |s| s.time_zone = zone);
                    Ok(())
                }
            })
            .param("zone", ParamKind::String),
        )
        .operation(
            Operation::query("Settings", move |_| {
                Ok(with_state(&state, |s| serde_json::to_value(&*s))?)
            })
            .hidden(),
        )
        .build()
}

/// Alias administration exposed as commands. Holds the manager weakly so the
/// interpreter it is registered with does not keep it alive.
fn alias_admin(aliases: &Arc<AliasManager>) -> Arc<ControlObject> {
    fn manager(weak: &Weak<AliasManager>) -> Result<Arc<AliasManager>, rayfin::HandlerError> {
        weak.upgrade().ok_or_else(|| "alias manager unavailable".into())
    }
    fn text(args: &[Value], i: usize) -> String {
        args.get(i).and_then(Value::as_str).unwrap_or_default().to_string()
    }

    let (w1, w2, w3, w4, w5) = (
        Arc::downgrade(aliases),
        Arc::downgrade(aliases),
        Arc::downgrade(aliases),
        Arc::downgrade(aliases),
        Arc::downgrade(aliases),
    );
    ControlObject::builder("Aliases")
        .operation(
            Operation::action("AddAlias", move |args| {
                manager(&w1)?.add_command_alias(&text(&args, 0), &text(&args, 1))?;
                Ok(())
            })
            .param("command", ParamKind::String)
            .param("alias", ParamKind::String),
        )
        .operation(
            Operation::action("AddReply", move |args| {
                manager(&w2)?.add_command_reply(&text(&args, 0), &text(&args, 1))?;
                Ok(())
            })
            .param("command", ParamKind::String)
            .param("reply", ParamKind::String),
        )
        .operation(
            Operation::query("RemoveAlias", move |args| {
                let removed =
                    manager(&w3)?.remove_command_alias(&text(&args, 0), &text(&args, 1))?;
                Ok(Value::from(removed))
            })
            .param("command", ParamKind::String)
            .param("alias", ParamKind::String),
        )
        .operation(
            Operation::query("ClearAliases", move |args| {
                Ok(Value::from(manager(&w4)?.clear_command(&text(&args, 0))?))
            })
            .param("command", ParamKind::String),
        )
        .operation(Operation::query("ListAliases", move |_| {
            let table: Vec<Value> = manager(&w5)?
                .aliases()
                .iter()
                .map(|a| {
                    serde_json::json!({
                        "command": a.internal_command(),
                        "aliases": a.input_commands(),
                        "replies": a.reply_commands(),
                    })
                })
                .collect();
            Ok(Value::Array(table))
        }))
        .build()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    if cli.settings.is_some() {
        config.settings_path = cli.settings;
    }
    config.interpreter.suggestions |= cli.suggest;

    let interpreter = Arc::new(CommandInterpreter::new(config.interpreter.clone()));
    interpreter.register(camera());

    let settings: Arc<dyn SettingsStore> = match &config.settings_path {
        Some(path) => Arc::new(JsonFileSettings::open(path)?),
        None => Arc::new(MemorySettings::new()),
    };
    let aliases = Arc::new(AliasManager::new(Arc::clone(&interpreter), settings));
    interpreter.register(alias_admin(&aliases));
    aliases.load()?;

    let mut notifications = interpreter.subscribe();
    tokio::spawn(async move {
        while let Some(n) = notifications.recv().await {
            match n.kind {
                NotificationKind::Information => info!(command = %n.command, "{}", n.message),
                NotificationKind::Error => warn!(command = %n.command, "{}", n.message),
            }
        }
    });

    let server =
        Arc::new(CommandServer::new(interpreter, config.framer.clone()).with_aliases(aliases));
    server.listen(config.server.bind.as_str()).await?;
    Ok(())
}
