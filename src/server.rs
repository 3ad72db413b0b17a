//! Text command server over TCP or any async byte stream.
//!
//! Per connection: bytes → [`DataAppender`] → alias translation →
//! [`CommandInterpreter::interpret`] → response lines, then any reply aliases
//! configured for the command. Messages on one connection are handled one at
//! a time, in arrival order.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::alias::AliasManager;
use crate::appender::DataAppender;
use crate::config::FramerConfig;
use crate::error::ConnError;
use crate::interpreter::CommandInterpreter;
use crate::parse::ParsedInput;

/// Appended to every outbound message.
pub const LINE_ENDING: &str = "\n";

/// Outbound half of a connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one message; the transport adds the line ending.
    async fn send(&self, message: &str) -> Result<(), ConnError>;
}

/// [`Transport`] over any async writer. Concurrent sends are serialized.
pub struct StreamTransport<W> {
    writer: Mutex<W>,
}

impl<W> StreamTransport<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl<W> Transport for StreamTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, message: &str) -> Result<(), ConnError> {
        let mut writer = self.writer.lock().await;
        let mut wire = String::with_capacity(message.len() + LINE_ENDING.len());
        wire.push_str(message);
        wire.push_str(LINE_ENDING);
        writer.write_all(wire.as_bytes()).await.map_err(map_write_err)?;
        writer.flush().await.map_err(map_write_err)?;
        Ok(())
    }
}

fn map_write_err(e: io::Error) -> ConnError {
    match e.kind() {
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => ConnError::Disconnected,
        _ => ConnError::Io(e),
    }
}

/// Serves the text command protocol.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use rayfin::{CommandInterpreter, CommandServer, FramerConfig};
///
/// # async fn run() -> Result<(), rayfin::ConnError> {
/// let interpreter = Arc::new(CommandInterpreter::default());
/// let server = Arc::new(CommandServer::new(interpreter, FramerConfig::default()));
/// server.listen("0.0.0.0:5000").await
/// # }
/// ```
pub struct CommandServer {
    interpreter: Arc<CommandInterpreter>,
    aliases: Option<Arc<AliasManager>>,
    framer: FramerConfig,
}

impl CommandServer {
    pub fn new(interpreter: Arc<CommandInterpreter>, framer: FramerConfig) -> Self {
        Self {
            interpreter,
            aliases: None,
            framer,
        }
    }

    /// Translate aliased input and send reply aliases after completion.
    pub fn with_aliases(mut self, aliases: Arc<AliasManager>) -> Self {
        self.aliases = Some(aliases);
        self
    }

    /// Bind `addr` and serve connections until accepting fails.
    pub async fn listen(self: Arc<Self>, addr: impl ToSocketAddrs) -> Result<(), ConnError> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "command server listening");
        self.serve_tcp(listener).await
    }

    /// Serve every connection accepted on `listener`, each on its own task.
    pub async fn serve_tcp(self: Arc<Self>, listener: TcpListener) -> Result<(), ConnError> {
        loop {
            let (stream, peer) = listener.accept().await?;
            // Short command lines; disable Nagle to avoid latency.
            let _ = stream.set_nodelay(true);
            info!(%peer, "client connected");
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                match server.serve_stream(stream).await {
                    Ok(()) => info!(%peer, "client disconnected"),
                    Err(e) => warn!(%peer, error = %e, "session ended with error"),
                }
            });
        }
    }

    /// Run one session until the peer closes its side of `stream`.
    ///
    /// A partial message left at end of input is flushed and handled.
    pub async fn serve_stream<S>(&self, stream: S) -> Result<(), ConnError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, writer) = tokio::io::split(stream);
        let transport = StreamTransport::new(writer);
        let (appender, mut messages) = DataAppender::new(&self.framer)?;
        let mut buf = [0u8; 4096];
        // Bytes of a UTF-8 sequence split across reads.
        let mut carry: Vec<u8> = Vec::new();

        loop {
            tokio::select! {
                biased;
                Some(message) = messages.recv() => {
                    self.handle_message(&transport, &message).await?;
                }
                read = reader.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        break;
                    }
                    carry.extend_from_slice(&buf[..n]);
                    let text = take_utf8(&mut carry);
                    if !text.is_empty() {
                        appender.append(&text);
                    }
                }
            }
        }

        if !carry.is_empty() {
            appender.append(&String::from_utf8_lossy(&carry));
        }
        appender.stop();
        while let Ok(message) = messages.try_recv() {
            self.handle_message(&transport, &message).await?;
        }
        Ok(())
    }

    /// Interpret one framed message and write the response.
    pub async fn handle_message(
        &self,
        transport: &dyn Transport,
        message: &str,
    ) -> Result<(), ConnError> {
        let line = message.trim();
        if line.is_empty() {
            return Ok(());
        }
        let command = self
            .aliases
            .as_ref()
            .and_then(|a| a.translate(line))
            .unwrap_or_else(|| line.to_string());
        debug!(input = line, command = %command, "handling message");

        let result = self.interpreter.interpret(&command).await;
        if !result.message.is_empty() {
            transport.send(&result.message).await?;
        }

        if result.success
            && let Some(aliases) = &self.aliases
        {
            let parsed = ParsedInput::parse(&command);
            let mut replies = aliases.replies_for(&parsed.segments.join("."));
            if replies.is_empty() {
                replies = aliases.replies_for(parsed.name());
            }
            for reply in replies {
                transport.send(&reply).await?;
            }
        }
        Ok(())
    }
}

/// Decode the longest complete prefix of `bytes`, leaving an unfinished
/// trailing sequence in place. Invalid sequences become U+FFFD.
fn take_utf8(bytes: &mut Vec<u8>) -> String {
    let mut text = String::new();
    loop {
        match std::str::from_utf8(bytes) {
            Ok(valid) => {
                text.push_str(valid);
                bytes.clear();
                return text;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                // `valid_up_to` bytes are known good.
                text.push_str(&String::from_utf8_lossy(&bytes[..valid]));
                match e.error_len() {
                    Some(bad) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        bytes.drain(..valid + bad);
                    }
                    None => {
                        bytes.drain(..valid);
                        return text;
                    }
                }
            }
        }
    }
}
