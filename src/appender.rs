//! Message framing: re-assembles arbitrarily chunked text into messages.
//!
//! Two framing modes, usable together:
//!
//! - **Terminator**: any run of terminator characters ends a message. Every
//!   completed chunk is emitted as soon as it arrives, terminators included;
//!   an unterminated tail stays buffered.
//! - **Pattern**: the buffer is complete the moment it matches a regex. The
//!   first capture group (or the whole match) is emitted and the buffer reset.
//!
//! [`DataAppender`] adds two timers on top of [`FrameBuffer`]. The master timer
//! runs from the first fragment regardless of traffic; the data timer restarts
//! with every fragment. Whichever fires first flushes the buffer, so a peer
//! that goes quiet mid-message never wedges the stream. After
//! [`DataAppender::start`] exactly one message is always emitted, empty if the
//! peer never answered.

use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use regex::Regex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::FramerConfig;

/// Synchronous framing state. Buffers partial data across calls.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    partial: String,
    terminators: Vec<char>,
    pattern: Option<Regex>,
}

impl FrameBuffer {
    pub fn new(config: &FramerConfig) -> Result<Self, regex::Error> {
        Ok(Self {
            partial: String::new(),
            terminators: config.terminator.chars().collect(),
            pattern: config.compiled_pattern()?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.partial.is_empty()
    }

    /// Buffered, not yet emitted text.
    pub fn pending(&self) -> &str {
        &self.partial
    }

    pub fn clear(&mut self) {
        self.partial.clear();
    }

    /// Append a fragment and return any messages it completed.
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        self.partial.push_str(fragment);

        if let Some(pattern) = &self.pattern
            && let Some(message) = first_match(pattern, &self.partial)
        {
            self.partial.clear();
            return vec![message];
        }

        if self.terminators.is_empty() {
            return Vec::new();
        }

        let mut messages = Vec::new();
        let mut start = 0;
        let mut chars = self.partial.char_indices().peekable();
        while let Some((_, c)) = chars.next() {
            if !self.terminators.contains(&c) {
                continue;
            }
            // A chunk ends after the last terminator of a run, or at the end
            // of the buffer.
            let end = match chars.peek() {
                Some(&(next_idx, next)) if !self.terminators.contains(&next) => next_idx,
                Some(_) => continue,
                None => self.partial.len(),
            };
            let chunk = &self.partial[start..end];
            if chunk.chars().any(|ch| !self.terminators.contains(&ch)) {
                messages.push(chunk.to_string());
            }
            start = end;
        }
        self.partial.drain(..start);
        messages
    }

    /// Empty the buffer, returning what it held as a best-effort message.
    ///
    /// With a pattern, the last match in the buffer is returned; without a
    /// match the raw partial text is returned instead.
    pub fn flush(&mut self) -> Option<String> {
        let partial = std::mem::take(&mut self.partial);
        if let Some(pattern) = &self.pattern {
            if let Some(message) = last_match(pattern, &partial) {
                return Some(message);
            }
            if !partial.is_empty() {
                warn!(
                    pattern = pattern.as_str(),
                    partial = %partial,
                    "framing timeout: no pattern match"
                );
            }
        }
        (!partial.is_empty()).then_some(partial)
    }
}

fn first_match(pattern: &Regex, text: &str) -> Option<String> {
    pattern.captures(text).map(|caps| capture_text(&caps))
}

fn last_match(pattern: &Regex, text: &str) -> Option<String> {
    pattern.captures_iter(text).last().map(|caps| capture_text(&caps))
}

fn capture_text(caps: &regex::Captures<'_>) -> String {
    caps.get(1)
        .or_else(|| caps.get(0))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Timed appender
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Master,
    Data,
}

struct Timer {
    token: u64,
    handle: JoinHandle<()>,
}

struct State {
    buffer: FrameBuffer,
    master: Option<Timer>,
    data: Option<Timer>,
    next_token: u64,
    /// A request started with `start` has not been answered yet.
    awaiting: bool,
}

impl State {
    fn slot(&mut self, kind: TimerKind) -> &mut Option<Timer> {
        match kind {
            TimerKind::Master => &mut self.master,
            TimerKind::Data => &mut self.data,
        }
    }

    fn cancel_timers(&mut self) {
        for timer in [self.master.take(), self.data.take()].into_iter().flatten() {
            timer.handle.abort();
        }
    }

    /// Flush the buffer. An unanswered request yields an empty message.
    fn drain(&mut self) -> Option<String> {
        let message = self.buffer.flush();
        let awaiting = std::mem::take(&mut self.awaiting);
        if message.is_none() && awaiting {
            warn!("framing timeout: no response received");
            return Some(String::new());
        }
        message
    }
}

struct Shared {
    state: Mutex<State>,
    tx: UnboundedSender<String>,
    master_timeout: Duration,
    data_timeout: Duration,
}

impl Shared {
    fn emit(&self, message: String) {
        debug!(len = message.len(), "framed message");
        if self.tx.send(message).is_err() {
            debug!("framed message dropped: receiver closed");
        }
    }

    fn arm(self: &Arc<Self>, state: &mut State, kind: TimerKind) {
        if let Some(old) = state.slot(kind).take() {
            old.handle.abort();
        }
        let token = state.next_token;
        state.next_token += 1;
        let delay = match kind {
            TimerKind::Master => self.master_timeout,
            TimerKind::Data => self.data_timeout,
        };
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                shared.expire(kind, token);
            }
        });
        *state.slot(kind) = Some(Timer { token, handle });
    }

    fn expire(&self, kind: TimerKind, token: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        // A timer restarted after this one fired owns the slot now.
        if state.slot(kind).as_ref().map(|t| t.token) != Some(token) {
            return;
        }
        state.slot(kind).take();
        state.cancel_timers();
        debug!(timer = ?kind, "framer timeout");
        if let Some(message) = state.drain() {
            self.emit(message);
        }
    }
}

/// Timer-supervised framer. Completed messages arrive on the receiver
/// returned by [`new`](Self::new).
///
/// Must be used from within a tokio runtime; timers run as spawned tasks.
pub struct DataAppender {
    shared: Arc<Shared>,
}

impl DataAppender {
    pub fn new(config: &FramerConfig) -> Result<(Self, UnboundedReceiver<String>), regex::Error> {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                buffer: FrameBuffer::new(config)?,
                master: None,
                data: None,
                next_token: 0,
                awaiting: false,
            }),
            tx,
            master_timeout: config.master_timeout(),
            data_timeout: config.data_timeout(),
        });
        Ok((Self { shared }, rx))
    }

    /// Feed a fragment. Completed messages are emitted immediately; a
    /// remaining partial keeps the timers running.
    pub fn append(&self, fragment: &str) {
        let mut state = self.lock();
        for message in state.buffer.push(fragment) {
            state.awaiting = false;
            self.shared.emit(message);
        }
        if state.buffer.is_empty() {
            if !state.awaiting {
                state.cancel_timers();
            }
            return;
        }
        if state.master.is_none() {
            self.shared.arm(&mut state, TimerKind::Master);
        }
        self.shared.arm(&mut state, TimerKind::Data);
    }

    /// Begin awaiting exactly one message: clear the buffer and start the
    /// master timer. If nothing arrives before it fires, an empty message is
    /// emitted.
    pub fn start(&self) {
        let mut state = self.lock();
        state.cancel_timers();
        state.buffer.clear();
        state.awaiting = true;
        self.shared.arm(&mut state, TimerKind::Master);
    }

    /// Cancel both timers and emit whatever the buffer holds.
    pub fn stop(&self) {
        let mut state = self.lock();
        state.cancel_timers();
        if let Some(message) = state.drain() {
            self.shared.emit(message);
        }
    }

    /// Buffered, not yet emitted text.
    pub fn pending(&self) -> String {
        self.lock().buffer.pending().to_string()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for DataAppender {
    fn drop(&mut self) {
        self.lock().cancel_timers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn lines() -> FrameBuffer {
        FrameBuffer::new(&FramerConfig::default()).unwrap()
    }

    #[test]
    fn two_messages_regardless_of_split() {
        let mut whole = lines();
        let mut out = whole.push("AB\n");
        out.extend(whole.push("CD\n"));
        assert_eq!(out, vec!["AB\n", "CD\n"]);

        let mut split = lines();
        let mut out = Vec::new();
        for fragment in ["A", "B\n", "C", "D\n"] {
            out.extend(split.push(fragment));
        }
        assert_eq!(out, vec!["AB\n", "CD\n"]);
        assert!(split.is_empty());
    }

    #[test]
    fn several_messages_in_one_fragment() {
        let mut buf = lines();
        assert_eq!(buf.push("one\ntwo\nthr"), vec!["one\n", "two\n"]);
        assert_eq!(buf.pending(), "thr");
        assert_eq!(buf.push("ee\n"), vec!["three\n"]);
    }

    #[test]
    fn terminator_runs_stay_with_their_message() {
        let mut buf = FrameBuffer::new(&FramerConfig::serial()).unwrap();
        assert_eq!(buf.push("Snap\r\nState\r\n"), vec!["Snap\r\n", "State\r\n"]);
        // A bare terminator run carries no message.
        assert!(buf.push("\r\n").is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn pattern_emits_capture_group() {
        let mut buf = FrameBuffer::new(&FramerConfig::with_pattern(r"OK (\d+)\r")).unwrap();
        assert!(buf.push("noise OK 4").is_empty());
        assert_eq!(buf.push("2\r trailing"), vec!["42"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn pattern_without_group_emits_whole_match() {
        let mut buf = FrameBuffer::new(&FramerConfig::with_pattern(r"<[^>]*>")).unwrap();
        assert_eq!(buf.push("xx<ack>yy"), vec!["<ack>"]);
    }

    #[test]
    fn flush_returns_partial() {
        let mut buf = lines();
        buf.push("half a mess");
        assert_eq!(buf.flush().as_deref(), Some("half a mess"));
        assert_eq!(buf.flush(), None);
    }

    #[test]
    fn flush_prefers_last_pattern_match() {
        let config = FramerConfig {
            terminator: String::new(),
            pattern: Some(r"V=(\d+);".into()),
            ..FramerConfig::default()
        };
        let mut buf = FrameBuffer::new(&config).unwrap();
        // Push as one fragment so the match path is bypassed until flush.
        buf.partial.push_str("V=1;V=2;V=");
        assert_eq!(buf.flush().as_deref(), Some("2"));

        buf.push("garbage");
        assert_eq!(buf.flush().as_deref(), Some("garbage"));
    }

    #[tokio::test(start_paused = true)]
    async fn data_timeout_flushes_after_silence() {
        let (appender, mut rx) = DataAppender::new(&FramerConfig::default()).unwrap();
        let begin = Instant::now();
        appender.append("no terminator");
        assert_eq!(rx.recv().await.as_deref(), Some("no terminator"));
        assert!(begin.elapsed() >= Duration::from_millis(500));
        assert!(appender.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn master_timeout_fires_under_steady_traffic() {
        let config = FramerConfig {
            master_timeout_ms: 2000,
            data_timeout_ms: 500,
            ..FramerConfig::default()
        };
        let (appender, mut rx) = DataAppender::new(&config).unwrap();
        for _ in 0..10 {
            appender.append("x");
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        assert_eq!(rx.try_recv().as_deref(), Ok("xxxxxxx"));
        assert!(rx.try_recv().is_err());
        assert_eq!(appender.pending(), "xxx");
    }

    #[tokio::test(start_paused = true)]
    async fn complete_messages_cancel_timers() {
        let (appender, mut rx) = DataAppender::new(&FramerConfig::default()).unwrap();
        appender.append("Snap\n");
        assert_eq!(rx.recv().await.as_deref(), Some("Snap\n"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn started_request_times_out_with_partial() {
        let (appender, mut rx) = DataAppender::new(&FramerConfig::with_pattern(r"OK\r")).unwrap();
        appender.start();
        appender.append("ERR");
        let begin = Instant::now();
        assert_eq!(rx.recv().await.as_deref(), Some("ERR"));
        assert!(begin.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn started_request_without_reply_emits_empty_message() {
        let (appender, mut rx) = DataAppender::new(&FramerConfig::default()).unwrap();
        appender.start();
        let begin = Instant::now();
        let message = tokio::time::timeout(Duration::from_secs(60), rx.recv()).await;
        assert_eq!(message.unwrap().as_deref(), Some(""));
        assert!(begin.elapsed() >= Duration::from_millis(5000));
        assert!(begin.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn bare_terminators_keep_request_timer_running() {
        let (appender, mut rx) = DataAppender::new(&FramerConfig::default()).unwrap();
        appender.start();
        appender.append("\n");
        assert_eq!(rx.recv().await.as_deref(), Some(""));
    }

    #[tokio::test(start_paused = true)]
    async fn answered_request_emits_once() {
        let (appender, mut rx) = DataAppender::new(&FramerConfig::default()).unwrap();
        appender.start();
        appender.append("OK\n");
        assert_eq!(rx.recv().await.as_deref(), Some("OK\n"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stop_after_start_answers_empty() {
        let (appender, mut rx) = DataAppender::new(&FramerConfig::default()).unwrap();
        appender.start();
        appender.stop();
        assert_eq!(rx.try_recv().as_deref(), Ok(""));
        // Outside request mode an empty buffer emits nothing.
        appender.stop();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stop_emits_buffer_immediately() {
        let (appender, mut rx) = DataAppender::new(&FramerConfig::default()).unwrap();
        appender.append("partial");
        appender.stop();
        assert_eq!(rx.try_recv().as_deref(), Ok("partial"));
    }
}
