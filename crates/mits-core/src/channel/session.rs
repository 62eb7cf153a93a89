//! Prompt-synchronised command execution over an unframed shell channel.
//!
//! The transport offers no message framing, so the end of every response is
//! recognised by the interpreter's prompt reappearing at the end of the
//! received bytes. Right after connecting, the session replaces whatever
//! prompt the shell uses with a fixed sentinel so prompt text can no longer
//! be confused with command output.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::transport::{Transport, TransportError};
use crate::metrics::METRICS;
use crate::obs;

/// Prompt suffixes that mark a native shell prompt (unprivileged / root).
const NATIVE_PROMPT_SUFFIXES: [&str; 2] = ["$ ", "# "];

/// Default sentinel prompt.
pub const DEFAULT_SENTINEL: &str = "[MITS]$ ";

/// Protocol step in which a session failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Connect,
    PromptDetect,
    Command,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Connect => write!(f, "connect"),
            Phase::PromptDetect => write!(f, "prompt-detect"),
            Phase::Command => write!(f, "command"),
        }
    }
}

/// Errors raised by a [`ChannelSession`].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("{phase} failed: {source}")]
    Connection {
        phase: Phase,
        #[source]
        source: TransportError,
    },

    #[error("{phase} timed out after {elapsed_ms} ms waiting for {expected:?}")]
    Timeout {
        phase: Phase,
        expected: String,
        elapsed_ms: u64,
    },

    #[error("session is closed")]
    Closed,

    #[error("unexpected response to `{command}`: {output:?}")]
    UnexpectedResponse { command: String, output: String },

    #[error("command contains a line break: {command:?}")]
    MultiLineCommand { command: String },
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    PromptDetected,
    Ready,
    Closed,
}

/// Protocol tuning shared by every session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Prompt forced onto the interpreter after connecting.
    pub sentinel: String,
    /// Bound on native prompt detection and sentinel confirmation.
    pub prompt_timeout_ms: u64,
    /// Bound on a single command's response.
    pub command_timeout_ms: u64,
    /// Longest single wait on the transport.
    pub poll_interval_ms: u64,
    /// Largest read requested from the transport.
    pub chunk_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sentinel: DEFAULT_SENTINEL.to_string(),
            prompt_timeout_ms: 10_000,
            command_timeout_ms: 60_000,
            poll_interval_ms: 50,
            chunk_size: 4096,
        }
    }
}

impl SessionConfig {
    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_millis(self.prompt_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// One interactive interpreter reached through a [`Transport`].
///
/// `execute` takes `&mut self`, so a session can never have two commands in
/// flight; share one between threads through [`SharedSession`].
///
/// [`SharedSession`]: super::SharedSession
pub struct ChannelSession {
    transport: Box<dyn Transport>,
    config: SessionConfig,
    native_prompt: String,
    prompt: String,
    state: SessionState,
}

impl fmt::Debug for ChannelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSession")
            .field("native_prompt", &self.native_prompt)
            .field("prompt", &self.prompt)
            .field("state", &self.state)
            .finish()
    }
}

impl ChannelSession {
    /// Detect the interpreter's prompt and replace it with the sentinel.
    pub fn connect<T: Transport + 'static>(transport: T, config: SessionConfig) -> SessionResult<Self> {
        let mut session = Self {
            transport: Box::new(transport),
            config,
            native_prompt: String::new(),
            prompt: String::new(),
            state: SessionState::Connecting,
        };

        let timeout = session.config.prompt_timeout();
        let banner = session.read_until(Phase::PromptDetect, "native prompt", timeout, |buf| {
            NATIVE_PROMPT_SUFFIXES
                .iter()
                .any(|suffix| buf.ends_with(suffix.as_bytes()))
        })?;
        let banner = String::from_utf8_lossy(&banner);
        let native = banner.rsplit('\n').next().unwrap_or_default();
        session.native_prompt = native.trim_start_matches('\r').to_string();
        session.prompt = session.native_prompt.clone();
        session.state = SessionState::PromptDetected;
        tracing::debug!(native_prompt = %session.native_prompt, "native prompt detected");

        let sentinel = session.config.sentinel.clone();
        session.set_prompt(&sentinel)?;
        obs::emit_session_ready(&session.native_prompt, &session.prompt);
        Ok(session)
    }

    /// Open a transport with `open` and connect over it. Failing to open is a
    /// connect-phase error.
    pub fn open<T, F>(open: F, config: SessionConfig) -> SessionResult<Self>
    where
        T: Transport + 'static,
        F: FnOnce() -> Result<T, TransportError>,
    {
        let transport = open().map_err(|source| SessionError::Connection {
            phase: Phase::Connect,
            source,
        })?;
        Self::connect(transport, config)
    }

    /// Redefine the interpreter's prompt and wait until it is in effect.
    ///
    /// The prompt is written as two adjacent quoted halves so the echoed
    /// assignment never contains the prompt itself.
    pub fn set_prompt(&mut self, prompt: &str) -> SessionResult<()> {
        self.ensure_open()?;
        let command = prompt_assignment(prompt);
        self.send_line(&command)?;

        let timeout = self.config.prompt_timeout();
        let expected = prompt.as_bytes().to_vec();
        let cmd = command.as_bytes().to_vec();
        self.read_until(Phase::PromptDetect, prompt, timeout, |buf| {
            is_complete(buf, &cmd, &expected)
        })?;

        self.prompt = prompt.to_string();
        self.state = SessionState::Ready;
        Ok(())
    }

    /// Run `command` and return exactly the output it produced.
    pub fn execute(&mut self, command: &str) -> SessionResult<String> {
        self.execute_streaming(command, |_| {})
    }

    /// Run `command`, forwarding output to `observer` as it arrives.
    ///
    /// The echoed command line and the trailing prompt are never forwarded,
    /// even when they arrive split across reads. The full output is returned
    /// as well.
    pub fn execute_streaming<F>(&mut self, command: &str, mut observer: F) -> SessionResult<String>
    where
        F: FnMut(&[u8]),
    {
        // A second line would be a second command racing the first prompt.
        if command.contains(|c: char| c == '\n' || c == '\r') {
            return Err(SessionError::MultiLineCommand {
                command: command.to_string(),
            });
        }
        self.ensure_ready()?;
        let started = Instant::now();
        self.send_line(command)?;

        let cmd = command.as_bytes().to_vec();
        let prompt = self.prompt.as_bytes().to_vec();
        let timeout = self.config.command_timeout();
        let mut forwarded = 0usize;
        let mut skip: Option<usize> = None;

        let expected = self.prompt.clone();
        let buf = self.read_until(Phase::Command, &expected, timeout, |buf| {
            let complete = is_complete(buf, &cmd, &prompt);

            if skip.is_none() && (complete || buf.len() >= cmd.len() + 2) {
                skip = Some(echo_len(buf, &cmd));
            }
            if let Some(skip) = skip {
                let end = if complete {
                    buf.len() - prompt.len()
                } else {
                    buf.len() - partial_suffix_len(buf, &prompt)
                };
                let start = forwarded.max(skip);
                if end > start {
                    observer(&buf[start..end]);
                    forwarded = end;
                }
            }
            complete
        })?;

        let output = strip_response(&buf, &cmd, &prompt);
        METRICS.inc_commands_executed();
        obs::emit_command_executed(command, output.len(), started.elapsed().as_millis() as u64);
        Ok(output)
    }

    /// Whether passwordless `sudo` is available to the session user.
    pub fn is_sudo_active(&mut self) -> SessionResult<bool> {
        self.probe(r#"sudo -n true 2>/dev/null && echo "True" || echo "False""#)
    }

    /// Whether `path` is an existing directory on the remote side.
    pub fn path_exists(&mut self, path: &str) -> SessionResult<bool> {
        let command = format!("[ -d {} ] && echo True || echo False", quote(path));
        self.probe(&command)
    }

    /// Whether `path` is an existing regular file on the remote side.
    pub fn file_exists(&mut self, path: &str) -> SessionResult<bool> {
        let command = format!("[ -f {} ] && echo True || echo False", quote(path));
        self.probe(&command)
    }

    /// MD5 digest of a remote file, as printed by `md5sum`.
    pub fn remote_md5(&mut self, path: &str) -> SessionResult<String> {
        let command = format!("md5sum {}", quote(path));
        let output = self.execute(&command)?;
        let digest = output.split_whitespace().next().unwrap_or_default();
        if digest.len() == 32 && digest.chars().all(|c| c.is_ascii_hexdigit()) {
            Ok(digest.to_string())
        } else {
            Err(SessionError::UnexpectedResponse { command, output })
        }
    }

    fn probe(&mut self, command: &str) -> SessionResult<bool> {
        let output = self.execute(command)?;
        match output.trim() {
            "True" => Ok(true),
            "False" => Ok(false),
            _ => Err(SessionError::UnexpectedResponse {
                command: command.to_string(),
                output,
            }),
        }
    }

    /// Close the transport. Consumes the session so no response can be observed afterwards.
    pub fn close(mut self) -> SessionResult<()> {
        self.shutdown()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Prompt the interpreter printed before the sentinel was installed.
    pub fn native_prompt(&self) -> &str {
        &self.native_prompt
    }

    /// Prompt currently recognised as the end of a response.
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn shutdown(&mut self) -> SessionResult<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.state = SessionState::Closed;
        self.transport
            .close()
            .map_err(|source| SessionError::Connection {
                phase: Phase::Command,
                source,
            })
    }

    fn ensure_open(&self) -> SessionResult<()> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        Ok(())
    }

    fn ensure_ready(&self) -> SessionResult<()> {
        match self.state {
            SessionState::Ready => Ok(()),
            _ => Err(SessionError::Closed),
        }
    }

    fn send_line(&mut self, line: &str) -> SessionResult<()> {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        let phase = self.active_phase();
        if let Err(source) = self.transport.send(&data) {
            self.state = SessionState::Closed;
            return Err(SessionError::Connection { phase, source });
        }
        Ok(())
    }

    fn active_phase(&self) -> Phase {
        match self.state {
            SessionState::Ready => Phase::Command,
            _ => Phase::PromptDetect,
        }
    }

    /// Accumulate received bytes until `done` accepts the buffer.
    ///
    /// `done` is consulted before the first wait, so a transport that has
    /// nothing to say does not hold up an already-complete buffer. Reads that
    /// return no bytes are tolerated.
    fn read_until<F>(
        &mut self,
        phase: Phase,
        expected: &str,
        timeout: Duration,
        mut done: F,
    ) -> SessionResult<Vec<u8>>
    where
        F: FnMut(&[u8]) -> bool,
    {
        let started = Instant::now();
        let deadline = started + timeout;
        let poll = self.config.poll_interval();
        let chunk_size = self.config.chunk_size.max(1);
        let mut buf = Vec::new();

        loop {
            if done(&buf) {
                return Ok(buf);
            }

            let now = Instant::now();
            if now >= deadline {
                self.state = SessionState::Closed;
                tracing::warn!(phase = %phase, expected = %expected, received = buf.len(), "session timed out");
                return Err(SessionError::Timeout {
                    phase,
                    expected: expected.to_string(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
            }

            let received = self
                .transport
                .wait_ready(poll.min(deadline - now))
                .and_then(|ready| {
                    if ready {
                        self.transport.recv(chunk_size)
                    } else {
                        Ok(Vec::new())
                    }
                });

            match received {
                Ok(chunk) => buf.extend_from_slice(&chunk),
                Err(source) => {
                    self.state = SessionState::Closed;
                    return Err(SessionError::Connection { phase, source });
                }
            }
        }
    }
}

impl Drop for ChannelSession {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// `PS1='<left>''<right>'` for the given prompt.
fn prompt_assignment(prompt: &str) -> String {
    let mid = prompt
        .char_indices()
        .map(|(i, _)| i)
        .nth(prompt.chars().count() / 2)
        .unwrap_or(0);
    let (left, right) = prompt.split_at(mid);
    format!("PS1={}{}", quote(left), quote(right))
}

/// Single-quote `s` for a POSIX shell.
fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// The buffer ends with `prompt`, and that prompt is not part of the echoed command.
fn is_complete(buf: &[u8], command: &[u8], prompt: &[u8]) -> bool {
    if !buf.ends_with(prompt) {
        return false;
    }
    let prompt_start = buf.len() - prompt.len();
    if buf.starts_with(command) {
        prompt_start >= command.len()
    } else {
        !command.starts_with(buf)
    }
}

/// Length of the echoed command line at the start of `buf`, or 0 if the
/// interpreter did not echo it.
fn echo_len(buf: &[u8], command: &[u8]) -> usize {
    if !buf.starts_with(command) {
        return 0;
    }
    let rest = &buf[command.len()..];
    if rest.starts_with(b"\r\n") {
        command.len() + 2
    } else if rest.starts_with(b"\n") {
        command.len() + 1
    } else {
        command.len()
    }
}

/// Longest proper suffix of `buf` that could be the start of `prompt`.
fn partial_suffix_len(buf: &[u8], prompt: &[u8]) -> usize {
    let max = prompt.len().saturating_sub(1).min(buf.len());
    (1..=max)
        .rev()
        .find(|&n| prompt.starts_with(&buf[buf.len() - n..]))
        .unwrap_or(0)
}

fn strip_response(buf: &[u8], command: &[u8], prompt: &[u8]) -> String {
    let end = buf.len().saturating_sub(prompt.len());
    let start = echo_len(buf, command).min(end);
    String::from_utf8_lossy(&buf[start..end]).into_owned()
}
