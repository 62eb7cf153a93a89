//! In-memory fakes for transports, log sources and executors (testing only)
//!
//! Provides `ScriptedShell`, `MemoryLog`, and `RecordingExecutor` that satisfy
//! the trait contracts without spawning processes.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::channel::{Transport, TransportError, TransportResult};
use crate::evidence::LogSource;
use crate::executor::{CommandExecutor, ExecError, ExecResult};

// ---------------------------------------------------------------------------
// ScriptedShell
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ShellState {
    prompt: String,
    line_ending: String,
    echo: bool,
    silent: bool,
    chunk_size: usize,
    delay: Duration,
    responses: HashMap<String, String>,
    fail_on: Option<String>,
    input: Vec<u8>,
    pending: VecDeque<u8>,
    ready_at: Instant,
    sent: Vec<String>,
    broken: bool,
    closed: bool,
}

/// Transport emulating an echoing interactive shell.
///
/// Every line sent is echoed back followed by the scripted response and the
/// current prompt. `PS1=...` assignments change the prompt. Clones share
/// state, so a test can keep a handle after moving the transport into a
/// session.
#[derive(Debug, Clone)]
pub struct ScriptedShell {
    state: Arc<Mutex<ShellState>>,
}

impl Default for ScriptedShell {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedShell {
    /// Shell with a `$ ` prompt, `\r\n` line endings and no banner.
    pub fn new() -> Self {
        let state = ShellState {
            prompt: "$ ".to_string(),
            line_ending: "\r\n".to_string(),
            echo: true,
            silent: false,
            chunk_size: usize::MAX,
            delay: Duration::ZERO,
            responses: HashMap::new(),
            fail_on: None,
            input: Vec::new(),
            pending: VecDeque::from(b"$ ".to_vec()),
            ready_at: Instant::now(),
            sent: Vec::new(),
            broken: false,
            closed: false,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn update(self, f: impl FnOnce(&mut ShellState)) -> Self {
        f(&mut self.state.lock().unwrap());
        self
    }

    /// Print `banner` before the initial prompt, which becomes `prompt`.
    pub fn with_greeting(self, banner: &str, prompt: &str) -> Self {
        self.update(|s| {
            s.prompt = prompt.to_string();
            s.pending = format!("{banner}{prompt}").into_bytes().into();
        })
    }

    /// Output produced by `command` (without the trailing prompt).
    pub fn respond(self, command: &str, output: &str) -> Self {
        self.update(|s| {
            s.responses.insert(command.to_string(), output.to_string());
        })
    }

    /// Line terminator used for echoes (default `\r\n`).
    pub fn with_line_ending(self, ending: &str) -> Self {
        self.update(|s| s.line_ending = ending.to_string())
    }

    /// Deliver at most `n` bytes per `recv`.
    pub fn with_chunk_size(self, n: usize) -> Self {
        self.update(|s| s.chunk_size = n.max(1))
    }

    /// Hold every response back for `delay` after the command is sent.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.update(|s| s.delay = delay)
    }

    /// Do not echo input lines.
    pub fn without_echo(self) -> Self {
        self.update(|s| s.echo = false)
    }

    /// Swallow all input and never answer.
    pub fn silent(self) -> Self {
        self.update(|s| s.silent = true)
    }

    /// Break the connection once `command` is sent.
    pub fn fail_on(self, command: &str) -> Self {
        self.update(|s| s.fail_on = Some(command.to_string()))
    }

    /// Lines received so far, in order.
    pub fn sent(&self) -> Vec<String> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn prompt(&self) -> String {
        self.state.lock().unwrap().prompt.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

impl ShellState {
    fn handle_line(&mut self, line: String) {
        self.sent.push(line.clone());
        if self.silent {
            return;
        }
        if self.fail_on.as_deref() == Some(line.as_str()) {
            self.broken = true;
            return;
        }

        let mut out = String::new();
        if self.echo {
            out.push_str(&line);
            out.push_str(&self.line_ending);
        }
        if let Some(value) = line.strip_prefix("PS1=") {
            if let Some(words) = shlex::split(value) {
                self.prompt = words.concat();
            }
        } else if let Some(response) = self.responses.get(&line) {
            out.push_str(response);
        }
        out.push_str(&self.prompt);

        self.pending.extend(out.into_bytes());
        self.ready_at = Instant::now() + self.delay;
    }

    fn check_open(&self) -> TransportResult<()> {
        if self.closed || self.broken {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

impl Transport for ScriptedShell {
    fn send(&mut self, data: &[u8]) -> TransportResult<()> {
        let mut state = self.state.lock().unwrap();
        state.check_open()?;
        state.input.extend_from_slice(data);
        while let Some(pos) = state.input.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = state.input.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            state.handle_line(line);
        }
        Ok(())
    }

    fn recv_ready(&mut self) -> TransportResult<bool> {
        let state = self.state.lock().unwrap();
        state.check_open()?;
        Ok(!state.pending.is_empty() && Instant::now() >= state.ready_at)
    }

    fn recv(&mut self, max: usize) -> TransportResult<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        state.check_open()?;
        if Instant::now() < state.ready_at {
            return Ok(Vec::new());
        }
        let n = max.min(state.chunk_size).min(state.pending.len());
        Ok(state.pending.drain(..n).collect())
    }

    fn close(&mut self) -> TransportResult<()> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryLog
// ---------------------------------------------------------------------------

/// Log source backed by an in-memory string.
#[derive(Debug, Default)]
pub struct MemoryLog {
    buffer: Mutex<String>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append text to the log.
    pub fn push(&self, text: &str) {
        self.buffer.lock().unwrap().push_str(text);
    }
}

#[async_trait]
impl LogSource for MemoryLog {
    async fn drain(&self) -> ExecResult<String> {
        Ok(std::mem::take(&mut *self.buffer.lock().unwrap()))
    }
}

// ---------------------------------------------------------------------------
// RecordingExecutor
// ---------------------------------------------------------------------------

/// Executor that records commands and returns scripted output.
///
/// A command can also append a line to a [`MemoryLog`], which stands in for
/// the kernel or daemon reacting to it.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    responses: HashMap<String, String>,
    effects: Vec<(String, Arc<MemoryLog>, String)>,
    failing: Vec<String>,
    delay: Duration,
    commands: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output returned for `command` (default: empty).
    pub fn respond(mut self, command: &str, output: &str) -> Self {
        self.responses.insert(command.to_string(), output.to_string());
        self
    }

    /// Append `line` to `log` whenever `command` runs.
    pub fn logs(mut self, command: &str, log: Arc<MemoryLog>, line: &str) -> Self {
        self.effects
            .push((command.to_string(), log, line.to_string()));
        self
    }

    /// Fail with a timeout whenever `command` runs.
    pub fn fail_on(mut self, command: &str) -> Self {
        self.failing.push(command.to_string());
        self
    }

    /// Sleep this long inside every execution.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Commands executed so far, in completion order.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Largest number of executions observed running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandExecutor for RecordingExecutor {
    async fn execute(&self, command: &str) -> ExecResult<String> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        for (cmd, log, line) in &self.effects {
            if cmd == command {
                log.push(line);
            }
        }
        self.commands.lock().unwrap().push(command.to_string());

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.failing.iter().any(|c| c == command) {
            return Err(ExecError::Timeout {
                command: command.to_string(),
                limit_ms: self.delay.as_millis() as u64,
            });
        }
        Ok(self.responses.get(command).cloned().unwrap_or_default())
    }
}
