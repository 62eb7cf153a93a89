//! Captured evidence and the log sources it is drawn from.
//!
//! Every field of a [`Capture`] is a delta: the kernel log is read with a
//! clear-on-read command and the daemon log is drained from its reader, so
//! consecutive captures never overlap.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::executor::{CommandExecutor, ExecResult};
use crate::reader::AsyncProcessReader;

/// Observations of a single command's execution window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capture {
    /// Merged stdout/stderr of the command.
    pub output: String,
    /// Kernel-log lines produced during the window.
    pub kernel_log: String,
    /// Daemon output produced during the window.
    pub daemon_log: String,
}

/// Everything observed while running one test.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedEvidence {
    pub allowed: Capture,
    /// Capture of the restricted-path counterpart, when the test has one.
    pub denied: Option<Capture>,
}

impl CapturedEvidence {
    pub fn allowed(capture: Capture) -> Self {
        Self {
            allowed: capture,
            denied: None,
        }
    }

    /// Evidence from a concurrent batch: per-command outputs, batch-wide logs.
    pub fn with_shared_logs(output: String, denied_output: Option<String>, shared: &Capture) -> Self {
        let with_logs = |output: String| Capture {
            output,
            kernel_log: shared.kernel_log.clone(),
            daemon_log: shared.daemon_log.clone(),
        };
        Self {
            allowed: with_logs(output),
            denied: denied_output.map(with_logs),
        }
    }
}

/// A continuously growing log that can be read as deltas.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Text appended since the previous drain.
    async fn drain(&self) -> ExecResult<String>;
}

/// Kernel ring buffer read with a clear-on-read command such as `dmesg -c`.
pub struct KernelLog {
    executor: Arc<dyn CommandExecutor>,
    command: String,
}

impl KernelLog {
    pub fn new(executor: Arc<dyn CommandExecutor>, command: impl Into<String>) -> Self {
        Self {
            executor,
            command: command.into(),
        }
    }
}

#[async_trait]
impl LogSource for KernelLog {
    async fn drain(&self) -> ExecResult<String> {
        self.executor.execute(&self.command).await
    }
}

/// Output of the authorization daemon.
pub struct DaemonLog {
    reader: Arc<AsyncProcessReader>,
}

impl DaemonLog {
    pub fn new(reader: Arc<AsyncProcessReader>) -> Self {
        Self { reader }
    }
}

#[async_trait]
impl LogSource for DaemonLog {
    async fn drain(&self) -> ExecResult<String> {
        Ok(self.reader.read())
    }
}

/// Runs commands and pairs their output with the log deltas of the same window.
#[derive(Clone)]
pub struct EvidenceCollector {
    executor: Arc<dyn CommandExecutor>,
    kernel_log: Arc<dyn LogSource>,
    daemon_log: Arc<dyn LogSource>,
    settle: Duration,
}

impl EvidenceCollector {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        kernel_log: Arc<dyn LogSource>,
        daemon_log: Arc<dyn LogSource>,
    ) -> Self {
        Self {
            executor,
            kernel_log,
            daemon_log,
            settle: Duration::ZERO,
        }
    }

    /// Wait this long after a command before reading the logs (builder pattern).
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn executor(&self) -> &Arc<dyn CommandExecutor> {
        &self.executor
    }

    /// Run `command` and capture its output and log deltas.
    pub async fn capture(&self, command: &str) -> ExecResult<Capture> {
        let output = self.executor.execute(command).await?;
        let mut capture = self.capture_logs().await?;
        capture.output = output;
        Ok(capture)
    }

    /// Run a command and, if given, its denied counterpart, each in its own window.
    pub async fn collect(
        &self,
        command: &str,
        denied_command: Option<&str>,
    ) -> ExecResult<CapturedEvidence> {
        let allowed = self.capture(command).await?;
        let denied = match denied_command {
            Some(cmd) => Some(self.capture(cmd).await?),
            None => None,
        };
        Ok(CapturedEvidence { allowed, denied })
    }

    /// Log deltas since the previous capture, after the settle delay. `output` is empty.
    pub async fn capture_logs(&self) -> ExecResult<Capture> {
        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }
        let kernel_log = self.kernel_log.drain().await?;
        let daemon_log = self.daemon_log.drain().await?;
        Ok(Capture {
            output: String::new(),
            kernel_log,
            daemon_log,
        })
    }

    /// Drop whatever the logs accumulated so far, starting a fresh window.
    pub async fn reset(&self) -> ExecResult<()> {
        self.kernel_log.drain().await?;
        self.daemon_log.drain().await?;
        Ok(())
    }
}
