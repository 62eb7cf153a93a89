//! Command executors used by test suites.
//!
//! A [`CommandExecutor`] runs one shell command and returns what a user would
//! have seen on the terminal: standard output and standard error merged in
//! the order they were written.

use std::io;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::channel::{SessionError, SharedSession};

/// Errors raised while executing a command.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("empty command")]
    EmptyCommand,

    #[error("failed to execute `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("command `{command}` timed out after {limit_ms} ms")]
    Timeout { command: String, limit_ms: u64 },

    #[error("remote session error: {0}")]
    Session(#[from] SessionError),

    #[error("executor task failed: {0}")]
    Join(String),
}

pub type ExecResult<T> = std::result::Result<T, ExecError>;

/// Runs shell commands.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `command` and return its merged output.
    async fn execute(&self, command: &str) -> ExecResult<String>;
}

#[async_trait]
impl<T: CommandExecutor + ?Sized> CommandExecutor for Arc<T> {
    async fn execute(&self, command: &str) -> ExecResult<String> {
        (**self).execute(command).await
    }
}

/// Executes commands on this machine through `/bin/sh -c`.
#[derive(Debug, Clone)]
pub struct LocalShell {
    shell: PathBuf,
    cwd: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl Default for LocalShell {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("/bin/sh"),
            cwd: None,
            timeout: None,
        }
    }
}

impl LocalShell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill commands that run longer than `timeout` (builder pattern).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Use a different POSIX shell (builder pattern).
    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Run commands from `dir` instead of the current directory (builder pattern).
    pub fn with_cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    async fn run(&self, command: &str) -> ExecResult<String> {
        let spawn_err = |source: io::Error| ExecError::Spawn {
            command: command.to_string(),
            source,
        };

        // One pipe for both streams keeps stdout and stderr interleaved.
        let (read_end, write_end) = nix::unistd::pipe().map_err(|e| spawn_err(e.into()))?;
        let stderr_end: OwnedFd = write_end.try_clone().map_err(spawn_err)?;

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::from(write_end))
            .stderr(Stdio::from(stderr_end))
            .kill_on_drop(true);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(spawn_err)?;
        // Release the parent's write ends so the read side sees EOF.
        drop(cmd);

        let mut pipe = tokio::fs::File::from_std(std::fs::File::from(read_end));
        let mut raw = Vec::new();
        let (read, status) = tokio::join!(pipe.read_to_end(&mut raw), child.wait());
        read.map_err(spawn_err)?;
        let status = status.map_err(spawn_err)?;

        tracing::debug!(command = %command, status = ?status.code(), bytes = raw.len(), "local command finished");
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }
}

#[async_trait]
impl CommandExecutor for LocalShell {
    async fn execute(&self, command: &str) -> ExecResult<String> {
        if command.trim().is_empty() {
            return Err(ExecError::EmptyCommand);
        }

        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.run(command))
                .await
                .map_err(|_| ExecError::Timeout {
                    command: command.to_string(),
                    limit_ms: limit.as_millis() as u64,
                })?,
            None => self.run(command).await,
        }
    }
}

/// Executes commands through a prompt-synchronised session.
#[derive(Debug, Clone)]
pub struct RemoteShell {
    session: SharedSession,
}

impl RemoteShell {
    pub fn new(session: SharedSession) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &SharedSession {
        &self.session
    }
}

#[async_trait]
impl CommandExecutor for RemoteShell {
    async fn execute(&self, command: &str) -> ExecResult<String> {
        if command.trim().is_empty() {
            return Err(ExecError::EmptyCommand);
        }
        let session = self.session.clone();
        let command = command.to_string();
        let output = tokio::task::spawn_blocking(move || session.execute(&command))
            .await
            .map_err(|e| ExecError::Join(e.to_string()))??;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_execute_simple_command() {
        let output = LocalShell::new().execute("echo hello").await.unwrap();
        assert_eq!(output, "hello\n");
    }

    #[tokio::test]
    async fn test_stderr_is_merged_in_order() {
        let output = LocalShell::new()
            .execute("echo first; echo second >&2; echo third")
            .await
            .unwrap();
        assert_eq!(output, "first\nsecond\nthird\n");
    }

    #[tokio::test]
    async fn test_failing_command_still_returns_output() {
        let output = LocalShell::new()
            .execute("mkdir /proc/mits-cannot-exist")
            .await
            .unwrap();
        assert!(output.contains("mkdir"));
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let err = LocalShell::new().execute("  ").await.unwrap_err();
        assert!(matches!(err, ExecError::EmptyCommand));
    }

    #[tokio::test]
    async fn test_missing_shell_is_spawn_error() {
        let err = LocalShell::new()
            .with_shell("/nonexistent/sh")
            .execute("true")
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_with_cwd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let output = LocalShell::new()
            .with_cwd(dir.path())
            .execute("ls")
            .await
            .unwrap();
        assert_eq!(output, "marker.txt\n");
    }

    #[tokio::test]
    async fn test_timeout() {
        let err = LocalShell::new()
            .with_timeout(Duration::from_millis(100))
            .execute("exec sleep 5")
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout { limit_ms: 100, .. }));
    }
}
