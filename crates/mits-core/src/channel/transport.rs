//! Raw bidirectional byte channels underneath a [`ChannelSession`].
//!
//! [`ChannelSession`]: super::ChannelSession

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pty::PtyProcess;

/// Errors raised by a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("transport i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("transport closed by peer")]
    Closed,
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// An unframed, character-stream channel to an interactive interpreter.
pub trait Transport: Send {
    /// Write `data` to the interpreter's input.
    fn send(&mut self, data: &[u8]) -> TransportResult<()>;

    /// Whether `recv` would return data without waiting.
    fn recv_ready(&mut self) -> TransportResult<bool>;

    /// Receive at most `max` bytes that are already available (possibly none).
    fn recv(&mut self, max: usize) -> TransportResult<Vec<u8>>;

    /// Wait up to `timeout` for data to become available.
    fn wait_ready(&mut self, timeout: Duration) -> TransportResult<bool> {
        if self.recv_ready()? {
            return Ok(true);
        }
        std::thread::sleep(timeout.min(Duration::from_millis(5)));
        self.recv_ready()
    }

    /// Release the channel.
    fn close(&mut self) -> TransportResult<()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, data: &[u8]) -> TransportResult<()> {
        (**self).send(data)
    }

    fn recv_ready(&mut self) -> TransportResult<bool> {
        (**self).recv_ready()
    }

    fn recv(&mut self, max: usize) -> TransportResult<Vec<u8>> {
        (**self).recv(max)
    }

    fn wait_ready(&mut self, timeout: Duration) -> TransportResult<bool> {
        (**self).wait_ready(timeout)
    }

    fn close(&mut self) -> TransportResult<()> {
        (**self).close()
    }
}

/// Where to reach a remote shell over OpenSSH.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshTarget {
    pub user: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Private key passed with `-i`; agent/default keys are used when absent.
    #[serde(default)]
    pub identity: Option<PathBuf>,
}

fn default_ssh_port() -> u16 {
    22
}

impl SshTarget {
    pub fn new(user: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port,
            identity: None,
        }
    }

    /// Parse `user@host` (port supplied separately).
    pub fn parse(destination: &str, port: u16) -> Option<Self> {
        let (user, host) = destination.split_once('@')?;
        if user.is_empty() || host.is_empty() {
            return None;
        }
        Some(Self::new(user, host, port))
    }

    /// Arguments for the `ssh` client. `-tt` forces a remote terminal so the
    /// far end runs an interactive, echoing shell.
    pub fn ssh_args(&self) -> Vec<String> {
        let mut args = vec![
            "-tt".to_string(),
            "-p".to_string(),
            self.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];
        if let Some(identity) = &self.identity {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args.push(format!("{}@{}", self.user, self.host));
        args
    }
}

/// Transport backed by a program running under a pseudo-terminal.
#[derive(Debug)]
pub struct PtyTransport {
    process: PtyProcess,
    closed: bool,
}

impl PtyTransport {
    pub fn spawn(program: &str, args: &[String]) -> TransportResult<Self> {
        let process = PtyProcess::spawn(program, args).map_err(|source| TransportError::Spawn {
            program: program.to_string(),
            source,
        })?;
        Ok(Self {
            process,
            closed: false,
        })
    }

    /// Interactive `/bin/sh` on the local machine.
    pub fn local_shell() -> TransportResult<Self> {
        Self::spawn("/bin/sh", &["-i".to_string()])
    }

    /// Interactive login shell on a remote machine via the OpenSSH client.
    pub fn ssh(target: &SshTarget) -> TransportResult<Self> {
        tracing::debug!(user = %target.user, host = %target.host, port = target.port, "opening ssh transport");
        Self::spawn("ssh", &target.ssh_args())
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }
}

impl Transport for PtyTransport {
    fn send(&mut self, data: &[u8]) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.process.write_all(data)?;
        Ok(())
    }

    fn recv_ready(&mut self) -> TransportResult<bool> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        Ok(self.process.poll_readable(Duration::ZERO)?)
    }

    fn recv(&mut self, max: usize) -> TransportResult<Vec<u8>> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let mut buf = vec![0u8; max.max(1)];
        match self.process.read(&mut buf) {
            Ok(0) => {
                self.closed = true;
                Err(TransportError::Closed)
            }
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn wait_ready(&mut self, timeout: Duration) -> TransportResult<bool> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        Ok(self.process.poll_readable(timeout)?)
    }

    fn close(&mut self) -> TransportResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.process.terminate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ssh_target() {
        let target = SshTarget::parse("root@192.168.0.10", 2222).unwrap();
        assert_eq!(target.user, "root");
        assert_eq!(target.host, "192.168.0.10");
        assert_eq!(target.port, 2222);
        assert!(SshTarget::parse("no-user-here", 22).is_none());
        assert!(SshTarget::parse("@host", 22).is_none());
    }

    #[test]
    fn test_ssh_args_force_terminal() {
        let mut target = SshTarget::new("tester", "vm", 3022);
        target.identity = Some(PathBuf::from("/keys/id_ed25519"));
        let args = target.ssh_args();
        assert_eq!(args[0], "-tt");
        assert!(args.windows(2).any(|w| w[0] == "-p" && w[1] == "3022"));
        assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == "/keys/id_ed25519"));
        assert_eq!(args.last().map(String::as_str), Some("tester@vm"));
    }

    #[test]
    fn test_spawn_failure_is_reported() {
        let err = PtyTransport::spawn("/nonexistent/mits-shell", &[]).unwrap_err();
        assert!(matches!(err, TransportError::Spawn { .. }));
        assert!(err.to_string().contains("/nonexistent/mits-shell"));
    }

    #[test]
    fn test_recv_after_close_fails() {
        let mut transport = PtyTransport::spawn("/bin/cat", &[]).unwrap();
        transport.close().unwrap();
        assert!(matches!(transport.recv(16), Err(TransportError::Closed)));
        assert!(matches!(transport.send(b"x"), Err(TransportError::Closed)));
    }
}
