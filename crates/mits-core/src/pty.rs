//! Pseudo-terminal process management.
//!
//! Interactive programs (shells, the authorization daemon, an `ssh` client)
//! are run with a pseudo-terminal as their controlling terminal so their
//! output is line-buffered and echoed exactly as a user would see it. The
//! master end is kept non-blocking; [`PtyProcess::poll_readable`] is used to
//! wait for data.

use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::pty::{openpty, Winsize};
use nix::sys::signal::{self, Signal};
use nix::sys::termios::Termios;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, Pid};

/// Terminal width handed to children; wide enough that shells never wrap echoed commands.
const TERMINAL_COLUMNS: u16 = 4096;

/// Upper bound on how long `write_all` keeps retrying a full pty buffer.
const WRITE_RETRY_LIMIT: Duration = Duration::from_secs(5);

/// How long a dropped process gets to exit after SIGTERM before SIGKILL.
const DROP_GRACE: Duration = Duration::from_millis(200);

/// A child process attached to a pseudo-terminal.
#[derive(Debug)]
pub struct PtyProcess {
    master: OwnedFd,
    child_pid: Pid,
    program: String,
}

impl PtyProcess {
    /// Spawn `program` with `args` under a new pseudo-terminal.
    ///
    /// The child becomes a session leader with the pty slave as its
    /// controlling terminal and as stdin, stdout and stderr. `TERM` is set to
    /// `dumb` so shells do not decorate their output with control sequences.
    pub fn spawn(program: &str, args: &[String]) -> io::Result<Self> {
        let winsize = Winsize {
            ws_row: 24,
            ws_col: TERMINAL_COLUMNS,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let pty = openpty(Some(&winsize), None::<&Termios>).map_err(io::Error::from)?;

        let stdout = pty.slave.try_clone()?;
        let stderr = pty.slave.try_clone()?;

        let mut command = Command::new(program);
        command
            .args(args)
            .env("TERM", "dumb")
            .stdin(Stdio::from(pty.slave))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        // Safety: the hook only issues async-signal-safe syscalls between fork and exec.
        unsafe {
            command.pre_exec(|| {
                unistd::setsid().map_err(io::Error::from)?;
                if libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY as _, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn()?;
        // Dropping the command closes the parent's copies of the slave, so the
        // master sees EIO once the child exits.
        drop(command);

        let flags = fcntl(pty.master.as_raw_fd(), FcntlArg::F_GETFL).map_err(io::Error::from)?;
        let flags = OFlag::from_bits_truncate(flags);
        fcntl(
            pty.master.as_raw_fd(),
            FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK),
        )
        .map_err(io::Error::from)?;

        let child_pid = Pid::from_raw(child.id() as i32);
        tracing::debug!(program = %program, pid = child.id(), "spawned pty process");

        Ok(Self {
            master: pty.master,
            child_pid,
            program: program.to_string(),
        })
    }

    /// Non-blocking read from the master.
    ///
    /// `Ok(0)` means end of stream (the child closed the terminal).
    /// `ErrorKind::WouldBlock` means no data is available yet.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match unistd::read(self.master.as_raw_fd(), buf) {
            Ok(n) => Ok(n),
            Err(nix::errno::Errno::EAGAIN) => Err(io::ErrorKind::WouldBlock.into()),
            // EIO on the master means every slave descriptor is closed.
            Err(nix::errno::Errno::EIO) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Write all bytes to the child's terminal.
    pub fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut written = 0;
        let mut stalled_since: Option<Instant> = None;
        while written < data.len() {
            match unistd::write(&self.master, &data[written..]) {
                Ok(n) => {
                    written += n;
                    stalled_since = None;
                }
                Err(nix::errno::Errno::EAGAIN) => {
                    let since = *stalled_since.get_or_insert_with(Instant::now);
                    if since.elapsed() > WRITE_RETRY_LIMIT {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "pty write: buffer full",
                        ));
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Wait up to `timeout` for the master to become readable.
    ///
    /// A hang-up counts as readable: the next read reports end of stream.
    pub fn poll_readable(&self, timeout: Duration) -> io::Result<bool> {
        let mut fds = [PollFd::new(self.master.as_fd(), PollFlags::POLLIN)];
        let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        let timeout = PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX);

        match nix::poll::poll(&mut fds, timeout) {
            Ok(0) => Ok(false),
            Ok(_) => {
                let revents = fds[0].revents().unwrap_or(PollFlags::empty());
                Ok(revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP))
            }
            Err(nix::errno::Errno::EINTR) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the child is still running (does not reap it).
    pub fn is_alive(&self) -> bool {
        signal::kill(self.child_pid, None).is_ok()
    }

    /// Send SIGTERM to the child.
    pub fn terminate(&self) -> io::Result<()> {
        match signal::kill(self.child_pid, Signal::SIGTERM) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Block until the child exits; signal deaths are reported as `-signum`.
    pub fn wait(&self) -> io::Result<i32> {
        loop {
            match waitpid(self.child_pid, None) {
                Ok(WaitStatus::Exited(_, code)) => return Ok(code),
                Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(-(sig as i32)),
                Ok(_) => continue,
                Err(nix::errno::Errno::ECHILD) => return Ok(0),
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn pid(&self) -> u32 {
        u32::try_from(self.child_pid.as_raw()).unwrap_or(0)
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        let pid = self.child_pid;
        let reaped = || !matches!(waitpid(pid, Some(WaitPidFlag::WNOHANG)), Ok(WaitStatus::StillAlive));
        if reaped() {
            return;
        }

        let _ = signal::kill(pid, Signal::SIGTERM);
        let deadline = Instant::now() + DROP_GRACE;
        while Instant::now() < deadline {
            if reaped() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        tracing::debug!(pid = pid.as_raw(), program = %self.program, "child ignored SIGTERM, killing");
        let _ = signal::kill(pid, Signal::SIGKILL);
        let _ = waitpid(pid, None);
    }
}

/// Blocking [`Read`] view of a shared [`PtyProcess`].
///
/// Each `read` polls the master in short slices so the caller can be stopped
/// through `should_stop` between slices.
pub struct PtyReader<F: Fn() -> bool> {
    process: Arc<PtyProcess>,
    should_stop: F,
}

impl<F: Fn() -> bool> PtyReader<F> {
    pub fn new(process: Arc<PtyProcess>, should_stop: F) -> Self {
        Self {
            process,
            should_stop,
        }
    }
}

impl<F: Fn() -> bool> Read for PtyReader<F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if (self.should_stop)() {
                return Ok(0);
            }
            if !self.process.poll_readable(Duration::from_millis(100))? {
                continue;
            }
            match self.process.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                other => return other,
            }
        }
    }
}
