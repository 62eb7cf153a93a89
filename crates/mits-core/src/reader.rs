//! Background reader for long-lived interactive processes.
//!
//! [`AsyncProcessReader`] runs a program under a pseudo-terminal (so its
//! output is not block-buffered) and moves every line it prints onto an
//! unbounded queue from a dedicated thread. Callers poll [`read`], which
//! drains whatever is queued and never waits for new output.
//!
//! [`read`]: AsyncProcessReader::read

use std::io::{self, BufRead, BufReader, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::pty::{PtyProcess, PtyReader};

/// Errors produced by the process reader.
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("invalid command line: {0}")]
    InvalidCommandLine(String),

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to signal process: {0}")]
    Signal(#[source] io::Error),
}

pub type ReaderResult<T> = std::result::Result<T, ReaderError>;

/// Non-blocking view over the output of a spawned interactive process.
pub struct AsyncProcessReader {
    process: Option<Arc<PtyProcess>>,
    queue: Mutex<UnboundedReceiver<String>>,
    stop: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl AsyncProcessReader {
    /// Spawn `command_line` under a pseudo-terminal and start draining it.
    pub fn spawn(command_line: &str) -> ReaderResult<Self> {
        let argv = shlex::split(command_line)
            .ok_or_else(|| ReaderError::InvalidCommandLine(command_line.to_string()))?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ReaderError::InvalidCommandLine(command_line.to_string()))?;

        let process = PtyProcess::spawn(program, args).map_err(|source| ReaderError::Spawn {
            program: program.clone(),
            source,
        })?;
        let process = Arc::new(process);

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let source = PtyReader::new(process.clone(), move || stop_flag.load(Ordering::Relaxed));

        let mut reader = Self::start(source, stop);
        reader.process = Some(process);
        Ok(reader)
    }

    /// Drain an arbitrary byte stream line by line. Nothing is signalled on terminate.
    pub fn from_reader<R: Read + Send + 'static>(source: R) -> Self {
        Self::start(source, Arc::new(AtomicBool::new(false)))
    }

    fn start<R: Read + Send + 'static>(source: R, stop: Arc<AtomicBool>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let finished = Arc::new(AtomicBool::new(false));
        let done = finished.clone();

        let worker = std::thread::Builder::new()
            .name("mits-reader".to_string())
            .spawn(move || {
                pump_lines(BufReader::new(source), &tx);
                done.store(true, Ordering::Release);
            });

        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::error!(error = %e, "failed to start reader thread");
                finished.store(true, Ordering::Release);
                None
            }
        };

        Self {
            process: None,
            queue: Mutex::new(rx),
            stop,
            finished,
            worker,
        }
    }

    /// Everything produced since the previous call, concatenated. Never blocks on the process.
    pub fn read(&self) -> String {
        let mut out = String::new();
        let mut queue = match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while let Ok(chunk) = queue.try_recv() {
            out.push_str(&chunk);
        }
        out
    }

    /// Send SIGTERM to the process. Output still queued stays readable.
    pub fn terminate(&self) -> ReaderResult<()> {
        match &self.process {
            Some(process) => {
                tracing::debug!(pid = process.pid(), "terminating reader process");
                process.terminate().map_err(ReaderError::Signal)
            }
            None => Ok(()),
        }
    }

    /// Whether the background thread has seen end of stream.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Poll until the background thread finishes or `timeout` elapses.
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_finished() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        true
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.pid())
    }
}

impl Drop for AsyncProcessReader {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(process) = &self.process {
            if process.is_alive() {
                let _ = process.terminate();
            }
        }
        if self.is_finished() {
            if let Some(worker) = self.worker.take() {
                let _ = worker.join();
            }
        }
    }
}

fn pump_lines<R: BufRead>(mut source: R, tx: &UnboundedSender<String>) {
    let mut line = Vec::new();
    loop {
        line.clear();
        match source.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(String::from_utf8_lossy(&line).into_owned()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(error = %e, "reader stream failed");
                break;
            }
        }
    }
    tracing::trace!("reader reached end of stream");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_from_reader_drains_everything_once() {
        let reader = AsyncProcessReader::from_reader(Cursor::new(b"one\ntwo\nthree".to_vec()));
        assert!(reader.wait_finished(Duration::from_secs(5)));
        assert_eq!(reader.read(), "one\ntwo\nthree");
        assert_eq!(reader.read(), "");
    }

    #[test]
    fn test_read_on_empty_stream() {
        let reader = AsyncProcessReader::from_reader(io::empty());
        assert!(reader.wait_finished(Duration::from_secs(5)));
        assert_eq!(reader.read(), "");
    }

    #[test]
    fn test_invalid_command_line() {
        assert!(matches!(
            AsyncProcessReader::spawn("   "),
            Err(ReaderError::InvalidCommandLine(_))
        ));
        assert!(matches!(
            AsyncProcessReader::spawn("echo 'unterminated"),
            Err(ReaderError::InvalidCommandLine(_))
        ));
    }

    #[test]
    fn test_spawn_missing_program() {
        let err = AsyncProcessReader::spawn("/nonexistent/mits-daemon").err();
        assert!(matches!(err, Some(ReaderError::Spawn { .. })));
    }

    #[test]
    fn test_terminate_without_process_is_noop() {
        let reader = AsyncProcessReader::from_reader(io::empty());
        assert!(reader.terminate().is_ok());
        assert!(reader.pid().is_none());
    }
}
