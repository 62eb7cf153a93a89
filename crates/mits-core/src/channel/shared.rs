//! Thread-safe handle to a single [`ChannelSession`].

use std::sync::{Arc, Mutex, MutexGuard};

use super::session::{ChannelSession, SessionError, SessionResult, SessionState};

/// Cloneable handle that serialises commands onto one session.
///
/// Every `execute` holds the session lock from send until the prompt returns,
/// so concurrent callers queue up instead of interleaving their output.
#[derive(Clone, Debug)]
pub struct SharedSession {
    inner: Arc<Mutex<Option<ChannelSession>>>,
}

impl SharedSession {
    pub fn new(session: ChannelSession) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(session))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<ChannelSession>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn execute(&self, command: &str) -> SessionResult<String> {
        let mut guard = self.lock();
        let session = guard.as_mut().ok_or(SessionError::Closed)?;
        session.execute(command)
    }

    pub fn execute_streaming<F>(&self, command: &str, observer: F) -> SessionResult<String>
    where
        F: FnMut(&[u8]),
    {
        let mut guard = self.lock();
        let session = guard.as_mut().ok_or(SessionError::Closed)?;
        session.execute_streaming(command, observer)
    }

    /// Run `f` with exclusive access to the session.
    pub fn with_session<R>(
        &self,
        f: impl FnOnce(&mut ChannelSession) -> SessionResult<R>,
    ) -> SessionResult<R> {
        let mut guard = self.lock();
        let session = guard.as_mut().ok_or(SessionError::Closed)?;
        f(session)
    }

    pub fn state(&self) -> SessionState {
        self.lock()
            .as_ref()
            .map(ChannelSession::state)
            .unwrap_or(SessionState::Closed)
    }

    /// Close the session for every clone of this handle.
    pub fn close(&self) -> SessionResult<()> {
        let session = self.lock().take();
        match session {
            Some(session) => session.close(),
            None => Ok(()),
        }
    }
}
