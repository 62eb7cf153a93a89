//! Crate-level error taxonomy for MITS.

use crate::catalog::CatalogError;
use crate::channel::{Phase, SessionError};
use crate::executor::ExecError;
use crate::reader::ReaderError;
use crate::settings::SettingsError;
use crate::template::TemplateError;

/// Broad class of a failure, independent of the component that raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transport-level connect/auth failure, or a transport lost mid-command.
    Connection,
    /// Prompt or sentinel never observed within the bound.
    ProtocolTimeout,
    UnknownAnnotation,
    CyclicAnnotation,
    InvalidInput,
    /// A command or process could not be started.
    ExecutionFailure,
    Configuration,
    Io,
}

/// MITS errors.
#[derive(Debug, thiserror::Error)]
pub enum MitsError {
    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("daemon reader error: {0}")]
    Reader(#[from] ReaderError),

    #[error("execution error: {0}")]
    Exec(#[from] ExecError),

    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MitsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MitsError::Template(e) => match e {
                TemplateError::UnknownAnnotation { .. } => ErrorKind::UnknownAnnotation,
                TemplateError::CyclicAnnotation { .. } => ErrorKind::CyclicAnnotation,
                TemplateError::InvalidInput(_) | TemplateError::InvalidDelimiters(_) => {
                    ErrorKind::InvalidInput
                }
            },
            MitsError::Session(e) => session_kind(e),
            MitsError::Exec(ExecError::Session(e)) => session_kind(e),
            MitsError::Exec(ExecError::EmptyCommand) => ErrorKind::InvalidInput,
            MitsError::Exec(_) => ErrorKind::ExecutionFailure,
            MitsError::Reader(ReaderError::InvalidCommandLine(_)) => ErrorKind::InvalidInput,
            MitsError::Reader(_) => ErrorKind::ExecutionFailure,
            MitsError::Settings(_) | MitsError::Catalog(_) => ErrorKind::Configuration,
            MitsError::Serialization(_) | MitsError::Io(_) => ErrorKind::Io,
        }
    }

    /// Session phase the failure happened in, if it came from a session.
    pub fn phase(&self) -> Option<Phase> {
        let session = match self {
            MitsError::Session(e) | MitsError::Exec(ExecError::Session(e)) => e,
            _ => return None,
        };
        match session {
            SessionError::Connection { phase, .. } | SessionError::Timeout { phase, .. } => {
                Some(*phase)
            }
            SessionError::Closed
            | SessionError::UnexpectedResponse { .. }
            | SessionError::MultiLineCommand { .. } => Some(Phase::Command),
        }
    }
}

fn session_kind(e: &SessionError) -> ErrorKind {
    match e {
        SessionError::Timeout { .. } => ErrorKind::ProtocolTimeout,
        SessionError::Connection { .. } | SessionError::Closed => ErrorKind::Connection,
        SessionError::UnexpectedResponse { .. } | SessionError::MultiLineCommand { .. } => {
            ErrorKind::InvalidInput
        }
    }
}

/// Result type for MITS operations.
pub type Result<T> = std::result::Result<T, MitsError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::TransportError;

    #[test]
    fn test_mits_error_display() {
        let err = MitsError::from(TemplateError::UnknownAnnotation {
            token: "@{X}".to_string(),
        });
        assert!(err.to_string().contains("unknown annotation"));
        assert!(err.to_string().contains("@{X}"));
        assert_eq!(err.kind(), ErrorKind::UnknownAnnotation);
    }

    #[test]
    fn test_timeout_kind_and_phase() {
        let err = MitsError::from(SessionError::Timeout {
            phase: Phase::PromptDetect,
            expected: "[MITS]$ ".to_string(),
            elapsed_ms: 10,
        });
        assert_eq!(err.kind(), ErrorKind::ProtocolTimeout);
        assert_eq!(err.phase(), Some(Phase::PromptDetect));
        assert!(err.to_string().contains("prompt-detect"));
    }

    #[test]
    fn test_connect_failure_names_phase() {
        let err = MitsError::from(SessionError::Connection {
            phase: Phase::Connect,
            source: TransportError::Closed,
        });
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert_eq!(err.phase(), Some(Phase::Connect));
        assert!(err.to_string().contains("connect failed"));
    }

    #[test]
    fn test_remote_exec_error_keeps_session_phase() {
        let err = MitsError::from(ExecError::Session(SessionError::Closed));
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert_eq!(err.phase(), Some(Phase::Command));
    }

    #[test]
    fn test_spawn_failure_is_execution_failure() {
        let err = MitsError::from(ExecError::Spawn {
            command: "x".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        });
        assert_eq!(err.kind(), ErrorKind::ExecutionFailure);
        assert_eq!(err.phase(), None);
    }
}
