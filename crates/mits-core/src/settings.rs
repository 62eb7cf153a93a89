//! Run configuration loaded from TOML.
//!
//! ```toml
//! [session]
//! sentinel = "[MITS]$ "
//! command_timeout_ms = 30000
//!
//! [daemon]
//! command = "sudo constable @{TESTING_PATH}/constable.conf"
//! settle_ms = 1000
//!
//! [kernel_log]
//! command = "sudo dmesg -c"
//!
//! [paths]
//! TESTING_PATH = "/tmp/mits"
//! ```
//!
//! Every field has a default, so an empty file (or no file) is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::SessionConfig;
use crate::template::AnnotationMap;
use crate::validator::DEFAULT_ERROR_MARKER;

/// Errors raised while loading settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

pub type SettingsResult<T> = std::result::Result<T, SettingsError>;

/// How the authorization daemon is started and judged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    /// Command line; annotations are expanded before it is run.
    pub command: String,
    /// Pause after starting the daemon before tests begin.
    pub startup_ms: u64,
    /// Pause after each command before logs are read.
    pub settle_ms: u64,
    /// Bound on waiting for the daemon to exit after SIGTERM.
    pub shutdown_ms: u64,
    /// Case-sensitive marker that fails a test when found in the daemon log.
    pub error_marker: String,
    /// Character device the daemon talks to the kernel through.
    pub device: String,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            command: "sudo constable @{TESTING_PATH}/constable.conf".to_string(),
            startup_ms: 1000,
            settle_ms: 1000,
            shutdown_ms: 5000,
            error_marker: DEFAULT_ERROR_MARKER.to_string(),
            device: "/dev/medusa".to_string(),
        }
    }
}

impl DaemonSettings {
    pub fn startup(&self) -> Duration {
        Duration::from_millis(self.startup_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn shutdown(&self) -> Duration {
        Duration::from_millis(self.shutdown_ms)
    }
}

/// How kernel-log deltas are captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelLogSettings {
    /// Clear-on-read command; each run returns only new lines.
    pub command: String,
}

impl Default for KernelLogSettings {
    fn default() -> Self {
        Self {
            command: "sudo dmesg -c".to_string(),
        }
    }
}

/// Complete MITS configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub session: SessionConfig,
    pub daemon: DaemonSettings,
    pub kernel_log: KernelLogSettings,
    /// Annotation values used when expanding policy and command templates.
    pub paths: AnnotationMap,
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> SettingsResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), "loaded settings");
        Ok(settings)
    }

    /// Load `path` when given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> SettingsResult<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml_str(text: &str) -> SettingsResult<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml_string(&self) -> SettingsResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_document_gives_defaults() {
        let settings = Settings::from_toml_str("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.session.sentinel, "[MITS]$ ");
        assert_eq!(settings.daemon.error_marker, "error");
        assert_eq!(settings.kernel_log.command, "sudo dmesg -c");
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let settings = Settings::from_toml_str(
            r#"
            [session]
            command_timeout_ms = 500

            [daemon]
            settle_ms = 0

            [paths]
            TESTING_PATH = "/srv/mits"
            "#,
        )
        .unwrap();
        assert_eq!(settings.session.command_timeout_ms, 500);
        assert_eq!(settings.session.prompt_timeout_ms, 10_000);
        assert_eq!(settings.daemon.settle(), Duration::ZERO);
        assert_eq!(settings.daemon.device, "/dev/medusa");
        assert_eq!(settings.paths.get("TESTING_PATH"), Some("/srv/mits"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[kernel_log]\ncommand = \"dmesg -c\"").unwrap();
        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.kernel_log.command, "dmesg -c");
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = Settings::load(Path::new("/nonexistent/mits.toml")).unwrap_err();
        assert!(matches!(err, SettingsError::Read { .. }));
        assert!(err.to_string().contains("/nonexistent/mits.toml"));
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let err = Settings::from_toml_str("[session\n").unwrap_err();
        assert!(matches!(err, SettingsError::Parse(_)));
    }

    #[test]
    fn test_toml_round_trip() {
        let mut settings = Settings::default();
        settings.paths.insert("TESTING_PATH", "/tmp/x");
        let text = settings.to_toml_string().unwrap();
        assert_eq!(Settings::from_toml_str(&text).unwrap(), settings);
    }
}
