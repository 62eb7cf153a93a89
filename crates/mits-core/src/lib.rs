//! MITS Core Library
//!
//! Drives allow/deny tests against a Linux authorization daemon: commands
//! run through prompt-synchronised shell sessions, policy templates are
//! expanded before the daemon starts, and every test is judged on its
//! command output, kernel log and daemon log.

pub mod catalog;
pub mod channel;
pub mod error;
pub mod evidence;
pub mod executor;
pub mod fakes;
pub mod metrics;
pub mod obs;
pub mod policy;
pub mod pty;
pub mod reader;
pub mod report;
pub mod run;
pub mod settings;
pub mod suite;
pub mod telemetry;
pub mod template;
pub mod validator;

pub use catalog::{CatalogError, TestCase, TestCatalog};
pub use channel::{
    ChannelSession, Phase, PtyTransport, SessionConfig, SessionError, SessionState,
    SharedSession, SshTarget, Transport, TransportError,
};
pub use error::{ErrorKind, MitsError, Result};
pub use evidence::{Capture, CapturedEvidence, DaemonLog, EvidenceCollector, KernelLog, LogSource};
pub use executor::{CommandExecutor, ExecError, LocalShell, RemoteShell};
pub use policy::{daemon_config, default_annotations, PolicyComposer};
pub use reader::{AsyncProcessReader, ReaderError};
pub use report::{render_table, write_results_json, RunReport};
pub use run::{PreparedRun, TestRun};
pub use settings::{DaemonSettings, KernelLogSettings, Settings, SettingsError};
pub use suite::{
    ConcurrentSuite, SerialSuite, SuiteContext, SuiteKind, SuiteRunner, TestOutcome,
};
pub use telemetry::init_tracing;
pub use template::{AnnotationMap, TemplateError, TemplateExpander};
pub use validator::{
    BatchOutput, ChannelVerdict, DeniedExpectation, ExpectationRule, OutputExpectation,
    Validator, Verdict,
};
