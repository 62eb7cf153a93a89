//! End-to-end orchestration of one suite run against the authorization daemon.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::Instrument;
use uuid::Uuid;

use crate::catalog::TestCase;
use crate::error::Result;
use crate::evidence::{DaemonLog, EvidenceCollector, KernelLog};
use crate::executor::{CommandExecutor, LocalShell};
use crate::metrics::METRICS;
use crate::obs;
use crate::policy::{daemon_config, default_annotations, PolicyComposer};
use crate::reader::AsyncProcessReader;
use crate::report::RunReport;
use crate::settings::Settings;
use crate::suite::{SuiteContext, SuiteKind};
use crate::template::{AnnotationMap, TemplateExpander};
use crate::validator::Validator;

/// File name of the composed policy inside the working directory.
pub const POLICY_FILE: &str = "medusa.conf";
/// File name of the daemon configuration inside the working directory.
pub const DAEMON_CONFIG_FILE: &str = "constable.conf";

/// Files written before the daemon starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedRun {
    pub policy_path: PathBuf,
    pub config_path: PathBuf,
    pub restricted_dir: PathBuf,
}

/// One suite run: policy on disk, daemon started, tests executed, daemon stopped.
#[derive(Debug, Clone)]
pub struct TestRun {
    settings: Settings,
    workdir: PathBuf,
    composer: PolicyComposer,
}

impl TestRun {
    pub fn new(settings: Settings, workdir: impl Into<PathBuf>) -> Self {
        Self {
            settings,
            workdir: workdir.into(),
            composer: PolicyComposer::builtin(),
        }
    }

    pub fn with_composer(mut self, composer: PolicyComposer) -> Self {
        self.composer = composer;
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Executor running commands from inside the working directory.
    pub fn local_executor(&self) -> LocalShell {
        let shell = LocalShell::new().with_cwd(&self.workdir);
        match self.settings.session.command_timeout_ms {
            0 => shell,
            _ => shell.with_timeout(self.settings.session.command_timeout()),
        }
    }

    /// Path annotations: defaults derived from the working directory,
    /// overridden by the `[paths]` settings.
    pub fn annotations(&self) -> AnnotationMap {
        default_annotations(&self.workdir).merged(&self.settings.paths)
    }

    /// Write the policy and daemon configuration and create the restricted tree.
    pub fn prepare(&self, tests: &[TestCase]) -> Result<PreparedRun> {
        let annotations = self.annotations();
        let policy = self.composer.compose(tests, &annotations)?;

        let restricted_dir = self.workdir.join("restricted");
        std::fs::create_dir_all(&restricted_dir)?;

        let policy_path = self.workdir.join(POLICY_FILE);
        std::fs::write(&policy_path, policy)?;
        let config_path = self.workdir.join(DAEMON_CONFIG_FILE);
        std::fs::write(&config_path, daemon_config(&policy_path, &self.settings.daemon.device))?;

        tracing::debug!(policy = %policy_path.display(), tests = tests.len(), "policy written");
        Ok(PreparedRun {
            policy_path,
            config_path,
            restricted_dir,
        })
    }

    /// Start the daemon. A blank command runs without one; its log stays empty.
    fn start_daemon(&self) -> Result<AsyncProcessReader> {
        let template = self.settings.daemon.command.trim();
        if template.is_empty() {
            tracing::warn!("no daemon command configured; daemon log checks see an empty log");
            return Ok(AsyncProcessReader::from_reader(std::io::empty()));
        }
        let command = TemplateExpander::new().expand(template, &self.annotations())?;
        let daemon = AsyncProcessReader::spawn(&command)?;
        obs::emit_daemon_started(&command, daemon.pid());
        Ok(daemon)
    }

    async fn stop_daemon(&self, daemon: Arc<AsyncProcessReader>) -> String {
        if let Err(e) = daemon.terminate() {
            obs::emit_run_error("daemon.terminate", &e);
        }
        let limit = self.settings.daemon.shutdown();
        let waiting = daemon.clone();
        let exited = tokio::task::spawn_blocking(move || waiting.wait_finished(limit))
            .await
            .unwrap_or(false);
        let tail = daemon.read();
        obs::emit_daemon_terminated(daemon.pid(), tail.len(), exited);
        tail
    }

    /// Run `tests` with `executor`, which must run commands from the working directory.
    pub async fn execute(
        &self,
        tests: &[TestCase],
        suite: SuiteKind,
        executor: Arc<dyn CommandExecutor>,
    ) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let span = obs::suite_span(&run_id.to_string(), &suite.to_string());
        self.execute_inner(run_id, tests, suite, executor)
            .instrument(span)
            .await
    }

    async fn execute_inner(
        &self,
        run_id: Uuid,
        tests: &[TestCase],
        suite: SuiteKind,
        executor: Arc<dyn CommandExecutor>,
    ) -> Result<RunReport> {
        let started_at = Utc::now();
        self.prepare(tests)?;
        let daemon = Arc::new(self.start_daemon()?);

        tokio::time::sleep(self.settings.daemon.startup()).await;
        let startup = daemon.read();
        tracing::debug!(bytes = startup.len(), "daemon startup output discarded");

        let kernel_log = Arc::new(KernelLog::new(executor.clone(), self.settings.kernel_log.command.clone()));
        let collector = EvidenceCollector::new(executor, kernel_log, Arc::new(DaemonLog::new(daemon.clone())))
            .with_settle(self.settings.daemon.settle());
        let ctx = SuiteContext::new(collector, Validator::new(self.settings.daemon.error_marker.clone()));

        let outcomes = suite.runner().run(tests, &ctx).await;
        let tail = self.stop_daemon(daemon).await;
        if !tail.is_empty() {
            tracing::debug!(tail = %tail, "daemon output after the last test");
        }

        let report = RunReport::new(run_id, suite, started_at, Utc::now(), outcomes?);
        METRICS.flush();
        Ok(report)
    }
}
