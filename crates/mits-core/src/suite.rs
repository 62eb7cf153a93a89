//! Serial and concurrent test suites.
//!
//! The suite kind is a tagged variant resolved to a [`SuiteRunner`] at the
//! orchestration boundary.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Barrier;

use crate::catalog::TestCase;
use crate::evidence::{Capture, CapturedEvidence, EvidenceCollector};
use crate::executor::{ExecError, ExecResult};
use crate::metrics::METRICS;
use crate::obs;
use crate::validator::{BatchOutput, Validator, Verdict};

/// How the tests of one run are scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuiteKind {
    /// One test at a time, each with its own log window.
    #[default]
    Serial,
    /// All commands released together behind a barrier.
    Concurrent,
}

impl SuiteKind {
    pub fn runner(self) -> Box<dyn SuiteRunner> {
        match self {
            SuiteKind::Serial => Box::new(SerialSuite),
            SuiteKind::Concurrent => Box::new(ConcurrentSuite),
        }
    }
}

impl fmt::Display for SuiteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuiteKind::Serial => write!(f, "serial"),
            SuiteKind::Concurrent => write!(f, "concurrent"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown suite kind `{0}` (expected `serial` or `concurrent`)")]
pub struct UnknownSuiteKind(pub String);

impl FromStr for SuiteKind {
    type Err = UnknownSuiteKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "serial" => Ok(SuiteKind::Serial),
            "concurrent" => Ok(SuiteKind::Concurrent),
            _ => Err(UnknownSuiteKind(s.to_string())),
        }
    }
}

/// What a suite needs to run tests and judge them.
#[derive(Clone)]
pub struct SuiteContext {
    pub collector: EvidenceCollector,
    pub validator: Validator,
}

impl SuiteContext {
    pub fn new(collector: EvidenceCollector, validator: Validator) -> Self {
        Self {
            collector,
            validator,
        }
    }
}

/// Evidence and verdict of one executed test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub name: String,
    pub suite: SuiteKind,
    pub evidence: CapturedEvidence,
    pub verdict: Verdict,
}

impl TestOutcome {
    pub fn passed(&self) -> bool {
        self.verdict.passed()
    }
}

/// Runs a batch of tests. Validation failures are reported in the outcomes;
/// an error means a command could not be executed at all.
#[async_trait]
pub trait SuiteRunner: Send + Sync {
    fn kind(&self) -> SuiteKind;

    async fn run(&self, tests: &[TestCase], ctx: &SuiteContext) -> ExecResult<Vec<TestOutcome>>;
}

async fn run_all(ctx: &SuiteContext, commands: &[String]) -> ExecResult<()> {
    for command in commands {
        let output = ctx.collector.executor().execute(command).await?;
        tracing::trace!(command = %command, output = %output, "auxiliary command finished");
    }
    Ok(())
}

/// Best-effort teardown after a failed step; the original error wins.
async fn clean_up(ctx: &SuiteContext, tests: &[TestCase]) {
    for test in tests {
        if let Err(e) = run_all(ctx, &test.teardown).await {
            obs::emit_run_error("teardown", &e);
        }
    }
}

fn record(outcome: &TestOutcome) {
    METRICS.record_verdict(outcome.passed());
    obs::emit_test_verdict(&outcome.name, outcome.passed(), outcome.verdict.denied.is_some());
}

/// Runs tests one after another, each in its own evidence window.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialSuite;

#[async_trait]
impl SuiteRunner for SerialSuite {
    fn kind(&self) -> SuiteKind {
        SuiteKind::Serial
    }

    async fn run(&self, tests: &[TestCase], ctx: &SuiteContext) -> ExecResult<Vec<TestOutcome>> {
        let started = Instant::now();
        let mut outcomes = Vec::with_capacity(tests.len());

        for test in tests {
            obs::emit_test_started(&test.name, "serial");
            let measured: ExecResult<CapturedEvidence> = async {
                run_all(ctx, &test.setup).await?;
                // Setup output must not leak into the test window.
                ctx.collector.reset().await?;
                ctx.collector
                    .collect(&test.command, test.denied_command.as_deref())
                    .await
            }
            .await;
            let evidence = match measured {
                Ok(evidence) => evidence,
                Err(e) => {
                    clean_up(ctx, std::slice::from_ref(test)).await;
                    return Err(e);
                }
            };
            run_all(ctx, &test.teardown).await?;

            let verdict = ctx.validator.validate(&evidence, &test.expect);
            let outcome = TestOutcome {
                name: test.name.clone(),
                suite: SuiteKind::Serial,
                evidence,
                verdict,
            };
            record(&outcome);
            outcomes.push(outcome);
        }

        let passed = outcomes.iter().filter(|o| o.passed()).count();
        obs::emit_suite_finished("serial", outcomes.len(), passed, started.elapsed().as_millis() as u64);
        Ok(outcomes)
    }
}

/// Releases every command of the batch at once and validates the logs of
/// the whole burst.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConcurrentSuite;

struct Job {
    test: usize,
    denied: bool,
    command: String,
}

impl ConcurrentSuite {
    /// Setups, then the barrier-released burst, then one shared log capture.
    async fn burst(&self, tests: &[TestCase], ctx: &SuiteContext) -> ExecResult<(Vec<BatchOutput>, Capture)> {
        for test in tests {
            obs::emit_test_started(&test.name, "concurrent");
            run_all(ctx, &test.setup).await?;
        }
        ctx.collector.reset().await?;

        let mut jobs = Vec::new();
        for (index, test) in tests.iter().enumerate() {
            jobs.push(Job {
                test: index,
                denied: false,
                command: test.command.clone(),
            });
            if let Some(denied) = &test.denied_command {
                jobs.push(Job {
                    test: index,
                    denied: true,
                    command: denied.clone(),
                });
            }
        }

        // Every task is created before any of them may proceed.
        let barrier = Arc::new(Barrier::new(jobs.len()));
        let handles: Vec<_> = jobs
            .into_iter()
            .map(|job| {
                let barrier = barrier.clone();
                let executor = ctx.collector.executor().clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    let output = executor.execute(&job.command).await;
                    (job.test, job.denied, output)
                })
            })
            .collect();

        let mut outputs = vec![BatchOutput::default(); tests.len()];
        for joined in futures::future::join_all(handles).await {
            let (index, denied, output) = joined.map_err(|e| ExecError::Join(e.to_string()))?;
            let output = output?;
            if denied {
                outputs[index].denied_output = Some(output);
            } else {
                outputs[index].output = output;
            }
        }

        let shared = ctx.collector.capture_logs().await?;
        Ok((outputs, shared))
    }
}

#[async_trait]
impl SuiteRunner for ConcurrentSuite {
    fn kind(&self) -> SuiteKind {
        SuiteKind::Concurrent
    }

    async fn run(&self, tests: &[TestCase], ctx: &SuiteContext) -> ExecResult<Vec<TestOutcome>> {
        if tests.is_empty() {
            return Ok(Vec::new());
        }
        let started = Instant::now();

        let measured = self.burst(tests, ctx).await;
        let (outputs, shared) = match measured {
            Ok(measured) => measured,
            Err(e) => {
                clean_up(ctx, tests).await;
                return Err(e);
            }
        };
        for test in tests {
            run_all(ctx, &test.teardown).await?;
        }

        let verdicts = ctx
            .validator
            .validate_batch(outputs.iter().zip(tests.iter().map(|t| &t.expect)), &shared);

        let outcomes: Vec<TestOutcome> = tests
            .iter()
            .zip(outputs)
            .zip(verdicts)
            .map(|((test, output), verdict)| TestOutcome {
                name: test.name.clone(),
                suite: SuiteKind::Concurrent,
                evidence: CapturedEvidence::with_shared_logs(output.output, output.denied_output, &shared),
                verdict,
            })
            .collect();
        outcomes.iter().for_each(record);

        let passed = outcomes.iter().filter(|o| o.passed()).count();
        obs::emit_suite_finished(
            "concurrent",
            outcomes.len(),
            passed,
            started.elapsed().as_millis() as u64,
        );
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{MemoryLog, RecordingExecutor};
    use crate::validator::{ExpectationRule, OutputExpectation};
    use std::time::Duration;

    fn context(executor: RecordingExecutor, kernel: Arc<MemoryLog>) -> (Arc<RecordingExecutor>, SuiteContext) {
        let executor = Arc::new(executor);
        let collector = EvidenceCollector::new(executor.clone(), kernel, Arc::new(MemoryLog::new()));
        (executor, SuiteContext::new(collector, Validator::default()))
    }

    fn mkdir_test() -> TestCase {
        TestCase::new(
            "mkdir",
            "mkdir x",
            ExpectationRule::new(OutputExpectation::Empty, "allowed-mkdir['x']")
                .with_denied(OutputExpectation::contains("Permission denied"), "denied-mkdir['x']"),
        )
        .with_denied_command("mkdir restricted/x")
        .with_setup("mkdir -p restricted")
        .with_teardown("rmdir x")
    }

    #[test]
    fn test_suite_kind_parse_and_display() {
        assert_eq!("serial".parse::<SuiteKind>().unwrap(), SuiteKind::Serial);
        assert_eq!("Concurrent".parse::<SuiteKind>().unwrap(), SuiteKind::Concurrent);
        assert!("parallel".parse::<SuiteKind>().is_err());
        assert_eq!(SuiteKind::Concurrent.to_string(), "concurrent");
        assert_eq!(SuiteKind::Concurrent.runner().kind(), SuiteKind::Concurrent);
    }

    #[tokio::test]
    async fn test_serial_suite_runs_in_order() {
        let kernel = Arc::new(MemoryLog::new());
        let (executor, ctx) = context(
            RecordingExecutor::new()
                .logs("mkdir -p restricted", kernel.clone(), "setup noise\n")
                .logs("mkdir x", kernel.clone(), "allowed-mkdir['x']\n")
                .logs("mkdir restricted/x", kernel.clone(), "denied-mkdir['x']\n")
                .respond("mkdir restricted/x", "mkdir: cannot create directory: Permission denied\n"),
            kernel,
        );

        let outcomes = SerialSuite.run(&[mkdir_test()], &ctx).await.unwrap();
        assert_eq!(
            executor.commands(),
            vec!["mkdir -p restricted", "mkdir x", "mkdir restricted/x", "rmdir x"]
        );
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].passed(), "{:?}", outcomes[0].verdict);
        assert_eq!(outcomes[0].evidence.allowed.kernel_log, "allowed-mkdir['x']\n");
        assert!(!outcomes[0].evidence.allowed.kernel_log.contains("setup noise"));
    }

    #[tokio::test]
    async fn test_serial_suite_reports_mismatch_as_data() {
        let kernel = Arc::new(MemoryLog::new());
        let (_, ctx) = context(RecordingExecutor::new().respond("mkdir x", "unexpected\n"), kernel);
        let outcomes = SerialSuite.run(&[mkdir_test()], &ctx).await.unwrap();
        let verdict = outcomes[0].verdict;
        assert!(!verdict.allowed.output_valid);
        assert!(!verdict.allowed.kernel_log_valid);
        assert!(verdict.allowed.daemon_log_valid);
        assert!(!outcomes[0].passed());
    }

    #[tokio::test]
    async fn test_concurrent_suite_releases_all_commands_together() {
        let kernel = Arc::new(MemoryLog::new());
        let (executor, ctx) = context(
            RecordingExecutor::new()
                .with_delay(Duration::from_millis(50))
                .logs("mkdir x", kernel.clone(), "allowed-mkdir['x']\n")
                .logs("mkdir restricted/x", kernel.clone(), "denied-mkdir['x']\n")
                .logs("touch f", kernel.clone(), "allowed-create['f']\n")
                .respond("mkdir restricted/x", "Permission denied\n"),
            kernel,
        );
        let create = TestCase::new(
            "create",
            "touch f",
            ExpectationRule::new(OutputExpectation::Empty, "allowed-create['f']"),
        );

        let outcomes = ConcurrentSuite
            .run(&[mkdir_test(), create], &ctx)
            .await
            .unwrap();

        assert_eq!(executor.max_in_flight(), 3);
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.passed()));
        // Both tests see the whole batch's kernel log.
        assert!(outcomes[1].evidence.allowed.kernel_log.contains("denied-mkdir['x']"));
        assert_eq!(outcomes[0].suite, SuiteKind::Concurrent);
    }

    #[tokio::test]
    async fn test_concurrent_suite_empty() {
        let (executor, ctx) = context(RecordingExecutor::new(), Arc::new(MemoryLog::new()));
        assert!(ConcurrentSuite.run(&[], &ctx).await.unwrap().is_empty());
        assert!(executor.commands().is_empty());
    }
}
