//! Serial and concurrent suites over the built-in catalog.

use std::sync::Arc;
use std::time::Duration;

use mits_core::catalog::TestCatalog;
use mits_core::evidence::EvidenceCollector;
use mits_core::fakes::{MemoryLog, RecordingExecutor};
use mits_core::suite::{SuiteContext, SuiteKind};
use mits_core::validator::Validator;

/// Executor that reacts to the built-in mkdir and unlink tests like a
/// correctly enforcing daemon would.
fn enforcing(kernel: &Arc<MemoryLog>, daemon: &Arc<MemoryLog>) -> RecordingExecutor {
    RecordingExecutor::new()
        .with_delay(Duration::from_millis(20))
        .logs("mkdir test", kernel.clone(), "allowed-mkdir['test']\n")
        .logs("mkdir restricted/test", kernel.clone(), "denied-mkdir['test']\n")
        .respond(
            "mkdir restricted/test",
            "mkdir: cannot create directory 'restricted/test': Permission denied\n",
        )
        .logs("unlink file.txt", kernel.clone(), "allowed-unlink['file.txt']\n")
        .logs("unlink restricted/file.txt", kernel.clone(), "denied-unlink['file.txt']\n")
        .respond(
            "unlink restricted/file.txt",
            "unlink: cannot unlink 'restricted/file.txt': Permission denied\n",
        )
        .logs("unlink file.txt", daemon.clone(), "unlink decided\n")
}

fn context(executor: Arc<RecordingExecutor>, kernel: Arc<MemoryLog>, daemon: Arc<MemoryLog>, marker: &str) -> SuiteContext {
    SuiteContext::new(
        EvidenceCollector::new(executor, kernel, daemon),
        Validator::new(marker),
    )
}

// ── Serial ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn serial_builtin_tests_pass_against_enforcing_daemon() {
    let kernel = Arc::new(MemoryLog::new());
    let daemon = Arc::new(MemoryLog::new());
    let executor = Arc::new(enforcing(&kernel, &daemon));
    let ctx = context(executor.clone(), kernel, daemon, "error");

    let tests = TestCatalog::builtin().unwrap().select(&["mkdir", "unlink"]).unwrap();
    let outcomes = SuiteKind::Serial.runner().run(&tests, &ctx).await.unwrap();

    assert_eq!(outcomes.len(), 2);
    for outcome in &outcomes {
        assert!(outcome.passed(), "{} failed: {:?}", outcome.name, outcome.verdict);
    }
    assert_eq!(
        executor.commands(),
        vec![
            "mkdir test",
            "mkdir restricted/test",
            "rmdir test",
            "touch file.txt restricted/file.txt",
            "unlink file.txt",
            "unlink restricted/file.txt",
            "rm restricted/file.txt",
        ]
    );
    assert_eq!(outcomes[1].evidence.allowed.daemon_log, "unlink decided\n");
}

#[tokio::test]
async fn daemon_error_marker_fails_the_test() {
    let kernel = Arc::new(MemoryLog::new());
    let daemon = Arc::new(MemoryLog::new());
    let executor = Arc::new(enforcing(&kernel, &daemon));
    // With "decided" as the marker the unlink test's daemon output is an error.
    let ctx = context(executor, kernel, daemon, "decided");

    let tests = TestCatalog::builtin().unwrap().select(&["unlink"]).unwrap();
    let outcomes = SuiteKind::Serial.runner().run(&tests, &ctx).await.unwrap();
    assert!(!outcomes[0].verdict.allowed.daemon_log_valid);
    assert!(outcomes[0].verdict.allowed.kernel_log_valid);
    assert!(!outcomes[0].passed());
}

// ── Concurrent ──────────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_builtin_tests_share_one_log_window() {
    let kernel = Arc::new(MemoryLog::new());
    let daemon = Arc::new(MemoryLog::new());
    let executor = Arc::new(enforcing(&kernel, &daemon));
    let ctx = context(executor.clone(), kernel, daemon, "error");

    let tests = TestCatalog::builtin().unwrap().select(&["mkdir", "unlink"]).unwrap();
    let outcomes = SuiteKind::Concurrent.runner().run(&tests, &ctx).await.unwrap();

    assert!(outcomes.iter().all(|o| o.passed()), "{:?}", outcomes);
    // Two tests with a denied counterpart each: four commands in flight at once.
    assert_eq!(executor.max_in_flight(), 4);
    assert_eq!(
        outcomes[0].evidence.allowed.kernel_log,
        outcomes[1].evidence.allowed.kernel_log
    );
    let commands = executor.commands();
    assert_eq!(commands.first().map(String::as_str), Some("touch file.txt restricted/file.txt"));
    assert_eq!(&commands[commands.len() - 2..], ["rmdir test", "rm restricted/file.txt"]);
}

// ── Cleanup on failure ──────────────────────────────────────────────────

#[tokio::test]
async fn serial_failure_still_runs_teardown() {
    let kernel = Arc::new(MemoryLog::new());
    let daemon = Arc::new(MemoryLog::new());
    let executor = Arc::new(enforcing(&kernel, &daemon).fail_on("unlink file.txt"));
    let ctx = context(executor.clone(), kernel, daemon, "error");

    let tests = TestCatalog::builtin().unwrap().select(&["unlink", "mkdir"]).unwrap();
    let err = SuiteKind::Serial.runner().run(&tests, &ctx).await.unwrap_err();
    assert!(err.to_string().contains("unlink file.txt"));

    let commands = executor.commands();
    assert_eq!(
        commands,
        vec!["touch file.txt restricted/file.txt", "unlink file.txt", "rm restricted/file.txt"]
    );
}

#[tokio::test]
async fn concurrent_failure_still_runs_every_teardown() {
    let kernel = Arc::new(MemoryLog::new());
    let daemon = Arc::new(MemoryLog::new());
    let executor = Arc::new(enforcing(&kernel, &daemon).fail_on("mkdir restricted/test"));
    let ctx = context(executor.clone(), kernel, daemon, "error");

    let tests = TestCatalog::builtin().unwrap().select(&["mkdir", "unlink"]).unwrap();
    assert!(SuiteKind::Concurrent.runner().run(&tests, &ctx).await.is_err());

    let commands = executor.commands();
    assert_eq!(&commands[commands.len() - 2..], ["rmdir test", "rm restricted/file.txt"]);
}
