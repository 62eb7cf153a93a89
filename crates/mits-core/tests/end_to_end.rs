//! A full test window over a scripted remote shell.

use std::sync::Arc;

use mits_core::channel::{ChannelSession, SessionConfig, SharedSession};
use mits_core::evidence::{EvidenceCollector, KernelLog};
use mits_core::executor::RemoteShell;
use mits_core::fakes::{MemoryLog, ScriptedShell};
use mits_core::suite::{SuiteContext, SuiteKind};
use mits_core::validator::{ExpectationRule, OutputExpectation, Validator};
use mits_core::{render_table, TestCase};

fn remote(shell: ScriptedShell) -> Arc<RemoteShell> {
    let config = SessionConfig {
        poll_interval_ms: 5,
        ..SessionConfig::default()
    };
    let session = ChannelSession::connect(shell, config).unwrap();
    Arc::new(RemoteShell::new(SharedSession::new(session)))
}

#[tokio::test]
async fn mkdir_on_allowed_path_passes() {
    let shell = ScriptedShell::new()
        .respond("dmesg -c", "[ 12.345678] allowed-mkdir['x'] pid=812 domain=init\r\n");
    let executor = remote(shell.clone());
    let kernel_log = Arc::new(KernelLog::new(executor.clone(), "dmesg -c"));
    let daemon_log = Arc::new(MemoryLog::new());
    daemon_log.push("decision: ALLOW mkdir\n");

    let collector = EvidenceCollector::new(executor.clone(), kernel_log, daemon_log);

    // Raw command output: echo and sentinel prompt are stripped.
    let capture = collector.capture("mkdir allowed/x").await.unwrap();
    assert_eq!(capture.output, "");
    assert!(capture.kernel_log.contains("allowed-mkdir['x']"));
    assert_eq!(capture.daemon_log, "decision: ALLOW mkdir\n");

    let rule = ExpectationRule::new(OutputExpectation::Empty, "allowed-mkdir['x']");
    let verdict = Validator::default().validate(&mits_core::CapturedEvidence::allowed(capture), &rule);
    assert!(verdict.passed());
    assert_eq!(shell.sent()[1..], ["mkdir allowed/x", "dmesg -c"]);
}

#[tokio::test]
async fn serial_suite_over_remote_session() {
    let shell = ScriptedShell::new()
        .respond(
            "mkdir restricted/x",
            "mkdir: cannot create directory 'restricted/x': Permission denied\r\n",
        )
        .respond("dmesg -c", "allowed-mkdir['x']\r\ndenied-mkdir['x']\r\n");
    let executor = remote(shell.clone());
    let kernel_log = Arc::new(KernelLog::new(executor.clone(), "dmesg -c"));
    let collector = EvidenceCollector::new(executor, kernel_log, Arc::new(MemoryLog::new()));
    let ctx = SuiteContext::new(collector, Validator::default());

    let test = TestCase::new(
        "mkdir",
        "mkdir x",
        ExpectationRule::new(OutputExpectation::Empty, "allowed-mkdir['x']")
            .with_denied(OutputExpectation::contains("Permission denied"), "denied-mkdir['x']"),
    )
    .with_denied_command("mkdir restricted/x")
    .with_teardown("rmdir x");

    let outcomes = SuiteKind::Serial.runner().run(&[test], &ctx).await.unwrap();
    assert!(outcomes[0].passed(), "{:?}", outcomes[0]);

    let table = render_table(&outcomes);
    assert!(table.contains("mkdir"));
    assert!(table.ends_with("1 passed, 0 failed, 1 total\n"));
    assert_eq!(
        shell.sent()[1..],
        ["dmesg -c", "mkdir x", "dmesg -c", "mkdir restricted/x", "dmesg -c", "rmdir x"]
    );
}
