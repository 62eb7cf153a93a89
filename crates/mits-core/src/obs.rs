//! Structured observability hooks for MITS sessions, suites and daemons.
//!
//! Lifecycle events are emitted at `info!` level, per-command events at
//! `debug!`. Filter with `RUST_LOG`; pass `--json` to the CLI for JSON lines.

use tracing::{debug, info};

/// Span tagging every event of one suite run with its run id.
///
/// ```ignore
/// run_suite().instrument(suite_span("6f1c...", "serial")).await
/// ```
pub fn suite_span(run_id: &str, suite: &str) -> tracing::Span {
    tracing::info_span!("mits.suite", run_id = %run_id, suite = %suite)
}

/// Emit event: session connected and switched to the sentinel prompt.
pub fn emit_session_ready(native_prompt: &str, sentinel: &str) {
    info!(
        event = "session.ready",
        native_prompt = ?native_prompt,
        sentinel = ?sentinel,
    );
}

pub fn emit_command_executed(command: &str, output_bytes: usize, duration_ms: u64) {
    debug!(
        event = "session.command",
        command = %command,
        output_bytes = output_bytes,
        duration_ms = duration_ms,
    );
}

pub fn emit_daemon_started(command: &str, pid: Option<u32>) {
    info!(event = "daemon.started", command = %command, pid = ?pid);
}

pub fn emit_daemon_terminated(pid: Option<u32>, tail_bytes: usize, exited: bool) {
    info!(
        event = "daemon.terminated",
        pid = ?pid,
        tail_bytes = tail_bytes,
        exited = exited,
    );
}

pub fn emit_test_started(name: &str, suite: &str) {
    info!(event = "test.started", test = %name, suite = %suite);
}

/// Emit event: a test was validated.
pub fn emit_test_verdict(name: &str, passed: bool, denied_checked: bool) {
    info!(
        event = "test.verdict",
        test = %name,
        passed = passed,
        denied_checked = denied_checked,
    );
}

pub fn emit_suite_finished(suite: &str, total: usize, passed: usize, duration_ms: u64) {
    info!(
        event = "suite.finished",
        suite = %suite,
        total = total,
        passed = passed,
        failed = total - passed,
        duration_ms = duration_ms,
    );
}

/// Emit event: a cleanup step failed after the run (warning level).
pub fn emit_run_error(stage: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(event = "run.error", stage = %stage, error = %error);
}
