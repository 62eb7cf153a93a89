//! Multi-channel validation of captured evidence.
//!
//! A test passes when its command output, the kernel-log delta and the
//! daemon-log delta all match its [`ExpectationRule`]; tests that define a
//! denied counterpart must also pass the same checks on the denied capture.
//! A mismatch is reported as a negative [`Verdict`], never as an error.

use serde::{Deserialize, Serialize};

use crate::evidence::{Capture, CapturedEvidence};

/// Default marker whose presence in the daemon log fails a test.
pub const DEFAULT_ERROR_MARKER: &str = "error";

/// What the command output channel must look like.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum OutputExpectation {
    /// Output must be exactly empty (a lone space fails).
    #[default]
    Empty,
    /// Output must contain the string; `Contains("")` accepts anything.
    Contains(String),
    /// Output must contain every string.
    ContainsAll(Vec<String>),
}

impl OutputExpectation {
    pub fn contains(s: impl Into<String>) -> Self {
        OutputExpectation::Contains(s.into())
    }

    pub fn contains_all<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        OutputExpectation::ContainsAll(items.into_iter().map(Into::into).collect())
    }

    /// Whether `output` satisfies this expectation.
    pub fn matches(&self, output: &str) -> bool {
        match self {
            OutputExpectation::Empty => output.is_empty(),
            OutputExpectation::Contains(s) => output.contains(s.as_str()),
            OutputExpectation::ContainsAll(items) => {
                items.iter().all(|s| output.contains(s.as_str()))
            }
        }
    }
}

/// Expectations for the denied-path counterpart of a test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeniedExpectation {
    #[serde(default)]
    pub output: OutputExpectation,
    /// Substring required in the kernel-log delta of the denied command.
    pub kernel_log: String,
}

/// Per-test description of passing evidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectationRule {
    #[serde(default)]
    pub output: OutputExpectation,
    /// Substring required in the kernel-log delta.
    pub kernel_log: String,
    /// The daemon log must not contain the error marker.
    #[serde(default = "default_true")]
    pub daemon_error_forbidden: bool,
    #[serde(default)]
    pub denied: Option<DeniedExpectation>,
}

fn default_true() -> bool {
    true
}

impl ExpectationRule {
    pub fn new(output: OutputExpectation, kernel_log: impl Into<String>) -> Self {
        Self {
            output,
            kernel_log: kernel_log.into(),
            daemon_error_forbidden: true,
            denied: None,
        }
    }

    /// Add a denied-path expectation (builder pattern).
    pub fn with_denied(mut self, output: OutputExpectation, kernel_log: impl Into<String>) -> Self {
        self.denied = Some(DeniedExpectation {
            output,
            kernel_log: kernel_log.into(),
        });
        self
    }

    /// Allow error markers in the daemon log (builder pattern).
    pub fn allow_daemon_errors(mut self) -> Self {
        self.daemon_error_forbidden = false;
        self
    }
}

/// Validity of each observation channel for one capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelVerdict {
    pub output_valid: bool,
    pub kernel_log_valid: bool,
    pub daemon_log_valid: bool,
}

impl ChannelVerdict {
    /// Verdict for a capture that was expected but never produced.
    pub fn missing() -> Self {
        Self {
            output_valid: false,
            kernel_log_valid: false,
            daemon_log_valid: false,
        }
    }

    pub fn passed(&self) -> bool {
        self.output_valid && self.kernel_log_valid && self.daemon_log_valid
    }
}

/// Outcome of validating one test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub allowed: ChannelVerdict,
    /// Present only when the rule defines a denied counterpart.
    pub denied: Option<ChannelVerdict>,
}

impl Verdict {
    /// Conjunction of every applicable channel.
    pub fn passed(&self) -> bool {
        self.allowed.passed() && self.denied.map_or(true, |d| d.passed())
    }
}

/// Compares evidence with expectations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validator {
    error_marker: String,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_MARKER)
    }
}

impl Validator {
    /// Validator with a custom case-sensitive daemon error marker.
    pub fn new(error_marker: impl Into<String>) -> Self {
        Self {
            error_marker: error_marker.into(),
        }
    }

    pub fn error_marker(&self) -> &str {
        &self.error_marker
    }

    /// Validate one test's evidence.
    pub fn validate(&self, evidence: &CapturedEvidence, rule: &ExpectationRule) -> Verdict {
        let allowed = self.check(
            &evidence.allowed,
            &rule.output,
            &rule.kernel_log,
            rule.daemon_error_forbidden,
        );

        let denied = rule.denied.as_ref().map(|expect| match &evidence.denied {
            Some(capture) => self.check(
                capture,
                &expect.output,
                &expect.kernel_log,
                rule.daemon_error_forbidden,
            ),
            None => ChannelVerdict::missing(),
        });

        Verdict { allowed, denied }
    }

    /// Validate the outputs of a concurrently executed batch.
    ///
    /// Each test's output is checked against its own rule, while the kernel
    /// and daemon logs are checked against one capture shared by the whole
    /// batch: a log line cannot be attributed to a single concurrent command.
    pub fn validate_batch<'a, I>(&self, items: I, shared: &Capture) -> Vec<Verdict>
    where
        I: IntoIterator<Item = (&'a BatchOutput, &'a ExpectationRule)>,
    {
        items
            .into_iter()
            .map(|(output, rule)| {
                let evidence = CapturedEvidence::with_shared_logs(
                    output.output.clone(),
                    output.denied_output.clone(),
                    shared,
                );
                self.validate(&evidence, rule)
            })
            .collect()
    }

    fn check(
        &self,
        capture: &Capture,
        output: &OutputExpectation,
        kernel_log: &str,
        daemon_error_forbidden: bool,
    ) -> ChannelVerdict {
        ChannelVerdict {
            output_valid: output.matches(&capture.output),
            kernel_log_valid: capture.kernel_log.contains(kernel_log),
            daemon_log_valid: !daemon_error_forbidden
                || !capture.daemon_log.contains(self.error_marker.as_str()),
        }
    }
}

/// Command outputs of one test in a concurrent batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutput {
    pub output: String,
    pub denied_output: Option<String>,
}
