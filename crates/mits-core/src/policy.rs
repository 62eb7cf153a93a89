//! Composition of the daemon policy for a set of tests.

use std::path::Path;

use crate::catalog::TestCase;
use crate::template::{AnnotationMap, TemplateExpander, TemplateResult};

const BASE_POLICY: &str = include_str!("../assets/base_policy.conf");

/// Annotation naming the directory tests run in.
pub const TESTING_PATH: &str = "TESTING_PATH";
/// Annotation naming the subtree the policy denies.
pub const RESTRICTED_PATH: &str = "RESTRICTED_PATH";

/// Builds the policy text the authorization daemon is started with.
#[derive(Debug, Clone)]
pub struct PolicyComposer {
    base: String,
    expander: TemplateExpander,
}

impl PolicyComposer {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            expander: TemplateExpander::new(),
        }
    }

    /// Composer using the base policy shipped with MITS.
    pub fn builtin() -> Self {
        Self::new(BASE_POLICY)
    }

    /// Use a custom expander, e.g. with other delimiters.
    pub fn with_expander(mut self, expander: TemplateExpander) -> Self {
        self.expander = expander;
        self
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Base policy followed by every test's snippet, annotations expanded.
    pub fn compose(&self, tests: &[TestCase], annotations: &AnnotationMap) -> TemplateResult<String> {
        let mut policy = self.base.clone();
        for test in tests.iter().filter(|t| !t.policy.trim().is_empty()) {
            if !policy.ends_with('\n') {
                policy.push('\n');
            }
            policy.push_str(&format!("\n// {}\n", test.name));
            policy.push_str(&test.policy);
        }
        self.expander.expand(&policy, annotations)
    }
}

/// Daemon configuration pointing at a policy file and the kernel device.
pub fn daemon_config(policy_path: &Path, device: &str) -> String {
    format!(
        "config \"{}\";\n\"test\" file \"{}\";\n",
        policy_path.display(),
        device
    )
}

/// Annotations for a testing directory: the restricted subtree lives inside it.
pub fn default_annotations(testing_path: &Path) -> AnnotationMap {
    AnnotationMap::new()
        .with(TESTING_PATH, testing_path.display().to_string())
        .with(RESTRICTED_PATH, format!("@{{{TESTING_PATH}}}/restricted"))
}
