//! Test catalog: an explicit registry of allow/deny test cases.
//!
//! Catalogs are plain TOML files holding `[[test]]` entries:
//!
//! ```toml
//! [[test]]
//! name = "mkdir"
//! command = "mkdir test"
//! denied_command = "mkdir restricted/test"
//! teardown = ["rmdir test"]
//! policy = "all_domains mkdir allowed { return OK; }"
//!
//! [test.expect]
//! kernel_log = "allowed-mkdir['test']"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::validator::ExpectationRule;

const BUILTIN_TESTS: &str = include_str!("../assets/builtin_tests.toml");

/// Errors raised while building or loading a catalog.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("duplicate test name: {0}")]
    DuplicateTest(String),

    #[error("unknown test: {0}")]
    UnknownTest(String),

    #[error("failed to read catalog {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid catalog: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize catalog: {0}")]
    Serialize(#[from] toml::ser::Error),
}

pub type CatalogResult<T> = std::result::Result<T, CatalogError>;

/// One allow/deny test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub name: String,
    /// Policy snippet appended to the base policy while this test runs.
    #[serde(default)]
    pub policy: String,
    /// Commands run before the test window opens; their output is discarded.
    #[serde(default)]
    pub setup: Vec<String>,
    /// Operation exercised on the allowed path.
    pub command: String,
    /// Same operation on the restricted path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denied_command: Option<String>,
    #[serde(default)]
    pub teardown: Vec<String>,
    pub expect: ExpectationRule,
}

impl TestCase {
    pub fn new(name: impl Into<String>, command: impl Into<String>, expect: ExpectationRule) -> Self {
        Self {
            name: name.into(),
            policy: String::new(),
            setup: Vec::new(),
            command: command.into(),
            denied_command: None,
            teardown: Vec::new(),
            expect,
        }
    }

    pub fn with_policy(mut self, policy: impl Into<String>) -> Self {
        self.policy = policy.into();
        self
    }

    pub fn with_setup(mut self, command: impl Into<String>) -> Self {
        self.setup.push(command.into());
        self
    }

    pub fn with_denied_command(mut self, command: impl Into<String>) -> Self {
        self.denied_command = Some(command.into());
        self
    }

    pub fn with_teardown(mut self, command: impl Into<String>) -> Self {
        self.teardown.push(command.into());
        self
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogFile {
    #[serde(rename = "test", default)]
    tests: Vec<TestCase>,
}

/// Ordered registry of test cases with unique names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestCatalog {
    tests: Vec<TestCase>,
}

impl TestCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The filesystem hook tests shipped with MITS.
    pub fn builtin() -> CatalogResult<Self> {
        Self::from_toml_str(BUILTIN_TESTS)
    }

    /// Add a test; names must be unique.
    pub fn register(&mut self, test: TestCase) -> CatalogResult<()> {
        if self.get(&test.name).is_some() {
            return Err(CatalogError::DuplicateTest(test.name));
        }
        self.tests.push(test);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TestCase> {
        self.tests.iter().find(|t| t.name == name)
    }

    /// Tests named in `names`, in the order given.
    pub fn select<S: AsRef<str>>(&self, names: &[S]) -> CatalogResult<Vec<TestCase>> {
        names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                self.get(name)
                    .cloned()
                    .ok_or_else(|| CatalogError::UnknownTest(name.to_string()))
            })
            .collect()
    }

    pub fn all(&self) -> &[TestCase] {
        &self.tests
    }

    pub fn names(&self) -> Vec<&str> {
        self.tests.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    pub fn from_toml_str(text: &str) -> CatalogResult<Self> {
        let file: CatalogFile = toml::from_str(text)?;
        let mut catalog = Self::new();
        for test in file.tests {
            catalog.register(test)?;
        }
        Ok(catalog)
    }

    pub fn load(path: &Path) -> CatalogResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let catalog = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), tests = catalog.len(), "loaded test catalog");
        Ok(catalog)
    }

    pub fn to_toml_string(&self) -> CatalogResult<String> {
        let file = CatalogFile {
            tests: self.tests.clone(),
        };
        Ok(toml::to_string_pretty(&file)?)
    }
}
