//! Annotation expansion for policy and configuration text.
//!
//! Text may carry tokens of the form `@{NAME}` (the delimiters are
//! configurable). [`TemplateExpander::expand`] rewrites every token with the
//! value registered in an [`AnnotationMap`] and repeats until a pass leaves
//! the text unchanged. Values may themselves contain tokens, so chains of
//! annotations resolve across passes.
//!
//! A token whose value is the token itself converges on the first pass and is
//! left verbatim in the output. Longer cycles never reach a fixed point; they
//! are cut off after `map.len() + 1` text-changing passes with
//! [`TemplateError::CyclicAnnotation`].

use std::collections::{BTreeMap, BTreeSet};

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Default opening delimiter of an annotation token.
pub const DEFAULT_OPEN: &str = "@{";

/// Default closing delimiter of an annotation token.
pub const DEFAULT_CLOSE: &str = "}";

/// Errors produced while expanding annotations.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("unknown annotation: {token}")]
    UnknownAnnotation { token: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("cyclic annotation: text still changing after {passes} passes (tokens: {})", tokens.join(", "))]
    CyclicAnnotation { passes: usize, tokens: Vec<String> },

    #[error("invalid delimiters: {0}")]
    InvalidDelimiters(String),
}

/// Result type for template operations.
pub type TemplateResult<T> = std::result::Result<T, TemplateError>;

/// Annotation name to replacement text.
///
/// Keys are bare identifiers (`TESTING_PATH`), without delimiters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnnotationMap(BTreeMap<String, String>);

impl AnnotationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an entry (builder pattern).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overlay `other` on top of this map; entries in `other` win.
    pub fn merged(mut self, other: &AnnotationMap) -> Self {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for AnnotationMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Fixed-point annotation expander.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateExpander {
    open: String,
    close: String,
}

impl Default for TemplateExpander {
    fn default() -> Self {
        Self {
            open: DEFAULT_OPEN.to_string(),
            close: DEFAULT_CLOSE.to_string(),
        }
    }
}

impl TemplateExpander {
    /// Expander recognising `@{NAME}` tokens.
    pub fn new() -> Self {
        Self::default()
    }

    /// Expander recognising `<open>NAME<close>` tokens.
    pub fn with_delimiters(open: &str, close: &str) -> TemplateResult<Self> {
        if open.is_empty() || close.is_empty() {
            return Err(TemplateError::InvalidDelimiters(format!(
                "delimiters must be non-empty (open={:?}, close={:?})",
                open, close
            )));
        }
        Ok(Self {
            open: open.to_string(),
            close: close.to_string(),
        })
    }

    /// Render the token for an annotation name.
    pub fn token(&self, name: &str) -> String {
        format!("{}{}{}", self.open, name, self.close)
    }

    fn token_pattern(&self) -> TemplateResult<Regex> {
        let pattern = format!(
            "{}([A-Za-z_]+){}",
            regex::escape(&self.open),
            regex::escape(&self.close)
        );
        Regex::new(&pattern).map_err(|e| TemplateError::InvalidDelimiters(e.to_string()))
    }

    /// Names of the distinct tokens currently present in `text`.
    pub fn tokens(&self, text: &str) -> TemplateResult<BTreeSet<String>> {
        let pattern = self.token_pattern()?;
        Ok(pattern
            .captures_iter(text)
            .map(|c| c[1].to_string())
            .collect())
    }

    /// Expand every annotation in `text` until the text stops changing.
    pub fn expand(&self, text: &str, map: &AnnotationMap) -> TemplateResult<String> {
        let pattern = self.token_pattern()?;
        let limit = map.len() + 1;
        let mut current = text.to_string();
        let mut passes = 0usize;

        loop {
            let names: BTreeSet<&str> = pattern
                .captures_iter(&current)
                .filter_map(|c| c.get(1))
                .map(|m| m.as_str())
                .collect();

            let mut next = current.clone();
            for name in &names {
                let value = map
                    .get(name)
                    .ok_or_else(|| TemplateError::UnknownAnnotation {
                        token: self.token(name),
                    })?;
                next = next.replace(&self.token(name), value);
            }

            if next == current {
                tracing::trace!(passes, "annotation expansion converged");
                return Ok(next);
            }

            passes += 1;
            if passes > limit {
                return Err(TemplateError::CyclicAnnotation {
                    passes,
                    tokens: names.iter().map(|n| self.token(n)).collect(),
                });
            }
            current = next;
        }
    }

    /// Expand raw bytes; input that is not UTF-8 text is rejected before scanning.
    pub fn expand_bytes(&self, input: &[u8], map: &AnnotationMap) -> TemplateResult<String> {
        let text = std::str::from_utf8(input)
            .map_err(|e| TemplateError::InvalidInput(format!("input is not UTF-8 text: {}", e)))?;
        self.expand(text, map)
    }
}
