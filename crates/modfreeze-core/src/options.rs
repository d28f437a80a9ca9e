//! Freeze request options

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Options for one freeze request. Loads from JSON; missing fields take
/// their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FreezeOptions {
    /// Method analyzed and rewritten on the root.
    pub entry: String,
    pub preserved_attrs: Vec<String>,
    pub preserved_methods: Vec<String>,
    /// Fold scalar constants and `if` on constant conditions.
    pub simplify: bool,
    /// Cap on mutation-analysis passes.
    pub max_iterations: usize,
}

impl Default for FreezeOptions {
    fn default() -> Self {
        Self {
            entry: "forward".to_string(),
            preserved_attrs: Vec::new(),
            preserved_methods: Vec::new(),
            simplify: true,
            max_iterations: 1000,
        }
    }
}

impl FreezeOptions {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let options: Self = serde_json::from_str(&content)?;
        Ok(options)
    }

    pub fn with_entry(mut self, entry: &str) -> Self {
        self.entry = entry.to_string();
        self
    }

    pub fn with_preserved_attrs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.preserved_attrs.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn with_preserved_methods<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.preserved_methods.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn without_simplify(mut self) -> Self {
        self.simplify = false;
        self
    }
}
