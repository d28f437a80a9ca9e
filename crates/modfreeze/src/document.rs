//! JSON documents read and written by the CLI

use anyhow::{anyhow, Context, Result};
use modfreeze_analysis::FreezeMetrics;
use modfreeze_core::{FreezeSummary, ModuleId, Store};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A store and the name of the root module to operate on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreDocument {
    #[serde(default)]
    pub root: Option<String>,
    pub store: Store,
}

impl StoreDocument {
    pub fn new(store: Store, root: &str) -> Self {
        Self {
            root: Some(root.to_string()),
            store,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parsing store document {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json(path, self)
    }

    /// Resolves the root by name; `name` overrides the document's own.
    pub fn root_id(&self, name: Option<&str>) -> Result<ModuleId> {
        let name = name
            .or(self.root.as_deref())
            .ok_or_else(|| anyhow!("no root module given; pass --root or set \"root\" in the document"))?;
        self.store
            .find_root(name)
            .ok_or_else(|| anyhow!("no root module named '{name}'"))
    }
}

/// Output of `modfreeze freeze --output`: the store holding both trees, the
/// frozen root, and what the freeze did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrozenDocument {
    pub root: ModuleId,
    pub summary: FreezeSummary,
    pub metrics: FreezeMetrics,
    pub store: Store,
}

impl FrozenDocument {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parsing frozen document {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json(path, self)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))
}
