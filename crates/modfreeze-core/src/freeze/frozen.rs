//! Handle to a frozen module tree

use super::resolver::PreserveReason;
use crate::error::EvalError;
use crate::ir::Graph;
use crate::module::ModuleId;
use crate::store::Store;
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// A preserved attribute and why it kept its live value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreservedAttr {
    pub path: String,
    pub reason: PreserveReason,
}

/// What a freeze did, by dotted attribute path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FreezeSummary {
    pub folded: Vec<String>,
    pub preserved: Vec<PreservedAttr>,
    /// Root methods callable on the frozen module.
    pub visible_methods: Vec<String>,
    /// Root methods removed by the freeze.
    pub dropped_methods: Vec<String>,
    pub modules_retained: usize,
    pub classes_created: usize,
    pub classes_specialized: usize,
    pub alias_sets: usize,
    pub iterations: usize,
}

/// The frozen root, living in the same [`Store`] as the original.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrozenModule {
    root: ModuleId,
    summary: FreezeSummary,
}

impl FrozenModule {
    pub(crate) fn new(root: ModuleId, summary: FreezeSummary) -> Self {
        Self { root, summary }
    }

    pub fn root(&self) -> ModuleId {
        self.root
    }

    pub fn summary(&self) -> &FreezeSummary {
        &self.summary
    }

    /// Whether the frozen root still has attribute `name`. Folded
    /// attributes are gone; `training` is never an attribute.
    pub fn hasattr(&self, store: &Store, name: &str) -> bool {
        store.hasattr(self.root, name)
    }

    /// Follows a dotted path of module-valued attributes, e.g. `sub2.sub`.
    pub fn submodule(&self, store: &Store, path: &str) -> Option<ModuleId> {
        path.split('.')
            .filter(|part| !part.is_empty())
            .try_fold(self.root, |module, name| store.attr(module, name)?.as_module())
    }

    /// Value of a dotted attribute path, e.g. `sub.a`.
    pub fn attr<'s>(&self, store: &'s Store, path: &str) -> Option<&'s Value> {
        let (module, name) = match path.rsplit_once('.') {
            Some((prefix, name)) => (self.submodule(store, prefix)?, name),
            None => (self.root, path),
        };
        store.attr(module, name)
    }

    pub fn call(&self, store: &mut Store, method: &str, args: Vec<Value>) -> Result<Value, EvalError> {
        store.call(self.root, method, args)
    }

    pub fn forward(&self, store: &mut Store, args: Vec<Value>) -> Result<Value, EvalError> {
        self.call(store, "forward", args)
    }

    pub fn method_graph<'s>(&self, store: &'s Store, method: &str) -> Option<&'s Graph> {
        store.class_of(self.root).ok()?.method(method)
    }

    pub fn class_name<'s>(&self, store: &'s Store) -> Option<&'s str> {
        store.class_of(self.root).ok().map(|c| c.name.as_str())
    }
}
