//! Freeze metrics
//!
//! Size of a module tree before and after freezing: modules, attribute
//! slots, class descriptors and method-graph instructions.

use anyhow::{Context, Result};
use indexmap::IndexSet;
use modfreeze_core::{FrozenModule, ModuleId, Op, Store};
use serde::{Deserialize, Serialize};

/// Counts over every module reachable from one root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeMetrics {
    pub modules: usize,
    pub slots: usize,
    pub classes: usize,
    pub methods: usize,
    pub instructions: usize,
    pub attribute_reads: usize,
}

impl TreeMetrics {
    /// Measures the tree under `root`. Methods are counted once per class
    /// descriptor, not once per instance.
    pub fn measure(store: &Store, root: ModuleId) -> Result<Self> {
        let mut metrics = TreeMetrics::default();
        let mut classes = IndexSet::new();
        for module in store.reachable_modules(root) {
            let record = store.module(module).with_context(|| format!("measuring module {module}"))?;
            metrics.modules += 1;
            metrics.slots += record.slots.len();
            if !classes.insert(record.class) {
                continue;
            }
            let class = store.class(record.class)?;
            for graph in class.methods.values() {
                metrics.methods += 1;
                metrics.instructions += graph.instr_count();
                metrics.attribute_reads += graph.count_ops(|op| matches!(op, Op::GetAttr { .. }));
            }
        }
        metrics.classes = classes.len();
        Ok(metrics)
    }
}

/// One root method, before and after.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodMetrics {
    pub name: String,
    pub instructions_before: usize,
    /// `None` when the method was dropped.
    pub instructions_after: Option<usize>,
    pub attribute_reads_before: usize,
    pub attribute_reads_after: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreezeMetrics {
    pub before: TreeMetrics,
    pub after: TreeMetrics,
    pub methods: Vec<MethodMetrics>,
    pub folded_attributes: usize,
    pub preserved_attributes: usize,
}

impl FreezeMetrics {
    /// Fraction of attribute slots removed, in `[0, 1]`.
    pub fn slot_reduction(&self) -> f64 {
        reduction(self.before.slots, self.after.slots)
    }

    pub fn instruction_reduction(&self) -> f64 {
        reduction(self.before.instructions, self.after.instructions)
    }

    pub fn dropped_methods(&self) -> impl Iterator<Item = &str> + '_ {
        self.methods
            .iter()
            .filter(|m| m.instructions_after.is_none())
            .map(|m| m.name.as_str())
    }
}

fn reduction(before: usize, after: usize) -> f64 {
    if before == 0 {
        return 0.0;
    }
    before.saturating_sub(after) as f64 / before as f64
}

/// Compares an original tree with its frozen counterpart in the same store.
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    pub fn collect(&self, store: &Store, original: ModuleId, frozen: &FrozenModule) -> Result<FreezeMetrics> {
        let before = TreeMetrics::measure(store, original)?;
        let after = TreeMetrics::measure(store, frozen.root())?;

        let original_class = store.class_of(original)?;
        let frozen_class = store.class_of(frozen.root())?;
        let methods = original_class
            .methods
            .iter()
            .map(|(name, graph)| {
                let after = frozen_class.method(name);
                MethodMetrics {
                    name: name.clone(),
                    instructions_before: graph.instr_count(),
                    instructions_after: after.map(|g| g.instr_count()),
                    attribute_reads_before: graph.attribute_reads().len(),
                    attribute_reads_after: after.map(|g| g.attribute_reads().len()),
                }
            })
            .collect();

        let summary = frozen.summary();
        Ok(FreezeMetrics {
            before,
            after,
            methods,
            folded_attributes: summary.folded.len(),
            preserved_attributes: summary.preserved.len(),
        })
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
