//! Module freezing
//!
//! The pipeline runs in fixed stages over a snapshot of the source tree:
//! - training gate and preserved-name validation
//! - mutation detection over every kept entry method
//! - self-return check
//! - alias sets, preserved-set resolution and overlap check
//! - graph rewriting (inlining, folding, simplification)
//! - class specialization into a new frozen tree
//!
//! Every stage before the last two is read-only, and any error leaves the
//! store without a partially frozen tree.

pub mod alias;
mod frozen;
pub mod resolver;
pub mod rewriter;
pub mod simplify;
pub mod specialize;

pub use alias::AliasAnalysis;
pub use frozen::{FreezeSummary, FrozenModule, PreservedAttr};
pub use resolver::{PreserveReason, PreservedSet, PreservedSetResolver};
pub use rewriter::{GraphRewriter, Rewrite};
pub use specialize::{ClassTypeSpecializer, SpecializedTree};

use crate::dataflow::{Entry, MutationDetector, MutationFacts, SlotId, SlotTable};
use crate::error::FreezeError;
use crate::module::ModuleId;
use crate::options::FreezeOptions;
use crate::store::Store;
use indexmap::IndexSet;
use tracing::{debug, info, warn};

/// Root attributes and methods named by a freeze request.
#[derive(Debug, Clone, Default)]
struct PreservedNames {
    attrs: Vec<SlotId>,
    methods: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FreezePipeline;

impl FreezePipeline {
    pub fn new() -> Self {
        Self
    }

    /// Freezes `root` into a new module tree in the same store.
    pub fn freeze(&self, store: &mut Store, root: ModuleId, options: &FreezeOptions) -> Result<FrozenModule, FreezeError> {
        info!(root = %store.path_of(root), entry = options.entry.as_str(), "freezing module");

        check_inference_mode(store, root)?;
        let slots = SlotTable::build(store, root);
        let names = resolve_names(store, &slots, root, options)?;
        let entries = kept_entries(store, root, &names, options)?;
        debug!(slots = slots.len(), entries = entries.len(), "freeze request resolved");

        let facts = MutationDetector::new(store, &slots, options.max_iterations).run(&entries)?;
        if !facts.converged {
            return Err(FreezeError::Malformed(format!(
                "mutation analysis did not converge within {} passes",
                options.max_iterations
            )));
        }
        facts.call_graph.check_acyclic(store)?;
        // a returned module is callable after freezing, and so is everything below it
        let escaped: IndexSet<ModuleId> = check_self_return(store, &facts)?
            .into_iter()
            .flat_map(|module| slots.subtree(store, module))
            .collect();

        let alias = AliasAnalysis::compute(store, &slots, &facts);
        let root_entry = entries.iter().find(|(m, method)| *m == root && *method == options.entry);
        let escaped_list: Vec<ModuleId> = escaped.iter().copied().collect();
        let preserved =
            PreservedSetResolver::new(store, &slots, &facts, &alias).resolve(root_entry, &names.attrs, &escaped_list);
        alias.check_overlaps(&slots, &preserved, &facts)?;

        let rewrite = GraphRewriter::new(store, &slots, &preserved, &facts, options.simplify).rewrite(&entries)?;
        let tree = ClassTypeSpecializer::new(
            store,
            &slots,
            &preserved,
            &rewrite.referenced,
            &rewrite.methods,
            &escaped,
        )
        .build(root)?;

        let summary = summarize(store, root, &slots, &facts, &alias, &preserved, &rewrite, &tree)?;
        info!(
            folded = summary.folded.len(),
            preserved = summary.preserved.len(),
            dropped = summary.dropped_methods.len(),
            classes = summary.classes_created,
            "module frozen"
        );
        Ok(FrozenModule::new(tree.root, summary))
    }
}

/// Freezes `root` with default options and the given preserved names.
pub fn freeze(
    store: &mut Store,
    root: ModuleId,
    preserved_attrs: &[&str],
    preserved_methods: &[&str],
) -> Result<FrozenModule, FreezeError> {
    let options = FreezeOptions::default()
        .with_preserved_attrs(preserved_attrs.iter().copied())
        .with_preserved_methods(preserved_methods.iter().copied());
    FreezePipeline::new().freeze(store, root, &options)
}

fn check_inference_mode(store: &Store, root: ModuleId) -> Result<(), FreezeError> {
    store.module(root)?;
    for module in store.reachable_modules(root) {
        if store.module(module)?.training {
            return Err(FreezeError::TrainingMode {
                module: store.path_of(module),
            });
        }
    }
    Ok(())
}

/// Resolves user-preserved names against the root's attributes first,
/// then its methods.
fn resolve_names(
    store: &Store,
    slots: &SlotTable,
    root: ModuleId,
    options: &FreezeOptions,
) -> Result<PreservedNames, FreezeError> {
    let class = store.class_of(root)?;
    let mut names = PreservedNames::default();
    for name in options.preserved_attrs.iter().chain(&options.preserved_methods) {
        if let Some(slot) = slots.get(root, name) {
            if !names.attrs.contains(&slot) {
                names.attrs.push(slot);
            }
        } else if class.methods.contains_key(name) {
            if !names.methods.contains(name) {
                names.methods.push(name.clone());
            }
        } else {
            return Err(FreezeError::UnknownPreservedName(name.clone()));
        }
    }
    Ok(names)
}

/// The root entry, user-preserved methods, and `forward` of every
/// user-preserved sub-module.
fn kept_entries(
    store: &Store,
    root: ModuleId,
    names: &PreservedNames,
    options: &FreezeOptions,
) -> Result<Vec<Entry>, FreezeError> {
    let mut entries: IndexSet<Entry> = IndexSet::new();
    if store.class_of(root)?.methods.contains_key(&options.entry) {
        entries.insert((root, options.entry.clone()));
    } else {
        warn!(entry = options.entry.as_str(), "root has no entry method");
    }
    for method in &names.methods {
        entries.insert((root, method.clone()));
    }
    for name in store.module(root)?.slots.keys() {
        let requested = options.preserved_attrs.contains(name) || options.preserved_methods.contains(name);
        let Some(child) = store.attr(root, name).and_then(|v| v.as_module()) else { continue };
        if requested && store.class_of(child)?.methods.contains_key("forward") {
            entries.insert((child, "forward".to_string()));
        }
    }
    Ok(entries.into_iter().collect())
}

/// Rejects entries returning their own module or an ancestor, and returns
/// the descendant modules handed back to callers.
fn check_self_return(store: &Store, facts: &MutationFacts) -> Result<IndexSet<ModuleId>, FreezeError> {
    let mut escaped = IndexSet::new();
    for ((module, method), entry) in &facts.entries {
        let mut forbidden = store.ancestors(*module);
        forbidden.push(*module);
        for returned in &entry.returned_modules {
            if forbidden.contains(returned) {
                return Err(FreezeError::SelfReturn {
                    module: store.path_of(*module),
                    method: method.clone(),
                    returned: store.path_of(*returned),
                });
            }
            escaped.insert(*returned);
        }
    }
    Ok(escaped)
}

#[allow(clippy::too_many_arguments)]
fn summarize(
    store: &Store,
    root: ModuleId,
    slots: &SlotTable,
    facts: &MutationFacts,
    alias: &AliasAnalysis,
    preserved: &PreservedSet,
    rewrite: &Rewrite,
    tree: &SpecializedTree,
) -> Result<FreezeSummary, FreezeError> {
    let folded = rewrite
        .folded
        .iter()
        .filter(|slot| !preserved.contains(**slot))
        .map(|slot| slots.path(*slot).to_string())
        .collect();
    let preserved_attrs = preserved
        .iter()
        .map(|(slot, reason)| PreservedAttr {
            path: slots.path(slot).to_string(),
            reason,
        })
        .collect();
    let visible: Vec<String> = store.class_of(tree.root)?.methods.keys().cloned().collect();
    let dropped = store
        .class_of(root)?
        .methods
        .keys()
        .filter(|name| !visible.contains(name))
        .cloned()
        .collect();
    Ok(FreezeSummary {
        folded,
        preserved: preserved_attrs,
        visible_methods: visible,
        dropped_methods: dropped,
        modules_retained: tree.copies.len(),
        classes_created: tree.classes_created,
        classes_specialized: tree.classes_specialized,
        alias_sets: alias.set_count(slots),
        iterations: facts.iterations,
    })
}
