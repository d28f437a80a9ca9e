//! Alias sets and storage footprints
//!
//! Two slots join one alias set when they hold the same root storage (the
//! same list or dict, or the same region of one tensor buffer) or when
//! method-time code assigns one slot's value into the other. Partial
//! overlap does not join sets; it is caught by [`AliasAnalysis::check_overlaps`].

use super::resolver::PreservedSet;
use crate::dataflow::{MutationFacts, SlotId, SlotTable};
use crate::error::FreezeError;
use crate::store::Store;
use crate::value::{StorageId, Value};
use indexmap::IndexSet;
use petgraph::unionfind::UnionFind;
use std::collections::HashMap;
use tracing::debug;

/// Identity of the storage a slot's value starts at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RootKey {
    Storage(StorageId),
    Region {
        storage: StorageId,
        offset: usize,
        numel: usize,
    },
}

fn root_key(value: &Value) -> Option<RootKey> {
    match value {
        Value::List(id) | Value::Dict(id) => Some(RootKey::Storage(*id)),
        Value::Tensor(view) => Some(RootKey::Region {
            storage: view.storage,
            offset: view.offset,
            numel: view.numel(),
        }),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct AliasAnalysis {
    sets: UnionFind<usize>,
    footprints: Vec<IndexSet<StorageId>>,
    roots: Vec<IndexSet<StorageId>>,
}

impl AliasAnalysis {
    pub fn compute(store: &Store, slots: &SlotTable, facts: &MutationFacts) -> Self {
        let mut sets = UnionFind::new(slots.len());
        let mut footprints = Vec::with_capacity(slots.len());
        let mut roots = Vec::with_capacity(slots.len());
        let mut first_holder: HashMap<RootKey, usize> = HashMap::new();

        for id in slots.ids() {
            let slot = slots.slot(id);
            let value = store.attr(slot.module, &slot.name);
            let mut footprint = IndexSet::new();
            let mut root = IndexSet::new();
            if let Some(value) = value {
                store.heap.footprint(value, &mut footprint);
                match value {
                    Value::List(s) | Value::Dict(s) => {
                        root.insert(*s);
                    }
                    Value::Tensor(view) => {
                        root.insert(view.storage);
                    }
                    _ => {}
                }
                if let Some(key) = root_key(value) {
                    let index = id.0 as usize;
                    let holder = *first_holder.entry(key).or_insert(index);
                    sets.union(holder, index);
                }
            }
            footprints.push(footprint);
            roots.push(root);
        }

        for (target, source) in &facts.assignments {
            if !slots.info(*target).is_module && !slots.info(*source).is_module {
                sets.union(target.0 as usize, source.0 as usize);
            }
        }

        let analysis = Self { sets, footprints, roots };
        debug!(slots = slots.len(), sets = analysis.set_count(slots), "alias sets computed");
        analysis
    }

    pub fn same_set(&self, a: SlotId, b: SlotId) -> bool {
        self.sets.equiv(a.0 as usize, b.0 as usize)
    }

    /// Every slot in `slot`'s alias set, including itself.
    pub fn members(&self, slots: &SlotTable, slot: SlotId) -> Vec<SlotId> {
        slots.ids().filter(|other| self.same_set(slot, *other)).collect()
    }

    pub fn set_count(&self, slots: &SlotTable) -> usize {
        slots
            .ids()
            .map(|id| self.sets.find(id.0 as usize))
            .collect::<IndexSet<_>>()
            .len()
    }

    /// Every storage reachable from the slot's value.
    pub fn footprint(&self, slot: SlotId) -> &IndexSet<StorageId> {
        &self.footprints[slot.0 as usize]
    }

    /// The storage the slot's value starts at, if it is heap-backed.
    pub fn root_storages(&self, slot: SlotId) -> &IndexSet<StorageId> {
        &self.roots[slot.0 as usize]
    }

    pub fn overlaps(&self, a: SlotId, b: SlotId) -> bool {
        let (fa, fb) = (self.footprint(a), self.footprint(b));
        fa.iter().any(|s| fb.contains(s))
    }

    /// Fails if a slot that will be folded shares storage with a preserved
    /// slot. Only slots some kept method reads are folded.
    pub fn check_overlaps(
        &self,
        slots: &SlotTable,
        preserved: &PreservedSet,
        facts: &MutationFacts,
    ) -> Result<(), FreezeError> {
        for folded in slots.ids() {
            if preserved.contains(folded) || slots.info(folded).is_module || !facts.effects(folded).read {
                continue;
            }
            let conflict = preserved
                .slots()
                .find(|kept| !slots.info(*kept).is_module && self.overlaps(folded, *kept));
            if let Some(kept) = conflict {
                return Err(FreezeError::OverlappingAttributes {
                    attribute: slots.path(folded).to_string(),
                    other: slots.path(kept).to_string(),
                });
            }
        }
        Ok(())
    }
}
