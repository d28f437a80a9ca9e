//! Preserved-set resolution
//!
//! Combines the default pinning rules (mutation, escape, aliasing, shared
//! written storage) with user requests and the reads of every kept method
//! other than the entry. Iterates until no slot is added.

use super::alias::AliasAnalysis;
use crate::dataflow::{Entry, MutationFacts, SlotId, SlotTable};
use crate::module::ModuleId;
use crate::store::Store;
use crate::value::StorageId;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, trace};

/// Why a slot keeps its live value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreserveReason {
    /// Assigned or written in place by reachable code.
    Mutated,
    /// Captured by or returned from a forked body.
    Forked,
    /// Stored by reference into another attribute or attribute container.
    Escaped,
    UserRequested,
    /// Read by a user-preserved method or sub-module.
    ReadByKeptMethod,
    /// Part of a sub-module returned to the caller.
    ReturnedModule,
    /// Shares its root storage with a preserved slot.
    Aliased,
    /// Holds storage that reachable code writes or lets escape.
    SharesWrittenStorage,
}

impl fmt::Display for PreserveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PreserveReason::Mutated => "mutated",
            PreserveReason::Forked => "forked",
            PreserveReason::Escaped => "escaped",
            PreserveReason::UserRequested => "user requested",
            PreserveReason::ReadByKeptMethod => "read by kept method",
            PreserveReason::ReturnedModule => "returned module",
            PreserveReason::Aliased => "aliased",
            PreserveReason::SharesWrittenStorage => "shares written storage",
        };
        f.write_str(text)
    }
}

/// Slots that keep their live value, with the first reason found.
#[derive(Debug, Clone, Default)]
pub struct PreservedSet {
    reasons: IndexMap<SlotId, PreserveReason>,
}

impl PreservedSet {
    /// Adds `slot`; true if it was not preserved yet.
    pub fn insert(&mut self, slot: SlotId, reason: PreserveReason) -> bool {
        if self.reasons.contains_key(&slot) {
            return false;
        }
        self.reasons.insert(slot, reason);
        true
    }

    pub fn contains(&self, slot: SlotId) -> bool {
        self.reasons.contains_key(&slot)
    }

    pub fn reason(&self, slot: SlotId) -> Option<PreserveReason> {
        self.reasons.get(&slot).copied()
    }

    pub fn slots(&self) -> impl Iterator<Item = SlotId> + '_ {
        self.reasons.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotId, PreserveReason)> + '_ {
        self.reasons.iter().map(|(s, r)| (*s, *r))
    }

    pub fn len(&self) -> usize {
        self.reasons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reasons.is_empty()
    }
}

pub struct PreservedSetResolver<'a> {
    store: &'a Store,
    slots: &'a SlotTable,
    facts: &'a MutationFacts,
    alias: &'a AliasAnalysis,
}

impl<'a> PreservedSetResolver<'a> {
    pub fn new(store: &'a Store, slots: &'a SlotTable, facts: &'a MutationFacts, alias: &'a AliasAnalysis) -> Self {
        Self {
            store,
            slots,
            facts,
            alias,
        }
    }

    /// `entry` is the root's entry method; reads of every other analyzed
    /// entry are preserved. `escaped` are descendant modules handed back to
    /// callers.
    pub fn resolve(&self, entry: Option<&Entry>, user_attrs: &[SlotId], escaped: &[ModuleId]) -> PreservedSet {
        let mut preserved = PreservedSet::default();

        for slot in self.slots.ids() {
            let effects = self.facts.effects(slot);
            if !effects.is_mutated(self.slots.info(slot).mutable) {
                continue;
            }
            let reason = if effects.forked {
                PreserveReason::Forked
            } else if effects.assigned || effects.root_written || effects.element_written {
                PreserveReason::Mutated
            } else {
                PreserveReason::Escaped
            };
            preserved.insert(slot, reason);
        }

        for slot in user_attrs {
            preserved.insert(*slot, PreserveReason::UserRequested);
        }

        for (kept, facts) in &self.facts.entries {
            if Some(kept) == entry {
                continue;
            }
            for slot in &facts.reads {
                preserved.insert(*slot, PreserveReason::ReadByKeptMethod);
            }
        }

        for module in escaped {
            for member in self.slots.subtree(self.store, *module) {
                for slot in self.slots.slots_of(member) {
                    preserved.insert(slot, PreserveReason::ReturnedModule);
                }
            }
        }

        let written = self.written_storage();
        let mut rounds = 0;
        loop {
            rounds += 1;
            let mut changed = false;

            for slot in self.slots.ids() {
                if preserved.contains(slot) || self.slots.info(slot).is_module {
                    continue;
                }
                if self.alias.footprint(slot).iter().any(|s| written.contains(s)) {
                    changed |= preserved.insert(slot, PreserveReason::SharesWrittenStorage);
                }
            }

            let current: Vec<SlotId> = preserved.slots().collect();
            for slot in current {
                if self.slots.info(slot).is_module {
                    continue;
                }
                for member in self.alias.members(self.slots, slot) {
                    if preserved.insert(member, PreserveReason::Aliased) {
                        trace!(slot = self.slots.path(member), via = self.slots.path(slot), "alias pinned");
                        changed = true;
                    }
                }
            }

            if !changed {
                break;
            }
        }

        debug!(preserved = preserved.len(), rounds, "preserved set resolved");
        preserved
    }

    /// Storage written at a slot's root, plus everything reachable from
    /// slots whose value crossed a fork or escaped by reference.
    fn written_storage(&self) -> IndexSet<StorageId> {
        let mut written = IndexSet::new();
        for slot in self.slots.ids() {
            let effects = self.facts.effects(slot);
            if effects.root_written {
                written.extend(self.alias.root_storages(slot).iter().copied());
            }
            if effects.forked || (effects.stored_elsewhere && self.slots.info(slot).mutable) {
                written.extend(self.alias.footprint(slot).iter().copied());
            }
        }
        written
    }
}
