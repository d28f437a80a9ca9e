//! Abstract locations and per-slot effect facts

use crate::module::ModuleId;
use crate::store::Store;
use indexmap::IndexMap;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;

/// Index of an attribute slot in a [`SlotTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub u32);

/// Abstract allocation site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SiteId(pub u32);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotRef {
    pub module: ModuleId,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct SlotInfo {
    /// Dotted path from the freeze root, e.g. `sub2.sub.a`.
    pub path: String,
    pub is_module: bool,
    pub mutable: bool,
}

/// Every attribute slot of every module reachable from a root.
#[derive(Debug, Clone, Default)]
pub struct SlotTable {
    index: HashMap<SlotRef, SlotId>,
    refs: Vec<SlotRef>,
    infos: Vec<SlotInfo>,
    module_paths: IndexMap<ModuleId, String>,
}

impl SlotTable {
    pub fn build(store: &Store, root: ModuleId) -> Self {
        let mut table = Self::default();
        let mut queue = VecDeque::from([(root, String::new())]);
        while let Some((id, path)) = queue.pop_front() {
            if table.module_paths.contains_key(&id) {
                continue;
            }
            let Ok(module) = store.module(id) else { continue };
            table.module_paths.insert(id, path.clone());
            for (name, slot) in &module.slots {
                let slot_path = if path.is_empty() {
                    name.clone()
                } else {
                    format!("{path}.{name}")
                };
                if let Some(child) = slot.value.as_module() {
                    queue.push_back((child, slot_path.clone()));
                }
                let slot_ref = SlotRef {
                    module: id,
                    name: name.clone(),
                };
                table.index.insert(slot_ref.clone(), SlotId(table.refs.len() as u32));
                table.refs.push(slot_ref);
                table.infos.push(SlotInfo {
                    path: slot_path,
                    is_module: slot.value.as_module().is_some(),
                    mutable: slot.mutable,
                });
            }
        }
        table
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn get(&self, module: ModuleId, name: &str) -> Option<SlotId> {
        self.index
            .get(&SlotRef {
                module,
                name: name.to_string(),
            })
            .copied()
    }

    /// Slot ids are only minted by this table, so indexing cannot fail for
    /// ids obtained from it.
    pub fn slot(&self, id: SlotId) -> &SlotRef {
        &self.refs[id.0 as usize]
    }

    pub fn info(&self, id: SlotId) -> &SlotInfo {
        &self.infos[id.0 as usize]
    }

    pub fn path(&self, id: SlotId) -> &str {
        &self.info(id).path
    }

    pub fn ids(&self) -> impl Iterator<Item = SlotId> {
        (0..self.refs.len() as u32).map(SlotId)
    }

    pub fn slots_of(&self, module: ModuleId) -> Vec<SlotId> {
        self.refs
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.module == module)
            .map(|(i, _)| SlotId(i as u32))
            .collect()
    }

    pub fn modules(&self) -> impl Iterator<Item = ModuleId> + '_ {
        self.module_paths.keys().copied()
    }

    pub fn module_path(&self, module: ModuleId) -> Option<&str> {
        self.module_paths.get(&module).map(String::as_str)
    }

    /// Modules reachable from `module` through slots, including itself.
    pub fn subtree(&self, store: &Store, module: ModuleId) -> Vec<ModuleId> {
        store
            .reachable_modules(module)
            .into_iter()
            .filter(|m| self.module_paths.contains_key(m))
            .collect()
    }
}

/// Abstract location a runtime value may denote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Loc {
    Module(ModuleId),
    /// The value held by a slot.
    Root(SlotId),
    /// Anything nested inside the value held by a slot.
    Element(SlotId),
    Fresh(SiteId),
}

impl fmt::Display for Loc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Loc::Module(m) => write!(f, "{m}"),
            Loc::Root(s) => write!(f, "root(slot#{})", s.0),
            Loc::Element(s) => write!(f, "elem(slot#{})", s.0),
            Loc::Fresh(site) => write!(f, "fresh#{}", site.0),
        }
    }
}

pub type LocSet = BTreeSet<Loc>;

/// Unions `other` into `set`; true if `set` grew.
pub fn join(set: &mut LocSet, other: &LocSet) -> bool {
    let before = set.len();
    set.extend(other.iter().copied());
    set.len() != before
}

/// What reachable code does to one slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotEffects {
    pub read: bool,
    /// Target of an attribute-set.
    pub assigned: bool,
    /// The slot's own storage is written in place.
    pub root_written: bool,
    /// Storage nested inside the slot's value is written in place.
    pub element_written: bool,
    /// The value was stored into another attribute or attribute-held
    /// container.
    pub stored_elsewhere: bool,
    /// The value crossed a fork boundary.
    pub forked: bool,
}

impl SlotEffects {
    /// Directly mutated, given whether the slot holds mutable storage.
    pub fn is_mutated(&self, mutable: bool) -> bool {
        self.assigned
            || self.root_written
            || self.element_written
            || self.forked
            || (self.stored_elsewhere && mutable)
    }
}
