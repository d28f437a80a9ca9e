//! Frozen tree construction and class specialization
//!
//! Copies every retained module into new arena records bound to new class
//! descriptors. Instances of one original class that end up with the same
//! retained attributes and methods share one narrowed descriptor; diverging
//! instances each get their own, the first keeping the class name and later
//! ones a numbered suffix. Original modules and classes are never touched.

use super::resolver::PreservedSet;
use crate::dataflow::{SlotId, SlotTable};
use crate::error::FreezeError;
use crate::ir::Graph;
use crate::module::{AttrType, ClassId, ClassType, Module, ModuleId, Owner, Slot};
use crate::store::Store;
use crate::value::Value;
use indexmap::{IndexMap, IndexSet};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Result of building the frozen tree.
#[derive(Debug, Clone)]
pub struct SpecializedTree {
    pub root: ModuleId,
    /// Original module to its frozen copy.
    pub copies: IndexMap<ModuleId, ModuleId>,
    pub classes_created: usize,
    /// Original classes split into more than one descriptor.
    pub classes_specialized: usize,
}

#[derive(Debug, Clone, PartialEq)]
struct Signature {
    attributes: Vec<(String, AttrType)>,
    methods: IndexMap<String, Graph>,
}

pub struct ClassTypeSpecializer<'a> {
    store: &'a mut Store,
    slots: &'a SlotTable,
    preserved: &'a PreservedSet,
    referenced: &'a IndexSet<SlotId>,
    rewritten: &'a IndexMap<ModuleId, IndexMap<String, Graph>>,
    escaped: &'a IndexSet<ModuleId>,
}

impl<'a> ClassTypeSpecializer<'a> {
    pub fn new(
        store: &'a mut Store,
        slots: &'a SlotTable,
        preserved: &'a PreservedSet,
        referenced: &'a IndexSet<SlotId>,
        rewritten: &'a IndexMap<ModuleId, IndexMap<String, Graph>>,
        escaped: &'a IndexSet<ModuleId>,
    ) -> Self {
        Self {
            store,
            slots,
            preserved,
            referenced,
            rewritten,
            escaped,
        }
    }

    fn keeps(&self, slot: SlotId) -> bool {
        self.preserved.contains(slot) || self.referenced.contains(&slot)
    }

    /// Retained modules in breadth-first order with their kept slot names,
    /// and the first retained module referencing each of them.
    fn retained(&self, root: ModuleId) -> Result<(IndexMap<ModuleId, Vec<String>>, HashMap<ModuleId, Owner>), FreezeError> {
        let mut kept: IndexMap<ModuleId, Vec<String>> = IndexMap::new();
        let mut first_ref = HashMap::new();
        let mut queue = VecDeque::from([root]);
        while let Some(id) = queue.pop_front() {
            if kept.contains_key(&id) {
                continue;
            }
            let module = self.store.module(id)?;
            let mut names = Vec::new();
            for (name, slot) in &module.slots {
                let Some(slot_id) = self.slots.get(id, name) else { continue };
                if !self.keeps(slot_id) {
                    continue;
                }
                if let Value::Module(child) = slot.value {
                    first_ref.entry(child).or_insert_with(|| Owner {
                        module: id,
                        slot: name.clone(),
                    });
                    queue.push_back(child);
                }
                names.push(name.clone());
            }
            kept.insert(id, names);
        }
        Ok((kept, first_ref))
    }

    fn visible_methods(&self, module: ModuleId) -> Result<IndexMap<String, Graph>, FreezeError> {
        let mut methods = IndexMap::new();
        if self.escaped.contains(&module) {
            methods.extend(self.store.class_of(module)?.methods.clone());
        }
        if let Some(rewritten) = self.rewritten.get(&module) {
            for (name, graph) in rewritten {
                methods.insert(name.clone(), graph.clone());
            }
        }
        Ok(methods)
    }

    pub fn build(self, root: ModuleId) -> Result<SpecializedTree, FreezeError> {
        let (kept, first_ref) = self.retained(root)?;
        let base = self.store.module_count() as u32;
        let copies: IndexMap<ModuleId, ModuleId> = kept
            .keys()
            .enumerate()
            .map(|(i, m)| (*m, ModuleId(base + i as u32)))
            .collect();

        // group by originating class; the root is always alone
        let mut signatures: IndexMap<ModuleId, Signature> = IndexMap::new();
        for (module, names) in &kept {
            let class = self.store.class_of(*module)?;
            let attributes = class
                .attributes
                .iter()
                .filter(|(name, _)| names.contains(name))
                .map(|(name, ty)| (name.clone(), ty.clone()))
                .collect();
            signatures.insert(
                *module,
                Signature {
                    attributes,
                    methods: self.visible_methods(*module)?,
                },
            );
        }

        // the root's descriptor is never shared, so it carries no signature
        let mut descriptors: IndexMap<ClassId, Vec<(Option<Signature>, ClassId)>> = IndexMap::new();
        let mut bound: HashMap<ModuleId, ClassId> = HashMap::new();
        let mut created = 0;
        for (module, signature) in &signatures {
            let original = self.store.module(*module)?.class;
            let group = descriptors.entry(original).or_default();
            let existing = group
                .iter()
                .find(|(sig, _)| sig.as_ref() == Some(signature) && *module != root)
                .map(|(_, id)| *id);
            let class_id = match existing {
                Some(id) => id,
                None => {
                    let name = self.store.class(original)?.name.clone();
                    let name = if group.is_empty() {
                        name
                    } else {
                        format!("{name}.{}", group.len())
                    };
                    let mut class = ClassType::new(name);
                    for (attr, ty) in &signature.attributes {
                        class.attributes.insert(attr.clone(), ty.clone());
                    }
                    class.methods = signature.methods.clone();
                    let id = self.store.define_class(class);
                    created += 1;
                    let shared = (*module != root).then(|| signature.clone());
                    group.push((shared, id));
                    id
                }
            };
            bound.insert(*module, class_id);
        }
        let specialized = descriptors.values().filter(|group| group.len() > 1).count();

        for (module, names) in &kept {
            let original = self.store.module(*module)?.clone();
            let class = bound
                .get(module)
                .copied()
                .ok_or_else(|| FreezeError::Malformed(format!("no class bound for {module}")))?;
            let mut slots = IndexMap::new();
            for name in names {
                let Some(slot) = original.slots.get(name) else { continue };
                let value = match &slot.value {
                    Value::Module(child) => Value::Module(copies.get(child).copied().unwrap_or(*child)),
                    other => other.clone(),
                };
                slots.insert(
                    name.clone(),
                    Slot {
                        ty: slot.ty.clone(),
                        value,
                        mutable: slot.mutable,
                    },
                );
            }
            let owner = if *module == root {
                None
            } else {
                original
                    .owner
                    .filter(|o| kept.get(&o.module).is_some_and(|names| names.contains(&o.slot)))
                    .or_else(|| first_ref.get(module).cloned())
                    .map(|o| Owner {
                        module: copies.get(&o.module).copied().unwrap_or(o.module),
                        slot: o.slot,
                    })
            };
            self.store.push_module(Module {
                name: original.name.clone(),
                class,
                slots,
                training: false,
                owner,
            });
        }

        let frozen_root = copies
            .get(&root)
            .copied()
            .ok_or_else(|| FreezeError::Malformed("root was not retained".to_string()))?;
        debug!(
            modules = copies.len(),
            classes = created,
            specialized,
            "frozen tree built"
        );
        Ok(SpecializedTree {
            root: frozen_root,
            copies,
            classes_created: created,
            classes_specialized: specialized,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freeze::resolver::PreserveReason;

    #[test]
    fn test_diverging_instances_get_numbered_classes() {
        let mut store = Store::new();
        let leaf = store.define_class(
            ClassType::new("Leaf")
                .with_attr("a", AttrType::Int)
                .with_attr("b", AttrType::Int),
        );
        let parent = store.define_class(
            ClassType::new("Parent")
                .with_attr("x", AttrType::Module)
                .with_attr("y", AttrType::Module)
                .with_attr("z", AttrType::Module),
        );
        let root = store.instantiate(parent, "root").unwrap();
        let mut children = Vec::new();
        for name in ["x", "y", "z"] {
            let child = store.instantiate(leaf, name).unwrap();
            store.set_attr(child, "a", Value::Int(1)).unwrap();
            store.set_attr(child, "b", Value::Int(2)).unwrap();
            store.add_submodule(root, name, child).unwrap();
            children.push(child);
        }

        let slots = SlotTable::build(&store, root);
        let mut preserved = PreservedSet::default();
        for name in ["x", "y", "z"] {
            preserved.insert(slots.get(root, name).unwrap(), PreserveReason::UserRequested);
        }
        // x and z keep a, y keeps b
        preserved.insert(slots.get(children[0], "a").unwrap(), PreserveReason::Mutated);
        preserved.insert(slots.get(children[1], "b").unwrap(), PreserveReason::Mutated);
        preserved.insert(slots.get(children[2], "a").unwrap(), PreserveReason::Mutated);

        let (referenced, rewritten, escaped) = (IndexSet::new(), IndexMap::new(), IndexSet::new());
        let tree = ClassTypeSpecializer::new(&mut store, &slots, &preserved, &referenced, &rewritten, &escaped)
            .build(root)
            .unwrap();

        let class_name = |m: ModuleId| store.class_of(m).unwrap().name.clone();
        let x = tree.copies[&children[0]];
        let y = tree.copies[&children[1]];
        let z = tree.copies[&children[2]];
        assert_eq!(class_name(x), "Leaf");
        assert_eq!(class_name(y), "Leaf.1");
        assert_eq!(store.module(x).unwrap().class, store.module(z).unwrap().class);
        assert_eq!(tree.classes_specialized, 1);
        assert!(!store.hasattr(x, "b"));
        assert!(store.hasattr(y, "b"));
        assert_eq!(store.module(y).unwrap().owner.as_ref().unwrap().module, tree.root);
        // originals untouched
        assert!(store.hasattr(children[1], "a"));
        assert!(store.module(children[0]).unwrap().training);
    }
}
