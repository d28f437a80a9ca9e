//! Module arena
//!
//! The [`Store`] owns every module, class descriptor, free function and heap
//! storage. Modules refer to each other by [`ModuleId`], so aliasing a
//! sub-module is an id copy and "same instance" is an id comparison.

use crate::error::{EvalError, StoreError};
use crate::interp::Interpreter;
use crate::ir::Graph;
use crate::module::{ClassId, ClassType, Module, ModuleId, Owner, Slot};
use crate::value::{Heap, Literal, Value};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Store {
    pub heap: Heap,
    classes: Vec<ClassType>,
    modules: Vec<Module>,
    functions: IndexMap<String, Graph>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define_class(&mut self, class: ClassType) -> ClassId {
        let id = ClassId(self.classes.len() as u32);
        self.classes.push(class);
        id
    }

    pub fn class(&self, id: ClassId) -> Result<&ClassType, StoreError> {
        self.classes.get(id.0 as usize).ok_or(StoreError::UnknownClass(id.0))
    }

    pub fn classes(&self) -> impl Iterator<Item = (ClassId, &ClassType)> + '_ {
        self.classes
            .iter()
            .enumerate()
            .map(|(i, c)| (ClassId(i as u32), c))
    }

    pub fn define_function(&mut self, name: &str, graph: Graph) {
        self.functions.insert(name.to_string(), graph);
    }

    pub fn function(&self, name: &str) -> Option<&Graph> {
        self.functions.get(name)
    }

    pub(crate) fn function_index(&self, name: &str) -> Option<u32> {
        self.functions.get_index_of(name).map(|i| i as u32)
    }

    pub fn functions(&self) -> impl Iterator<Item = (&str, &Graph)> + '_ {
        self.functions.iter().map(|(name, graph)| (name.as_str(), graph))
    }

    /// Creates a module with no slots set. New modules start in training
    /// mode; call [`eval`](Self::eval) before freezing.
    pub fn instantiate(&mut self, class: ClassId, name: &str) -> Result<ModuleId, StoreError> {
        self.class(class)?;
        let id = ModuleId(self.modules.len() as u32);
        self.modules.push(Module {
            name: name.to_string(),
            class,
            slots: IndexMap::new(),
            training: true,
            owner: None,
        });
        Ok(id)
    }

    pub(crate) fn push_module(&mut self, module: Module) -> ModuleId {
        let id = ModuleId(self.modules.len() as u32);
        self.modules.push(module);
        id
    }

    pub fn module(&self, id: ModuleId) -> Result<&Module, StoreError> {
        self.modules.get(id.0 as usize).ok_or(StoreError::UnknownModule(id.0))
    }

    pub(crate) fn module_mut(&mut self, id: ModuleId) -> Result<&mut Module, StoreError> {
        self.modules.get_mut(id.0 as usize).ok_or(StoreError::UnknownModule(id.0))
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// First module with the given name and no owner.
    pub fn find_root(&self, name: &str) -> Option<ModuleId> {
        self.modules
            .iter()
            .position(|m| m.name == name && m.owner.is_none())
            .map(|i| ModuleId(i as u32))
    }

    pub fn class_of(&self, id: ModuleId) -> Result<&ClassType, StoreError> {
        let class = self.module(id)?.class;
        self.class(class)
    }

    /// Sets a declared attribute. Module values are stored as references;
    /// use [`add_submodule`](Self::add_submodule) to also take ownership.
    pub fn set_attr(&mut self, module: ModuleId, name: &str, value: Value) -> Result<(), StoreError> {
        let class = self.class_of(module)?;
        let ty = class
            .attributes
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::UndeclaredAttribute {
                class: class.name.clone(),
                name: name.to_string(),
            })?;
        if !ty.admits(&value) {
            return Err(StoreError::AttributeType {
                class: class.name.clone(),
                name: name.to_string(),
                expected: ty.to_string(),
                found: value.kind().to_string(),
            });
        }
        if let Value::Module(target) = &value {
            self.module(*target)?;
        }
        let mutable = value.is_mutable();
        self.module_mut(module)?
            .slots
            .insert(name.to_string(), Slot { ty, value, mutable });
        Ok(())
    }

    /// Allocates `literal` on the heap and stores it in the attribute.
    pub fn set_literal(&mut self, module: ModuleId, name: &str, literal: &Literal) -> Result<Value, StoreError> {
        let value = self.heap.alloc_literal(literal);
        self.set_attr(module, name, value.clone())?;
        Ok(value)
    }

    /// Stores `child` in `parent.name` and makes `parent` its owner.
    pub fn add_submodule(&mut self, parent: ModuleId, name: &str, child: ModuleId) -> Result<(), StoreError> {
        let child_module = self.module(child)?;
        if let Some(owner) = &child_module.owner {
            return Err(StoreError::AlreadyOwned {
                child: child_module.name.clone(),
                owner: self.module(owner.module)?.name.clone(),
            });
        }
        if parent == child || self.ancestors(parent).contains(&child) {
            return Err(StoreError::OwnershipCycle {
                parent: self.module(parent)?.name.clone(),
                child: child_module.name.clone(),
            });
        }
        self.set_attr(parent, name, Value::Module(child))?;
        self.module_mut(child)?.owner = Some(Owner {
            module: parent,
            slot: name.to_string(),
        });
        Ok(())
    }

    /// Stores a non-owning reference to `target` in `parent.name`.
    pub fn alias_submodule(&mut self, parent: ModuleId, name: &str, target: ModuleId) -> Result<(), StoreError> {
        self.set_attr(parent, name, Value::Module(target))
    }

    pub fn attr(&self, module: ModuleId, name: &str) -> Option<&Value> {
        self.modules
            .get(module.0 as usize)
            .and_then(|m| m.slots.get(name))
            .map(|slot| &slot.value)
    }

    pub fn hasattr(&self, module: ModuleId, name: &str) -> bool {
        self.attr(module, name).is_some()
    }

    pub fn method(&self, module: ModuleId, name: &str) -> Result<&Graph, EvalError> {
        let class = self.class_of(module)?;
        class.method(name).ok_or_else(|| EvalError::MissingMethod {
            class: class.name.clone(),
            method: name.to_string(),
        })
    }

    /// Owner chain of `module`, nearest first. Does not include `module`.
    pub fn ancestors(&self, module: ModuleId) -> Vec<ModuleId> {
        let mut chain = Vec::new();
        let mut current = module;
        while let Some(owner) = self.modules.get(current.0 as usize).and_then(|m| m.owner.as_ref()) {
            if owner.module == module || chain.contains(&owner.module) {
                break;
            }
            chain.push(owner.module);
            current = owner.module;
        }
        chain
    }

    /// Dotted path of slot names from the topmost owner down to `module`.
    pub fn path_of(&self, module: ModuleId) -> String {
        let mut names = Vec::new();
        let mut current = module;
        for ancestor in self.ancestors(module) {
            if let Some(owner) = self.modules.get(current.0 as usize).and_then(|m| m.owner.as_ref()) {
                names.push(owner.slot.clone());
            }
            current = ancestor;
        }
        if names.is_empty() {
            return self
                .modules
                .get(module.0 as usize)
                .map(|m| m.name.clone())
                .unwrap_or_default();
        }
        names.reverse();
        names.join(".")
    }

    /// `root` and every module reachable from it through module-valued
    /// slots, owned or aliased, in breadth-first order.
    pub fn reachable_modules(&self, root: ModuleId) -> Vec<ModuleId> {
        let mut seen = IndexSet::new();
        let mut queue = VecDeque::from([root]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            if let Ok(module) = self.module(id) {
                queue.extend(module.submodules().map(|(_, child)| child));
            }
        }
        seen.into_iter().collect()
    }

    fn set_training(&mut self, root: ModuleId, training: bool) -> Result<(), StoreError> {
        for id in self.reachable_modules(root) {
            self.module_mut(id)?.training = training;
        }
        Ok(())
    }

    /// Puts `root` and everything reachable from it in inference mode.
    pub fn eval(&mut self, root: ModuleId) -> Result<(), StoreError> {
        self.set_training(root, false)
    }

    pub fn train(&mut self, root: ModuleId) -> Result<(), StoreError> {
        self.set_training(root, true)
    }

    /// Runs `method` on `module` with the reference interpreter.
    pub fn call(&mut self, module: ModuleId, method: &str, args: Vec<Value>) -> Result<Value, EvalError> {
        Interpreter::new(self).call_method(module, method, args)
    }

    pub fn forward(&mut self, module: ModuleId, args: Vec<Value>) -> Result<Value, EvalError> {
        self.call(module, "forward", args)
    }
}
