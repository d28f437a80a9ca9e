//! Modules, class types and attribute slots

use crate::ir::Graph;
use crate::value::Value;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId(pub u32);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClassId(pub u32);

/// Declared type of an attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrType {
    Any,
    Bool,
    Int,
    Float,
    Str,
    List,
    Dict,
    Tuple,
    Tensor,
    Module,
}

impl AttrType {
    pub fn admits(&self, value: &Value) -> bool {
        match (self, value) {
            (AttrType::Any, _) => true,
            // optional attributes are allowed to hold None
            (_, Value::None) => !matches!(self, AttrType::Module),
            (AttrType::Bool, Value::Bool(_)) => true,
            (AttrType::Int, Value::Int(_)) => true,
            (AttrType::Float, Value::Float(_) | Value::Int(_)) => true,
            (AttrType::Str, Value::Str(_)) => true,
            (AttrType::List, Value::List(_)) => true,
            (AttrType::Dict, Value::Dict(_)) => true,
            (AttrType::Tuple, Value::Tuple(_)) => true,
            (AttrType::Tensor, Value::Tensor(_)) => true,
            (AttrType::Module, Value::Module(_)) => true,
            _ => false,
        }
    }

    /// Narrowest declared type for a value.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Bool(_) => AttrType::Bool,
            Value::Int(_) => AttrType::Int,
            Value::Float(_) => AttrType::Float,
            Value::Str(_) => AttrType::Str,
            Value::List(_) => AttrType::List,
            Value::Dict(_) => AttrType::Dict,
            Value::Tuple(_) => AttrType::Tuple,
            Value::Tensor(_) => AttrType::Tensor,
            Value::Module(_) => AttrType::Module,
            Value::None | Value::Future(_) => AttrType::Any,
        }
    }
}

impl fmt::Display for AttrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Shared schema of a family of modules. Immutable once registered in a
/// store; freezing creates new descriptors instead of editing these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassType {
    pub name: String,
    pub attributes: IndexMap<String, AttrType>,
    pub methods: IndexMap<String, Graph>,
}

impl ClassType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: IndexMap::new(),
            methods: IndexMap::new(),
        }
    }

    pub fn with_attr(mut self, name: &str, ty: AttrType) -> Self {
        self.attributes.insert(name.to_string(), ty);
        self
    }

    pub fn with_method(mut self, name: &str, graph: Graph) -> Self {
        self.methods.insert(name.to_string(), graph);
        self
    }

    pub fn method(&self, name: &str) -> Option<&Graph> {
        self.methods.get(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    pub ty: AttrType,
    pub value: Value,
    /// Whether the value carries mutable storage.
    pub mutable: bool,
}

/// Exclusive ownership edge: `module` holds this module in slot `slot`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub module: ModuleId,
    pub slot: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub class: ClassId,
    pub slots: IndexMap<String, Slot>,
    pub training: bool,
    pub owner: Option<Owner>,
}

impl Module {
    pub fn slot(&self, name: &str) -> Option<&Slot> {
        self.slots.get(name)
    }

    /// Sub-module references held by this module, in slot order.
    pub fn submodules(&self) -> impl Iterator<Item = (&str, ModuleId)> + '_ {
        self.slots
            .iter()
            .filter_map(|(name, slot)| slot.value.as_module().map(|m| (name.as_str(), m)))
    }
}
