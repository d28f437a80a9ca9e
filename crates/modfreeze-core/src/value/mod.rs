//! Attribute values
//!
//! Values are a tagged variant with explicit per-variant sharing rules:
//! - scalars and tuples are plain data, cloning copies them
//! - lists, dicts and tensor buffers live in the [`Heap`] and are addressed
//!   by a [`StorageId`]; cloning a handle aliases the storage
//! - tensors are views `(storage, offset, shape)` over a flat buffer, so two
//!   tensors may share a storage without covering the same region
//! - module references are arena ids, never owned copies

mod heap;

pub use heap::{Heap, HeapObject};

use crate::module::ModuleId;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

/// Identity of one heap storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorageId(pub u32);

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "storage#{}", self.0)
    }
}

/// Tensor shape; most tensors here have at most four dimensions.
pub type Shape = SmallVec<[usize; 4]>;

/// A contiguous view over a tensor buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorView {
    pub storage: StorageId,
    pub offset: usize,
    pub shape: Shape,
}

impl TensorView {
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Number of buffer elements between consecutive rows of dimension 0.
    pub fn row_stride(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    /// The buffer region this view covers, as `start..end`.
    pub fn region(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.numel()
    }
}

/// Hashable dictionary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DictKey {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl DictKey {
    pub fn to_value(&self) -> Value {
        match self {
            DictKey::Bool(b) => Value::Bool(*b),
            DictKey::Int(i) => Value::Int(*i),
            DictKey::Str(s) => Value::Str(s.clone()),
        }
    }
}

impl fmt::Display for DictKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DictKey::Bool(true) => write!(f, "True"),
            DictKey::Bool(false) => write!(f, "False"),
            DictKey::Int(i) => write!(f, "{i}"),
            DictKey::Str(s) => write!(f, "'{s}'"),
        }
    }
}

impl From<&str> for DictKey {
    fn from(s: &str) -> Self {
        DictKey::Str(s.to_string())
    }
}

impl From<i64> for DictKey {
    fn from(i: i64) -> Self {
        DictKey::Int(i)
    }
}

/// A runtime value. Heap-backed variants are handles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(StorageId),
    Dict(StorageId),
    Tuple(Vec<Value>),
    Tensor(TensorView),
    Module(ModuleId),
    /// Result of a `fork`, consumed by `wait`.
    Future(Box<Value>),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::None => "None",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Tuple(_) => "tuple",
            Value::Tensor(_) => "Tensor",
            Value::Module(_) => "module",
            Value::Future(_) => "Future",
        }
    }

    /// True if the value, or anything nested in it, lives in the heap.
    pub fn is_mutable(&self) -> bool {
        match self {
            Value::List(_) | Value::Dict(_) | Value::Tensor(_) => true,
            Value::Tuple(items) => items.iter().any(Value::is_mutable),
            Value::Future(inner) => inner.is_mutable(),
            _ => false,
        }
    }

    /// True for values that carry no heap handle and no module reference.
    pub fn is_plain(&self) -> bool {
        match self {
            Value::None | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Str(_) => true,
            Value::Tuple(items) => items.iter().all(Value::is_plain),
            _ => false,
        }
    }

    pub fn as_module(&self) -> Option<ModuleId> {
        match self {
            Value::Module(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            Value::Bool(b) => Some(f64::from(u8::from(*b))),
            _ => None,
        }
    }

    pub fn to_key(&self) -> Option<DictKey> {
        match self {
            Value::Bool(b) => Some(DictKey::Bool(*b)),
            Value::Int(i) => Some(DictKey::Int(*i)),
            Value::Str(s) => Some(DictKey::Str(s.clone())),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

/// A heap-free, structurally comparable copy of a value.
///
/// Literals are how values enter a store (`Heap::alloc_literal`) and how
/// tests compare results (`Heap::snapshot`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Literal>),
    Tuple(Vec<Literal>),
    Dict(Vec<(DictKey, Literal)>),
    Tensor { shape: Vec<usize>, data: Vec<f64> },
    Module(ModuleId),
}

impl Literal {
    /// One-dimensional tensor literal.
    pub fn tensor(data: impl Into<Vec<f64>>) -> Self {
        let data = data.into();
        Literal::Tensor {
            shape: vec![data.len()],
            data,
        }
    }

    pub fn tensor_shaped(shape: impl Into<Vec<usize>>, data: impl Into<Vec<f64>>) -> Self {
        Literal::Tensor {
            shape: shape.into(),
            data: data.into(),
        }
    }

    /// Zero-dimensional tensor literal.
    pub fn scalar_tensor(x: f64) -> Self {
        Literal::Tensor {
            shape: Vec::new(),
            data: vec![x],
        }
    }

    pub fn str(s: &str) -> Self {
        Literal::Str(s.to_string())
    }

    pub fn ints(items: &[i64]) -> Self {
        Literal::List(items.iter().map(|i| Literal::Int(*i)).collect())
    }
}
