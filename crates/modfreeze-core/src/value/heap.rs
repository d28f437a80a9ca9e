//! Storage arena backing lists, dicts and tensor buffers

use super::{DictKey, Literal, Shape, StorageId, TensorView, Value};
use crate::error::EvalError;
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One heap storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HeapObject {
    List(Vec<Value>),
    // keys are not strings, so JSON carries entries as pairs
    Dict(#[serde(with = "indexmap::map::serde_seq")] IndexMap<DictKey, Value>),
    Buffer(Vec<f64>),
}

/// Arena of storages. Storages are never freed; ids stay valid for the
/// lifetime of the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Heap {
    objects: Vec<HeapObject>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn alloc(&mut self, object: HeapObject) -> StorageId {
        let id = StorageId(self.objects.len() as u32);
        self.objects.push(object);
        id
    }

    pub fn get(&self, id: StorageId) -> Option<&HeapObject> {
        self.objects.get(id.0 as usize)
    }

    fn get_mut(&mut self, id: StorageId) -> Option<&mut HeapObject> {
        self.objects.get_mut(id.0 as usize)
    }

    pub fn alloc_list(&mut self, items: Vec<Value>) -> Value {
        Value::List(self.alloc(HeapObject::List(items)))
    }

    pub fn alloc_dict(&mut self, entries: IndexMap<DictKey, Value>) -> Value {
        Value::Dict(self.alloc(HeapObject::Dict(entries)))
    }

    pub fn alloc_tensor(&mut self, shape: Shape, data: Vec<f64>) -> Value {
        let storage = self.alloc(HeapObject::Buffer(data));
        Value::Tensor(TensorView {
            storage,
            offset: 0,
            shape,
        })
    }

    pub fn list(&self, id: StorageId) -> Result<&Vec<Value>, EvalError> {
        match self.get(id) {
            Some(HeapObject::List(items)) => Ok(items),
            other => Err(EvalError::ty("list", format!("{id} is {}", describe(other)))),
        }
    }

    pub fn list_mut(&mut self, id: StorageId) -> Result<&mut Vec<Value>, EvalError> {
        match self.get_mut(id) {
            Some(HeapObject::List(items)) => Ok(items),
            other => Err(EvalError::ty("list", format!("{id} is {}", describe(other.as_deref())))),
        }
    }

    pub fn dict(&self, id: StorageId) -> Result<&IndexMap<DictKey, Value>, EvalError> {
        match self.get(id) {
            Some(HeapObject::Dict(entries)) => Ok(entries),
            other => Err(EvalError::ty("dict", format!("{id} is {}", describe(other)))),
        }
    }

    pub fn dict_mut(&mut self, id: StorageId) -> Result<&mut IndexMap<DictKey, Value>, EvalError> {
        match self.get_mut(id) {
            Some(HeapObject::Dict(entries)) => Ok(entries),
            other => Err(EvalError::ty("dict", format!("{id} is {}", describe(other.as_deref())))),
        }
    }

    fn buffer(&self, id: StorageId) -> Result<&Vec<f64>, EvalError> {
        match self.get(id) {
            Some(HeapObject::Buffer(data)) => Ok(data),
            other => Err(EvalError::ty("tensor", format!("{id} is {}", describe(other)))),
        }
    }

    fn buffer_mut(&mut self, id: StorageId) -> Result<&mut Vec<f64>, EvalError> {
        match self.get_mut(id) {
            Some(HeapObject::Buffer(data)) => Ok(data),
            other => Err(EvalError::ty("tensor", format!("{id} is {}", describe(other.as_deref())))),
        }
    }

    /// Elements covered by a tensor view, in row-major order.
    pub fn tensor_values(&self, view: &TensorView) -> Result<Vec<f64>, EvalError> {
        let data = self.buffer(view.storage)?;
        data.get(view.region())
            .map(<[f64]>::to_vec)
            .ok_or_else(|| EvalError::Shape(format!("view {:?} exceeds storage of {} elements", view.region(), data.len())))
    }

    /// Rewrites every element covered by `view` in place.
    pub fn tensor_update(
        &mut self,
        view: &TensorView,
        mut f: impl FnMut(usize, f64) -> f64,
    ) -> Result<(), EvalError> {
        let region = view.region();
        let data = self.buffer_mut(view.storage)?;
        let len = data.len();
        let slice = data
            .get_mut(region.clone())
            .ok_or_else(|| EvalError::Shape(format!("view {region:?} exceeds storage of {len} elements")))?;
        for (i, x) in slice.iter_mut().enumerate() {
            *x = f(i, *x);
        }
        Ok(())
    }

    /// Copies `value` so that no storage is shared with the original.
    ///
    /// `memo` maps original storages to their copies, so sharing inside the
    /// value (and across values copied with the same memo) is reproduced in
    /// the copy: two views of one buffer stay two views of one copied buffer.
    pub fn deep_copy(&mut self, value: &Value, memo: &mut HashMap<StorageId, StorageId>) -> Value {
        match value {
            Value::List(id) => Value::List(self.copy_storage(*id, memo)),
            Value::Dict(id) => Value::Dict(self.copy_storage(*id, memo)),
            Value::Tensor(view) => Value::Tensor(TensorView {
                storage: self.copy_storage(view.storage, memo),
                offset: view.offset,
                shape: view.shape.clone(),
            }),
            Value::Tuple(items) => Value::Tuple(items.iter().map(|v| self.deep_copy(v, memo)).collect()),
            Value::Future(inner) => Value::Future(Box::new(self.deep_copy(inner, memo))),
            other => other.clone(),
        }
    }

    fn copy_storage(&mut self, id: StorageId, memo: &mut HashMap<StorageId, StorageId>) -> StorageId {
        if let Some(copy) = memo.get(&id) {
            return *copy;
        }
        let original = match self.get(id) {
            Some(object) => object.clone(),
            None => return id,
        };
        // Reserve the copy first so self-referencing containers terminate.
        let copy = self.alloc(HeapObject::List(Vec::new()));
        memo.insert(id, copy);
        let copied = match original {
            HeapObject::List(items) => HeapObject::List(items.iter().map(|v| self.deep_copy(v, memo)).collect()),
            HeapObject::Dict(entries) => HeapObject::Dict(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), self.deep_copy(v, memo)))
                    .collect(),
            ),
            HeapObject::Buffer(data) => HeapObject::Buffer(data),
        };
        self.objects[copy.0 as usize] = copied;
        copy
    }

    /// Collects every storage reachable from `value`. Module references are
    /// not followed.
    pub fn footprint(&self, value: &Value, out: &mut IndexSet<StorageId>) {
        match value {
            Value::List(id) => {
                if out.insert(*id) {
                    if let Ok(items) = self.list(*id) {
                        for item in items {
                            self.footprint(item, out);
                        }
                    }
                }
            }
            Value::Dict(id) => {
                if out.insert(*id) {
                    if let Ok(entries) = self.dict(*id) {
                        for item in entries.values() {
                            self.footprint(item, out);
                        }
                    }
                }
            }
            Value::Tensor(view) => {
                out.insert(view.storage);
            }
            Value::Tuple(items) => {
                for item in items {
                    self.footprint(item, out);
                }
            }
            Value::Future(inner) => self.footprint(inner, out),
            _ => {}
        }
    }

    /// Heap-free structural copy of `value`.
    pub fn snapshot(&self, value: &Value) -> Literal {
        self.snapshot_inner(value, &mut Vec::new())
    }

    fn snapshot_inner(&self, value: &Value, path: &mut Vec<StorageId>) -> Literal {
        match value {
            Value::None => Literal::None,
            Value::Bool(b) => Literal::Bool(*b),
            Value::Int(i) => Literal::Int(*i),
            Value::Float(f) => Literal::Float(*f),
            Value::Str(s) => Literal::Str(s.clone()),
            Value::Module(id) => Literal::Module(*id),
            Value::Future(inner) => self.snapshot_inner(inner, path),
            Value::Tuple(items) => Literal::Tuple(items.iter().map(|v| self.snapshot_inner(v, path)).collect()),
            Value::Tensor(view) => Literal::Tensor {
                shape: view.shape.to_vec(),
                data: self.tensor_values(view).unwrap_or_default(),
            },
            Value::List(id) | Value::Dict(id) if path.contains(id) => Literal::Str("...".to_string()),
            Value::List(id) => {
                path.push(*id);
                let items = self
                    .list(*id)
                    .map(|items| items.iter().map(|v| self.snapshot_inner(v, path)).collect())
                    .unwrap_or_default();
                path.pop();
                Literal::List(items)
            }
            Value::Dict(id) => {
                path.push(*id);
                let entries = self
                    .dict(*id)
                    .map(|entries| {
                        entries
                            .iter()
                            .map(|(k, v)| (k.clone(), self.snapshot_inner(v, path)))
                            .collect()
                    })
                    .unwrap_or_default();
                path.pop();
                Literal::Dict(entries)
            }
        }
    }

    /// Materializes a literal as fresh heap storage.
    pub fn alloc_literal(&mut self, literal: &Literal) -> Value {
        match literal {
            Literal::None => Value::None,
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Int(i) => Value::Int(*i),
            Literal::Float(f) => Value::Float(*f),
            Literal::Str(s) => Value::Str(s.clone()),
            Literal::Module(id) => Value::Module(*id),
            Literal::Tuple(items) => Value::Tuple(items.iter().map(|l| self.alloc_literal(l)).collect()),
            Literal::List(items) => {
                let items = items.iter().map(|l| self.alloc_literal(l)).collect();
                self.alloc_list(items)
            }
            Literal::Dict(entries) => {
                let entries = entries
                    .iter()
                    .map(|(k, l)| (k.clone(), self.alloc_literal(l)))
                    .collect();
                self.alloc_dict(entries)
            }
            Literal::Tensor { shape, data } => self.alloc_tensor(shape.iter().copied().collect(), data.clone()),
        }
    }

    /// Python-style `str()` rendering.
    pub fn render(&self, value: &Value) -> String {
        let mut out = String::new();
        self.render_into(value, true, &mut out);
        out
    }

    fn render_into(&self, value: &Value, top: bool, out: &mut String) {
        match value {
            Value::None => out.push_str("None"),
            Value::Bool(true) => out.push_str("True"),
            Value::Bool(false) => out.push_str("False"),
            Value::Int(i) => out.push_str(&i.to_string()),
            Value::Float(f) => out.push_str(&format_float(*f)),
            Value::Str(s) if top => out.push_str(s),
            Value::Str(s) => {
                out.push('\'');
                out.push_str(s);
                out.push('\'');
            }
            Value::Module(id) => out.push_str(&format!("<module {}>", id.0)),
            Value::Future(inner) => {
                out.push_str("Future(");
                self.render_into(inner, false, out);
                out.push(')');
            }
            Value::Tuple(items) => {
                out.push('(');
                self.render_seq(items, out);
                if items.len() == 1 {
                    out.push(',');
                }
                out.push(')');
            }
            Value::List(id) => {
                out.push('[');
                if let Ok(items) = self.list(*id) {
                    self.render_seq(items, out);
                }
                out.push(']');
            }
            Value::Dict(id) => {
                out.push('{');
                if let Ok(entries) = self.dict(*id) {
                    for (i, (k, v)) in entries.iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        out.push_str(&k.to_string());
                        out.push_str(": ");
                        self.render_into(v, false, out);
                    }
                }
                out.push('}');
            }
            Value::Tensor(view) => {
                let data = self.tensor_values(view).unwrap_or_default();
                out.push_str("tensor(");
                render_tensor(&data, &view.shape, out);
                out.push(')');
            }
        }
    }

    fn render_seq(&self, items: &[Value], out: &mut String) {
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            self.render_into(item, false, out);
        }
    }
}

fn describe(object: Option<&HeapObject>) -> &'static str {
    match object {
        Some(HeapObject::List(_)) => "a list",
        Some(HeapObject::Dict(_)) => "a dict",
        Some(HeapObject::Buffer(_)) => "a tensor buffer",
        None => "unallocated",
    }
}

pub(crate) fn format_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

fn render_tensor(data: &[f64], shape: &[usize], out: &mut String) {
    match shape.split_first() {
        None => out.push_str(&format_float(data.first().copied().unwrap_or(0.0))),
        Some((&rows, rest)) => {
            let stride: usize = rest.iter().product();
            out.push('[');
            for row in 0..rows {
                if row > 0 {
                    out.push_str(", ");
                }
                if rest.is_empty() {
                    out.push_str(&format_float(data.get(row).copied().unwrap_or(0.0)));
                } else {
                    let start = row * stride;
                    let end = (start + stride).min(data.len());
                    render_tensor(data.get(start..end).unwrap_or(&[]), rest, out);
                }
            }
            out.push(']');
        }
    }
}
