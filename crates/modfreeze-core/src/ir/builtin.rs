//! Builtin operations and their reference semantics

use crate::error::EvalError;
use crate::value::{DictKey, Heap, Shape, TensorView, Value};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Builtin {
    Add,
    Sub,
    Mul,
    Eq,
    Ne,
    Lt,
    Gt,
    Str,
    Len,
    /// Sum of all tensor elements, as a fresh zero-dimensional tensor.
    Sum,
    ListConstruct,
    TupleConstruct,
    /// Arguments alternate key, value.
    DictConstruct,
    ListIndex,
    TupleIndex,
    DictGet,
    ListAppend,
    ListSetItem,
    DictSetItem,
    /// Row `i` of dimension 0, sharing storage.
    TensorSelect,
    /// Reshape sharing storage; trailing arguments are the new dimensions.
    TensorView,
    TensorAddInPlace,
    TensorSetItem,
}

impl Builtin {
    /// Pure operations whose result is plain data when every operand is.
    pub fn is_foldable(self) -> bool {
        matches!(
            self,
            Builtin::Add
                | Builtin::Sub
                | Builtin::Mul
                | Builtin::Eq
                | Builtin::Ne
                | Builtin::Lt
                | Builtin::Gt
                | Builtin::Str
                | Builtin::Len
                | Builtin::TupleConstruct
                | Builtin::TupleIndex
        )
    }

    /// Operations that succeed for any operands of the given count. Only
    /// these may be dropped when their result is unused.
    pub fn cannot_fail(self, operands: usize) -> bool {
        match self {
            Builtin::ListConstruct | Builtin::TupleConstruct => true,
            Builtin::Eq | Builtin::Ne => operands == 2,
            Builtin::Str => operands == 1,
            _ => false,
        }
    }

    /// Operations that write to heap storage.
    pub fn mutates(self) -> bool {
        matches!(
            self,
            Builtin::ListAppend
                | Builtin::ListSetItem
                | Builtin::DictSetItem
                | Builtin::TensorAddInPlace
                | Builtin::TensorSetItem
        )
    }
}

fn arity(op: Builtin, args: &[Value], n: usize) -> Result<(), EvalError> {
    if args.len() < n {
        return Err(EvalError::Arity {
            method: format!("{op:?}"),
            expected: n,
            found: args.len(),
        });
    }
    Ok(())
}

fn index(i: &Value, len: usize) -> Result<usize, EvalError> {
    let raw = i
        .as_int()
        .ok_or_else(|| EvalError::ty("index", format!("expected int, got {}", i.kind())))?;
    let resolved = if raw < 0 { raw + len as i64 } else { raw };
    if resolved < 0 || resolved as usize >= len {
        return Err(EvalError::IndexOutOfRange { index: raw, len });
    }
    Ok(resolved as usize)
}

/// Scalar view of a number or single-element tensor.
fn scalar(heap: &Heap, v: &Value) -> Option<f64> {
    match v {
        Value::Tensor(view) if view.numel() == 1 => heap.tensor_values(view).ok()?.first().copied(),
        other => other.as_float(),
    }
}

fn elementwise(
    heap: &mut Heap,
    op: Builtin,
    a: &Value,
    b: &Value,
    f: impl Fn(f64, f64) -> f64,
) -> Result<Value, EvalError> {
    let (lhs, lshape) = tensor_operand(heap, a)?;
    let (rhs, rshape) = tensor_operand(heap, b)?;
    let (shape, data) = if lhs.len() == rhs.len() {
        let shape = if lshape.len() >= rshape.len() { lshape } else { rshape };
        (shape, lhs.iter().zip(&rhs).map(|(x, y)| f(*x, *y)).collect())
    } else if rhs.len() == 1 {
        (lshape, lhs.iter().map(|x| f(*x, rhs[0])).collect())
    } else if lhs.len() == 1 {
        (rshape, rhs.iter().map(|y| f(lhs[0], *y)).collect())
    } else {
        return Err(EvalError::Shape(format!(
            "{op:?} of tensors with {} and {} elements",
            lhs.len(),
            rhs.len()
        )));
    };
    Ok(heap.alloc_tensor(shape, data))
}

fn tensor_operand(heap: &Heap, v: &Value) -> Result<(Vec<f64>, Shape), EvalError> {
    match v {
        Value::Tensor(view) => Ok((heap.tensor_values(view)?, view.shape.clone())),
        other => other
            .as_float()
            .map(|x| (vec![x], Shape::new()))
            .ok_or_else(|| EvalError::ty("tensor arithmetic", format!("unsupported operand {}", other.kind()))),
    }
}

fn arith(heap: &mut Heap, op: Builtin, a: &Value, b: &Value) -> Result<Value, EvalError> {
    let int_op: fn(i64, i64) -> Option<i64> = match op {
        Builtin::Add => i64::checked_add,
        Builtin::Sub => i64::checked_sub,
        _ => i64::checked_mul,
    };
    let float_op: fn(f64, f64) -> f64 = match op {
        Builtin::Add => |x, y| x + y,
        Builtin::Sub => |x, y| x - y,
        _ => |x, y| x * y,
    };
    match (a, b) {
        (Value::Tensor(_), _) | (_, Value::Tensor(_)) => elementwise(heap, op, a, b, float_op),
        (Value::Int(x), Value::Int(y)) => int_op(*x, *y)
            .map(Value::Int)
            .ok_or_else(|| EvalError::ty("arithmetic", "integer overflow")),
        (Value::Str(x), Value::Str(y)) if op == Builtin::Add => Ok(Value::Str(format!("{x}{y}"))),
        (Value::Tuple(x), Value::Tuple(y)) if op == Builtin::Add => Ok(Value::Tuple(x.iter().chain(y).cloned().collect())),
        (Value::List(x), Value::List(y)) if op == Builtin::Add => {
            let items: Vec<Value> = heap.list(*x)?.iter().chain(heap.list(*y)?).cloned().collect();
            Ok(heap.alloc_list(items))
        }
        _ => match (a.as_float(), b.as_float()) {
            (Some(x), Some(y)) => Ok(Value::Float(float_op(x, y))),
            _ => Err(EvalError::ty(
                &format!("{op:?}"),
                format!("unsupported operands {} and {}", a.kind(), b.kind()),
            )),
        },
    }
}

fn equal(heap: &Heap, a: &Value, b: &Value) -> bool {
    let tensor_scalar = matches!((a, b), (Value::Tensor(_), _) | (_, Value::Tensor(_)))
        && !matches!((a, b), (Value::Tensor(_), Value::Tensor(_)));
    if tensor_scalar {
        return matches!((scalar(heap, a), scalar(heap, b)), (Some(x), Some(y)) if x == y);
    }
    heap.snapshot(a) == heap.snapshot(b)
}

fn compare(heap: &Heap, op: Builtin, a: &Value, b: &Value) -> Result<Value, EvalError> {
    if let (Value::Str(x), Value::Str(y)) = (a, b) {
        return Ok(Value::Bool(if op == Builtin::Lt { x < y } else { x > y }));
    }
    match (scalar(heap, a), scalar(heap, b)) {
        (Some(x), Some(y)) => Ok(Value::Bool(if op == Builtin::Lt { x < y } else { x > y })),
        _ => Err(EvalError::ty(
            &format!("{op:?}"),
            format!("cannot compare {} with {}", a.kind(), b.kind()),
        )),
    }
}

fn expect_tensor<'v>(op: Builtin, v: &'v Value) -> Result<&'v TensorView, EvalError> {
    match v {
        Value::Tensor(view) => Ok(view),
        other => Err(EvalError::ty(&format!("{op:?}"), format!("expected Tensor, got {}", other.kind()))),
    }
}

fn select(view: &TensorView, i: &Value) -> Result<TensorView, EvalError> {
    let rows = *view
        .shape
        .first()
        .ok_or_else(|| EvalError::Shape("select on a zero-dimensional tensor".to_string()))?;
    let row = index(i, rows)?;
    Ok(TensorView {
        storage: view.storage,
        offset: view.offset + row * view.row_stride(),
        shape: view.shape.iter().skip(1).copied().collect(),
    })
}

fn write_tensor(heap: &mut Heap, target: &TensorView, source: &Value, accumulate: bool) -> Result<(), EvalError> {
    let values = match source {
        Value::Tensor(view) => heap.tensor_values(view)?,
        other => vec![other
            .as_float()
            .ok_or_else(|| EvalError::ty("tensor write", format!("unsupported operand {}", other.kind())))?],
    };
    let n = target.numel();
    if values.len() != n && values.len() != 1 {
        return Err(EvalError::Shape(format!(
            "cannot write {} elements into a view of {n}",
            values.len()
        )));
    }
    heap.tensor_update(target, |i, x| {
        let y = if values.len() == 1 { values[0] } else { values[i] };
        if accumulate {
            x + y
        } else {
            y
        }
    })
}

/// Executes one builtin against the heap.
pub fn eval_builtin(heap: &mut Heap, op: Builtin, args: &[Value]) -> Result<Value, EvalError> {
    match op {
        Builtin::Add | Builtin::Sub | Builtin::Mul => {
            arity(op, args, 2)?;
            arith(heap, op, &args[0], &args[1])
        }
        Builtin::Eq | Builtin::Ne => {
            arity(op, args, 2)?;
            let eq = equal(heap, &args[0], &args[1]);
            Ok(Value::Bool(if op == Builtin::Eq { eq } else { !eq }))
        }
        Builtin::Lt | Builtin::Gt => {
            arity(op, args, 2)?;
            compare(heap, op, &args[0], &args[1])
        }
        Builtin::Str => {
            arity(op, args, 1)?;
            Ok(Value::Str(heap.render(&args[0])))
        }
        Builtin::Len => {
            arity(op, args, 1)?;
            let len = match &args[0] {
                Value::List(id) => heap.list(*id)?.len(),
                Value::Dict(id) => heap.dict(*id)?.len(),
                Value::Tuple(items) => items.len(),
                Value::Str(s) => s.chars().count(),
                Value::Tensor(view) => view
                    .shape
                    .first()
                    .copied()
                    .ok_or_else(|| EvalError::Shape("len() of a zero-dimensional tensor".to_string()))?,
                other => return Err(EvalError::ty("len", format!("{} has no len()", other.kind()))),
            };
            Ok(Value::Int(len as i64))
        }
        Builtin::Sum => {
            arity(op, args, 1)?;
            let view = expect_tensor(op, &args[0])?;
            let total = heap.tensor_values(view)?.iter().sum();
            Ok(heap.alloc_tensor(Shape::new(), vec![total]))
        }
        Builtin::ListConstruct => Ok(heap.alloc_list(args.to_vec())),
        Builtin::TupleConstruct => Ok(Value::Tuple(args.to_vec())),
        Builtin::DictConstruct => {
            if args.len() % 2 != 0 {
                return Err(EvalError::ty("dict construct", "odd number of key/value operands"));
            }
            let mut entries = IndexMap::new();
            for pair in args.chunks(2) {
                let key = pair[0]
                    .to_key()
                    .ok_or_else(|| EvalError::ty("dict construct", format!("unhashable key {}", pair[0].kind())))?;
                entries.insert(key, pair[1].clone());
            }
            Ok(heap.alloc_dict(entries))
        }
        Builtin::ListIndex => {
            arity(op, args, 2)?;
            let Value::List(id) = &args[0] else {
                return Err(EvalError::ty("list index", format!("expected list, got {}", args[0].kind())));
            };
            let items = heap.list(*id)?;
            Ok(items[index(&args[1], items.len())?].clone())
        }
        Builtin::TupleIndex => {
            arity(op, args, 2)?;
            let Value::Tuple(items) = &args[0] else {
                return Err(EvalError::ty("tuple index", format!("expected tuple, got {}", args[0].kind())));
            };
            Ok(items[index(&args[1], items.len())?].clone())
        }
        Builtin::DictGet => {
            arity(op, args, 2)?;
            let Value::Dict(id) = &args[0] else {
                return Err(EvalError::ty("dict get", format!("expected dict, got {}", args[0].kind())));
            };
            let key: DictKey = args[1]
                .to_key()
                .ok_or_else(|| EvalError::ty("dict get", format!("unhashable key {}", args[1].kind())))?;
            heap.dict(*id)?
                .get(&key)
                .cloned()
                .ok_or_else(|| EvalError::MissingKey(key.to_string()))
        }
        Builtin::ListAppend => {
            arity(op, args, 2)?;
            let Value::List(id) = &args[0] else {
                return Err(EvalError::ty("append", format!("expected list, got {}", args[0].kind())));
            };
            heap.list_mut(*id)?.push(args[1].clone());
            Ok(Value::None)
        }
        Builtin::ListSetItem => {
            arity(op, args, 3)?;
            let Value::List(id) = &args[0] else {
                return Err(EvalError::ty("list setitem", format!("expected list, got {}", args[0].kind())));
            };
            let items = heap.list_mut(*id)?;
            let slot = index(&args[1], items.len())?;
            items[slot] = args[2].clone();
            Ok(Value::None)
        }
        Builtin::DictSetItem => {
            arity(op, args, 3)?;
            let Value::Dict(id) = &args[0] else {
                return Err(EvalError::ty("dict setitem", format!("expected dict, got {}", args[0].kind())));
            };
            let key = args[1]
                .to_key()
                .ok_or_else(|| EvalError::ty("dict setitem", format!("unhashable key {}", args[1].kind())))?;
            heap.dict_mut(*id)?.insert(key, args[2].clone());
            Ok(Value::None)
        }
        Builtin::TensorSelect => {
            arity(op, args, 2)?;
            let view = expect_tensor(op, &args[0])?;
            Ok(Value::Tensor(select(view, &args[1])?))
        }
        Builtin::TensorView => {
            arity(op, args, 1)?;
            let view = expect_tensor(op, &args[0])?;
            let mut shape = Shape::new();
            for dim in &args[1..] {
                let d = dim
                    .as_int()
                    .filter(|d| *d >= 0)
                    .ok_or_else(|| EvalError::ty("view", format!("invalid dimension {dim:?}")))?;
                shape.push(d as usize);
            }
            let numel: usize = shape.iter().product();
            if numel != view.numel() {
                return Err(EvalError::Shape(format!(
                    "view of {} elements as {:?}",
                    view.numel(),
                    shape.as_slice()
                )));
            }
            Ok(Value::Tensor(TensorView {
                storage: view.storage,
                offset: view.offset,
                shape,
            }))
        }
        Builtin::TensorAddInPlace => {
            arity(op, args, 2)?;
            let view = expect_tensor(op, &args[0])?.clone();
            write_tensor(heap, &view, &args[1], true)?;
            Ok(args[0].clone())
        }
        Builtin::TensorSetItem => {
            arity(op, args, 3)?;
            let view = expect_tensor(op, &args[0])?;
            let row = select(view, &args[1])?;
            write_tensor(heap, &row, &args[2], false)?;
            Ok(Value::None)
        }
    }
}
