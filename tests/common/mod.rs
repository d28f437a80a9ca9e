//! Shared helpers for the scenario tests
#![allow(dead_code)]

use modfreeze_core::{freeze, FrozenModule, Literal, ModuleId, Op, PreserveReason, Store, Value};

/// Freezes with no user-preserved names.
pub fn freeze_default(store: &mut Store, root: ModuleId) -> FrozenModule {
    freeze(store, root, &[], &[]).unwrap()
}

pub fn snapshot(store: &Store, value: &Value) -> Literal {
    store.heap.snapshot(value)
}

pub fn tensor(store: &mut Store, data: &[f64]) -> Value {
    store.heap.alloc_literal(&Literal::tensor(data.to_vec()))
}

/// Runs `forward(args)` on the original and on the frozen root and returns
/// both results as literals, original first.
pub fn run_both(store: &mut Store, original: ModuleId, frozen: &FrozenModule, args: &[Literal]) -> (Literal, Literal) {
    let a: Vec<Value> = args.iter().map(|l| store.heap.alloc_literal(l)).collect();
    let expected = store.forward(original, a).unwrap();
    let expected = store.heap.snapshot(&expected);
    let b: Vec<Value> = args.iter().map(|l| store.heap.alloc_literal(l)).collect();
    let actual = frozen.forward(store, b).unwrap();
    (expected, store.heap.snapshot(&actual))
}

pub fn get_attr_count(store: &Store, frozen: &FrozenModule, method: &str) -> usize {
    frozen
        .method_graph(store, method)
        .map(|g| g.count_ops(|op| matches!(op, Op::GetAttr { .. })))
        .unwrap_or(0)
}

pub fn reason(frozen: &FrozenModule, path: &str) -> Option<PreserveReason> {
    frozen
        .summary()
        .preserved
        .iter()
        .find(|p| p.path == path)
        .map(|p| p.reason)
}

pub fn is_folded(frozen: &FrozenModule, path: &str) -> bool {
    frozen.summary().folded.iter().any(|p| p == path)
}

/// A tensor sharing `value`'s storage and offset, reshaped to `dims`.
pub fn view_of(value: &Value, dims: &[usize]) -> Value {
    let Value::Tensor(view) = value else { panic!("expected tensor, got {}", value.kind()) };
    let mut view = view.clone();
    view.shape = dims.iter().copied().collect();
    Value::Tensor(view)
}
