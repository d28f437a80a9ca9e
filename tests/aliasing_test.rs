//! Attributes sharing storage: alias sets, written storage and the overlap
//! error.

mod common;

use common::*;
use modfreeze_core::{
    AttrType, Builtin, ClassType, FreezeError, Graph, GraphBuilder, Literal, ModuleId, PreserveReason, Store, Value,
};

fn module(store: &mut Store, attrs: &[(&str, AttrType)], forward: Graph) -> ModuleId {
    let mut class = ClassType::new("TestModule").with_method("forward", forward);
    for (name, ty) in attrs {
        class = class.with_attr(name, ty.clone());
    }
    let class = store.define_class(class);
    store.instantiate(class, "m").unwrap()
}

fn six(store: &mut Store) -> Value {
    tensor(store, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
}

/// `target[row] += 10`
fn add_ten_at(b: &mut GraphBuilder, target: modfreeze_core::ValueId, row: i64) {
    let r = b.int(row);
    let view = b.builtin(Builtin::TensorSelect, &[target, r]);
    let ten = b.int(10);
    b.builtin(Builtin::TensorAddInPlace, &[view, ten]);
}

fn sum_of_attr(b: &mut GraphBuilder, name: &str) -> modfreeze_core::ValueId {
    let this = b.self_value();
    let t = b.get_attr(this, name);
    b.builtin(Builtin::Sum, &[t])
}

// ============================================================================
// Tensor views
// ============================================================================

#[test]
fn test_freeze_module_with_aliased_tensor_attr() {
    // self.b[1] += 10; return self.a.sum()
    let mut b = GraphBuilder::method(1);
    let this = b.self_value();
    let view = b.get_attr(this, "b");
    add_ten_at(&mut b, view, 1);
    let out = sum_of_attr(&mut b, "a");
    let forward = b.finish(out);

    let mut store = Store::new();
    let m = module(&mut store, &[("a", AttrType::Tensor), ("b", AttrType::Tensor)], forward);
    let a = six(&mut store);
    store.set_attr(m, "b", view_of(&a, &[2, 3])).unwrap();
    store.set_attr(m, "a", a).unwrap();
    store.eval(m).unwrap();

    let frozen = freeze_default(&mut store, m);
    assert!(frozen.hasattr(&store, "a"));
    assert_eq!(reason(&frozen, "b"), Some(PreserveReason::Mutated));
    assert!(matches!(
        reason(&frozen, "a"),
        Some(PreserveReason::Aliased | PreserveReason::SharesWrittenStorage)
    ));
    assert_eq!(frozen.summary().alias_sets, 1);

    let out = frozen.forward(&mut store, vec![Value::None]).unwrap();
    assert_eq!(snapshot(&store, &out), Literal::scalar_tensor(51.0));
}

#[test]
fn test_view_in_tuple_written_while_base_is_read_overlaps() {
    // self.d[0][0] += 10; return self.a.sum()
    let mut b = GraphBuilder::method(1);
    let this = b.self_value();
    let d = b.get_attr(this, "d");
    let zero = b.int(0);
    let grid = b.builtin(Builtin::TupleIndex, &[d, zero]);
    add_ten_at(&mut b, grid, 0);
    let out = sum_of_attr(&mut b, "a");
    let forward = b.finish(out);

    let mut store = Store::new();
    let m = module(&mut store, &[("a", AttrType::Tensor), ("d", AttrType::Tuple)], forward);
    let a = six(&mut store);
    store
        .set_attr(m, "d", Value::Tuple(vec![view_of(&a, &[2, 3]), Value::Int(20)]))
        .unwrap();
    store.set_attr(m, "a", a).unwrap();
    store.eval(m).unwrap();

    let err = modfreeze_core::freeze(&mut store, m, &[], &[]).unwrap_err();
    assert_eq!(
        err,
        FreezeError::OverlappingAttributes {
            attribute: "a".to_string(),
            other: "d".to_string(),
        }
    );
    assert!(err.to_string().contains("overlaps"));
}

#[test]
fn test_list_holding_written_tensor_is_preserved() {
    // self.a[1] += 10; return self.b[0].sum()
    let mut b = GraphBuilder::method(1);
    let this = b.self_value();
    let a = b.get_attr(this, "a");
    add_ten_at(&mut b, a, 1);
    let items = b.get_attr(this, "b");
    let zero = b.int(0);
    let first = b.builtin(Builtin::ListIndex, &[items, zero]);
    let out = b.builtin(Builtin::Sum, &[first]);
    let forward = b.finish(out);

    let mut store = Store::new();
    let m = module(&mut store, &[("a", AttrType::Tensor), ("b", AttrType::List)], forward);
    let a = six(&mut store);
    let ten = tensor(&mut store, &[10.0]);
    let list = store.heap.alloc_list(vec![a.clone(), ten]);
    store.set_attr(m, "a", a).unwrap();
    store.set_attr(m, "b", list).unwrap();
    store.eval(m).unwrap();

    let mut reference = store.clone();
    let frozen = freeze_default(&mut store, m);
    assert!(frozen.hasattr(&store, "a"));
    assert!(frozen.hasattr(&store, "b"));
    assert_eq!(reason(&frozen, "b"), Some(PreserveReason::SharesWrittenStorage));

    let expected = reference.forward(m, vec![Value::None]).unwrap();
    let actual = frozen.forward(&mut store, vec![Value::None]).unwrap();
    assert_eq!(snapshot(&reference, &expected), Literal::scalar_tensor(31.0));
    assert_eq!(snapshot(&store, &actual), Literal::scalar_tensor(31.0));
}

#[test]
fn test_tensor_written_through_list_while_read_directly_overlaps() {
    // self.b[0][0] += 10; return self.a.sum()
    let mut b = GraphBuilder::method(1);
    let this = b.self_value();
    let items = b.get_attr(this, "b");
    let zero = b.int(0);
    let first = b.builtin(Builtin::ListIndex, &[items, zero]);
    add_ten_at(&mut b, first, 0);
    let out = sum_of_attr(&mut b, "a");
    let forward = b.finish(out);

    let mut store = Store::new();
    let m = module(&mut store, &[("a", AttrType::Tensor), ("b", AttrType::List)], forward);
    let a = six(&mut store);
    let ten = tensor(&mut store, &[10.0]);
    let list = store.heap.alloc_list(vec![a.clone(), ten]);
    store.set_attr(m, "a", a).unwrap();
    store.set_attr(m, "b", list).unwrap();
    store.eval(m).unwrap();

    let err = modfreeze_core::freeze(&mut store, m, &[], &[]).unwrap_err();
    assert!(matches!(
        err,
        FreezeError::OverlappingAttributes { ref attribute, ref other } if attribute == "a" && other == "b"
    ));
}

#[test]
fn test_freeze_module_with_overlapping_attrs() {
    // self.b[0][0] += 10; return self.c[1].sum()
    let mut b = GraphBuilder::method(1);
    let this = b.self_value();
    let items = b.get_attr(this, "b");
    let zero = b.int(0);
    let first = b.builtin(Builtin::ListIndex, &[items, zero]);
    add_ten_at(&mut b, first, 0);
    let c = b.get_attr(this, "c");
    let one = b.int(1);
    let second = b.builtin(Builtin::TupleIndex, &[c, one]);
    let out = b.builtin(Builtin::Sum, &[second]);
    let forward = b.finish(out);

    let mut store = Store::new();
    let m = module(
        &mut store,
        &[("a", AttrType::Tensor), ("b", AttrType::List), ("c", AttrType::Tuple)],
        forward,
    );
    let a = six(&mut store);
    let ten = tensor(&mut store, &[10.0]);
    let list = store.heap.alloc_list(vec![view_of(&a, &[3, 2]), ten]);
    store.set_attr(m, "b", list).unwrap();
    store
        .set_attr(m, "c", Value::Tuple(vec![Value::Int(20), view_of(&a, &[2, 3])]))
        .unwrap();
    store.set_attr(m, "a", a).unwrap();
    store.eval(m).unwrap();
    let modules_before = store.module_count();

    let err = modfreeze_core::freeze(&mut store, m, &[], &[]).unwrap_err();
    assert_eq!(
        err,
        FreezeError::OverlappingAttributes {
            attribute: "c".to_string(),
            other: "b".to_string(),
        }
    );
    // nothing was built
    assert_eq!(store.module_count(), modules_before);
}

// ============================================================================
// Lists
// ============================================================================

#[test]
fn test_freeze_module_with_aliased_list_attrs() {
    // self.b[1] += 10; return str(self.a) + str(self.c)
    let mut b = GraphBuilder::method(1);
    let this = b.self_value();
    let list = b.get_attr(this, "b");
    let one = b.int(1);
    let old = b.builtin(Builtin::ListIndex, &[list, one]);
    let ten = b.int(10);
    let new = b.builtin(Builtin::Add, &[old, ten]);
    b.builtin(Builtin::ListSetItem, &[list, one, new]);
    let a = b.get_attr(this, "a");
    let sa = b.builtin(Builtin::Str, &[a]);
    let c = b.get_attr(this, "c");
    let sc = b.builtin(Builtin::Str, &[c]);
    let out = b.builtin(Builtin::Add, &[sa, sc]);
    let forward = b.finish(out);

    let mut store = Store::new();
    let m = module(
        &mut store,
        &[("a", AttrType::List), ("b", AttrType::List), ("c", AttrType::Tuple)],
        forward,
    );
    let a = store.heap.alloc_literal(&Literal::ints(&[1, 2]));
    store.set_attr(m, "a", a.clone()).unwrap();
    store.set_attr(m, "b", a.clone()).unwrap();
    store.set_attr(m, "c", Value::Tuple(vec![a, Value::Int(10)])).unwrap();
    store.eval(m).unwrap();

    let mut reference = store.clone();
    let frozen = freeze_default(&mut store, m);
    for name in ["a", "b", "c"] {
        assert!(frozen.hasattr(&store, name), "{name} should be preserved");
    }
    assert_eq!(reason(&frozen, "b"), Some(PreserveReason::Mutated));
    assert!(matches!(
        reason(&frozen, "a"),
        Some(PreserveReason::Aliased | PreserveReason::SharesWrittenStorage)
    ));
    assert_eq!(reason(&frozen, "c"), Some(PreserveReason::SharesWrittenStorage));

    let expected = reference.forward(m, vec![Value::None]).unwrap();
    let actual = frozen.forward(&mut store, vec![Value::None]).unwrap();
    assert_eq!(expected, Value::Str("[1, 12]([1, 12], 10)".to_string()));
    assert_eq!(actual, expected);
}

#[test]
fn test_list_assigned_into_another_attr_is_preserved() {
    // v = self.a; self.b = (v, [12]); v2 = self.b[1]; v2.append(7)
    // return str(v) + str(v2)
    let mut b = GraphBuilder::method(1);
    let this = b.self_value();
    let v = b.get_attr(this, "a");
    let twelve = b.int(12);
    let fresh = b.builtin(Builtin::ListConstruct, &[twelve]);
    let pair = b.builtin(Builtin::TupleConstruct, &[v, fresh]);
    b.set_attr(this, "b", pair);
    let stored = b.get_attr(this, "b");
    let one = b.int(1);
    let v2 = b.builtin(Builtin::TupleIndex, &[stored, one]);
    let seven = b.int(7);
    b.builtin(Builtin::ListAppend, &[v2, seven]);
    let sv = b.builtin(Builtin::Str, &[v]);
    let sv2 = b.builtin(Builtin::Str, &[v2]);
    let out = b.builtin(Builtin::Add, &[sv, sv2]);
    let forward = b.finish(out);

    let mut store = Store::new();
    let m = module(&mut store, &[("a", AttrType::List), ("b", AttrType::Tuple)], forward);
    store.set_literal(m, "a", &Literal::ints(&[1, 2])).unwrap();
    store
        .set_literal(m, "b", &Literal::Tuple(vec![Literal::ints(&[11]), Literal::ints(&[10])]))
        .unwrap();
    store.eval(m).unwrap();

    let mut reference = store.clone();
    let frozen = freeze_default(&mut store, m);
    assert!(frozen.hasattr(&store, "a"));
    assert!(frozen.hasattr(&store, "b"));
    assert_eq!(reason(&frozen, "b"), Some(PreserveReason::Mutated));

    let expected = reference.forward(m, vec![Value::None]).unwrap();
    let actual = frozen.forward(&mut store, vec![Value::None]).unwrap();
    assert_eq!(expected, Value::Str("[1, 2][12, 7]".to_string()));
    assert_eq!(actual, expected);
}

#[test]
fn test_list_appended_through_local_tuple_is_preserved() {
    // v = self.a; v2 = (v, [12]); v3 = v2[0]; v3.append(7); return str(v)
    let mut b = GraphBuilder::method(1);
    let this = b.self_value();
    let v = b.get_attr(this, "a");
    let twelve = b.int(12);
    let fresh = b.builtin(Builtin::ListConstruct, &[twelve]);
    let pair = b.builtin(Builtin::TupleConstruct, &[v, fresh]);
    let zero = b.int(0);
    let v3 = b.builtin(Builtin::TupleIndex, &[pair, zero]);
    let seven = b.int(7);
    b.builtin(Builtin::ListAppend, &[v3, seven]);
    let out = b.builtin(Builtin::Str, &[v]);
    let forward = b.finish(out);

    let mut store = Store::new();
    let m = module(&mut store, &[("a", AttrType::List)], forward);
    store.set_literal(m, "a", &Literal::ints(&[1, 2])).unwrap();
    store.eval(m).unwrap();

    let frozen = freeze_default(&mut store, m);
    assert!(frozen.hasattr(&store, "a"));
    assert_eq!(reason(&frozen, "a"), Some(PreserveReason::Mutated));

    let out = frozen.forward(&mut store, vec![Value::None]).unwrap();
    assert_eq!(out, Value::Str("[1, 2, 7]".to_string()));
    // the original sees the same list
    let list = store.attr(m, "a").unwrap().clone();
    assert_eq!(snapshot(&store, &list), Literal::ints(&[1, 2, 7]));
}

#[test]
fn test_unread_alias_of_folded_list_is_dropped() {
    // return self.a
    let mut b = GraphBuilder::method(1);
    let this = b.self_value();
    let a = b.get_attr(this, "a");
    let forward = b.finish(a);

    let mut store = Store::new();
    let m = module(&mut store, &[("a", AttrType::List), ("b", AttrType::List)], forward);
    let list = store.heap.alloc_literal(&Literal::ints(&[4]));
    store.set_attr(m, "a", list.clone()).unwrap();
    store.set_attr(m, "b", list).unwrap();
    store.eval(m).unwrap();

    let frozen = freeze_default(&mut store, m);
    assert!(!frozen.hasattr(&store, "a"));
    assert!(!frozen.hasattr(&store, "b"));
    assert!(frozen.summary().preserved.is_empty());
}
