//! End-to-end freezing scenarios: folding, sub-modules, helper methods,
//! mutation pinning, training mode and user-preserved names.

mod common;

use common::*;
use modfreeze_core::{
    freeze, AttrType, Builtin, ClassType, DictKey, EvalError, FreezeError, GraphBuilder, Literal, ModuleId, Op,
    PreserveReason, Store, Value,
};

/// `forward(x) = self.a + self.b`
fn adder_class(store: &mut Store, name: &str) -> modfreeze_core::ClassId {
    let mut b = GraphBuilder::method(1);
    let this = b.self_value();
    let a = b.get_attr(this, "a");
    let bv = b.get_attr(this, "b");
    let sum = b.builtin(Builtin::Add, &[a, bv]);
    let forward = b.finish(sum);
    store.define_class(
        ClassType::new(name)
            .with_attr("a", AttrType::Int)
            .with_attr("b", AttrType::Int)
            .with_method("forward", forward),
    )
}

fn int_module(store: &mut Store, class: modfreeze_core::ClassId, name: &str, a: i64, b: i64) -> ModuleId {
    let m = store.instantiate(class, name).unwrap();
    store.set_attr(m, "a", Value::Int(a)).unwrap();
    store.set_attr(m, "b", Value::Int(b)).unwrap();
    m
}

// ============================================================================
// Folding
// ============================================================================

#[test]
fn test_freeze_module_folds_every_attribute_kind() {
    let mut b = GraphBuilder::method(1);
    let this = b.self_value();
    let x = b.input(1);
    let a = b.get_attr(this, "a");
    let a_plus_x = b.builtin(Builtin::Add, &[a, x]);
    let names = ["b", "c", "d", "e", "f", "g"];
    let mut fields = vec![a_plus_x];
    for name in names {
        fields.push(b.get_attr(this, name));
    }
    let out = b.builtin(Builtin::TupleConstruct, &fields);
    let forward = b.finish(out);

    let mut store = Store::new();
    let class = store.define_class(
        ClassType::new("FreezeMe")
            .with_attr("a", AttrType::Int)
            .with_attr("b", AttrType::Float)
            .with_attr("c", AttrType::Str)
            .with_attr("d", AttrType::List)
            .with_attr("e", AttrType::Tuple)
            .with_attr("f", AttrType::Dict)
            .with_attr("g", AttrType::Tensor)
            .with_method("forward", forward),
    );
    let m = store.instantiate(class, "m").unwrap();
    store.set_attr(m, "a", Value::Int(1)).unwrap();
    store.set_attr(m, "b", Value::Float(1.2)).unwrap();
    store.set_literal(m, "c", &Literal::str("hello")).unwrap();
    store.set_literal(m, "d", &Literal::ints(&[1, 2])).unwrap();
    store
        .set_literal(m, "e", &Literal::Tuple(vec![Literal::Int(3), Literal::str("x")]))
        .unwrap();
    store
        .set_literal(m, "f", &Literal::Dict(vec![(DictKey::from("layer"), Literal::str("4"))]))
        .unwrap();
    store.set_literal(m, "g", &Literal::tensor([1.0, 2.0])).unwrap();
    store.eval(m).unwrap();

    let frozen = freeze_default(&mut store, m);
    for name in ["a", "b", "c", "d", "e", "f", "g"] {
        assert!(!frozen.hasattr(&store, name), "{name} should be folded");
        assert!(is_folded(&frozen, name));
    }
    assert!(frozen.summary().preserved.is_empty());
    assert_eq!(get_attr_count(&store, &frozen, "forward"), 0);

    let (expected, actual) = run_both(&mut store, m, &frozen, &[Literal::Int(10)]);
    assert_eq!(expected, actual);
    let Literal::Tuple(items) = actual else { panic!("expected tuple") };
    assert_eq!(items[0], Literal::Int(11));
}

#[test]
fn test_freeze_module_with_submodules() {
    let mut store = Store::new();
    let sub_class = adder_class(&mut store, "SubModule");

    // SubModule2.forward: self.b = 30; return self.a + self.b
    let mut b = GraphBuilder::method(1);
    let this = b.self_value();
    let thirty = b.int(30);
    b.set_attr(this, "b", thirty);
    let a = b.get_attr(this, "a");
    let bv = b.get_attr(this, "b");
    let sum = b.builtin(Builtin::Add, &[a, bv]);
    let sub2_forward = b.finish(sum);
    let sub2_class = store.define_class(
        ClassType::new("SubModule2")
            .with_attr("a", AttrType::Int)
            .with_attr("b", AttrType::Int)
            .with_method("forward", sub2_forward),
    );

    // TestModule.forward: self.b = 20; return self.sub1(x) + self.a + self.b + self.sub2(x)
    let mut b = GraphBuilder::method(1);
    let this = b.self_value();
    let x = b.input(1);
    let twenty = b.int(20);
    b.set_attr(this, "b", twenty);
    let sub1 = b.get_attr(this, "sub1");
    let r1 = b.call_method(sub1, "forward", &[x]);
    let a = b.get_attr(this, "a");
    let bv = b.get_attr(this, "b");
    let sub2 = b.get_attr(this, "sub2");
    let r2 = b.call_method(sub2, "forward", &[x]);
    let s1 = b.builtin(Builtin::Add, &[r1, a]);
    let s2 = b.builtin(Builtin::Add, &[s1, bv]);
    let s3 = b.builtin(Builtin::Add, &[s2, r2]);
    let forward = b.finish(s3);
    let root_class = store.define_class(
        ClassType::new("TestModule")
            .with_attr("sub1", AttrType::Module)
            .with_attr("sub2", AttrType::Module)
            .with_attr("a", AttrType::Int)
            .with_attr("b", AttrType::Int)
            .with_method("forward", forward),
    );

    let sub1_m = int_module(&mut store, sub_class, "sub1", 11, 2);
    let sub2_m = int_module(&mut store, sub2_class, "sub2", 12, 2);
    let m = int_module(&mut store, root_class, "m", 3, 4);
    store.add_submodule(m, "sub1", sub1_m).unwrap();
    store.add_submodule(m, "sub2", sub2_m).unwrap();
    store.eval(m).unwrap();

    let mut reference = store.clone();
    let frozen = freeze_default(&mut store, m);

    assert!(!frozen.hasattr(&store, "sub1"));
    assert!(!frozen.hasattr(&store, "a"));
    assert!(frozen.hasattr(&store, "b"));
    assert!(frozen.hasattr(&store, "sub2"));
    let sub2_frozen = frozen.submodule(&store, "sub2").unwrap();
    assert!(store.hasattr(sub2_frozen, "b"));
    assert!(!store.hasattr(sub2_frozen, "a"));
    assert_eq!(reason(&frozen, "b"), Some(PreserveReason::Mutated));
    assert!(is_folded(&frozen, "sub1.a"));

    let expected = reference.forward(m, vec![Value::Int(0)]).unwrap();
    let actual = frozen.forward(&mut store, vec![Value::Int(0)]).unwrap();
    assert_eq!(expected, Value::Int(78));
    assert_eq!(actual, expected);
}

#[test]
fn test_freeze_module_drops_helper_methods() {
    let mut store = Store::new();
    let sub_class = adder_class(&mut store, "SubModule");

    let mut b = GraphBuilder::method(1);
    let this = b.self_value();
    let x = b.input(1);
    let sub = b.get_attr(this, "sub");
    let out = b.call_method(sub, "forward", &[x]);
    let helper = b.finish(out);

    let mut b = GraphBuilder::method(1);
    let this = b.self_value();
    let x = b.input(1);
    let twenty = b.int(20);
    b.set_attr(this, "b", twenty);
    let h = b.call_method(this, "_forward", &[x]);
    let a = b.get_attr(this, "a");
    let bv = b.get_attr(this, "b");
    let s1 = b.builtin(Builtin::Add, &[h, a]);
    let s2 = b.builtin(Builtin::Add, &[s1, bv]);
    let forward = b.finish(s2);

    let root_class = store.define_class(
        ClassType::new("TestModule")
            .with_attr("sub", AttrType::Module)
            .with_attr("a", AttrType::Int)
            .with_attr("b", AttrType::Int)
            .with_method("forward", forward)
            .with_method("_forward", helper),
    );
    let sub = int_module(&mut store, sub_class, "sub", 11, 2);
    let m = int_module(&mut store, root_class, "m", 3, 4);
    store.add_submodule(m, "sub", sub).unwrap();
    store.eval(m).unwrap();

    let frozen = freeze_default(&mut store, m);
    assert!(!frozen.hasattr(&store, "sub"));
    assert!(!frozen.hasattr(&store, "a"));
    assert!(frozen.hasattr(&store, "b"));
    assert_eq!(frozen.summary().dropped_methods, vec!["_forward".to_string()]);
    assert_eq!(frozen.forward(&mut store, vec![Value::Int(0)]).unwrap(), Value::Int(36));

    let err = frozen.call(&mut store, "_forward", vec![Value::Int(0)]).unwrap_err();
    assert!(matches!(err, EvalError::MissingMethod { .. }));
    assert_eq!(err.to_string(), "TestModule does not have a field with name '_forward'");
}

// ============================================================================
// Mutable attributes
// ============================================================================

#[test]
fn test_freeze_module_with_inplace_mutable_list() {
    // forward: for i in range(3): self.a.append(i); return self.a
    let mut b = GraphBuilder::method(1);
    let this = b.self_value();
    let trip = b.int(3);
    b.repeat(trip, &[], |b, i, _| {
        let items = b.get_attr(this, "a");
        b.builtin(Builtin::ListAppend, &[items, i]);
        vec![]
    });
    let items = b.get_attr(this, "a");
    let forward = b.finish(items);

    let mut store = Store::new();
    let class = store.define_class(
        ClassType::new("FreezeMe")
            .with_attr("a", AttrType::List)
            .with_method("forward", forward),
    );
    let m = store.instantiate(class, "m").unwrap();
    store.set_literal(m, "a", &Literal::ints(&[11, 22])).unwrap();
    store.eval(m).unwrap();

    let frozen = freeze_default(&mut store, m);
    assert!(frozen.hasattr(&store, "a"));
    assert_eq!(reason(&frozen, "a"), Some(PreserveReason::Mutated));

    // the frozen module keeps the original list, so both calls append to it
    store.forward(m, vec![Value::None]).unwrap();
    let out = frozen.forward(&mut store, vec![Value::None]).unwrap();
    assert_eq!(snapshot(&store, &out), Literal::ints(&[11, 22, 0, 1, 2, 0, 1, 2]));
}

#[test]
fn test_folded_list_is_a_snapshot() {
    let mut b = GraphBuilder::method(1);
    let this = b.self_value();
    let a = b.get_attr(this, "a");
    let forward = b.finish(a);

    let mut store = Store::new();
    let class = store.define_class(
        ClassType::new("FreezeMe")
            .with_attr("a", AttrType::List)
            .with_method("forward", forward),
    );
    let m = store.instantiate(class, "m").unwrap();
    let list = store.set_literal(m, "a", &Literal::ints(&[1, 2, 3, 4])).unwrap();
    store.eval(m).unwrap();

    let frozen = freeze_default(&mut store, m);
    assert!(!frozen.hasattr(&store, "a"));

    let Value::List(id) = list else { panic!("expected list") };
    store.heap.list_mut(id).unwrap().push(Value::Int(5));

    let out = frozen.forward(&mut store, vec![Value::None]).unwrap();
    assert_eq!(snapshot(&store, &out), Literal::ints(&[1, 2, 3, 4]));
    let original = store.forward(m, vec![Value::None]).unwrap();
    assert_eq!(snapshot(&store, &original), Literal::ints(&[1, 2, 3, 4, 5]));
}

#[test]
fn test_folded_dict_ignores_unkept_mutator() {
    let mut b = GraphBuilder::method(1);
    let this = b.self_value();
    let a = b.get_attr(this, "a");
    let forward = b.finish(a);

    // modify_a: self.a["layer"] = self.a["layer"] + "1"; return self.a
    let mut b = GraphBuilder::method(1);
    let this = b.self_value();
    let a = b.get_attr(this, "a");
    let key = b.str("layer");
    let old = b.builtin(Builtin::DictGet, &[a, key]);
    let one = b.str("1");
    let new = b.builtin(Builtin::Add, &[old, one]);
    b.builtin(Builtin::DictSetItem, &[a, key, new]);
    let modify_a = b.finish(a);

    let mut store = Store::new();
    let class = store.define_class(
        ClassType::new("FreezeMe")
            .with_attr("a", AttrType::Dict)
            .with_method("forward", forward)
            .with_method("modify_a", modify_a),
    );
    let m = store.instantiate(class, "m").unwrap();
    let layer = Literal::Dict(vec![(DictKey::from("layer"), Literal::str("4"))]);
    store.set_literal(m, "a", &layer).unwrap();
    store.eval(m).unwrap();

    let frozen = freeze_default(&mut store, m);
    assert!(!frozen.hasattr(&store, "a"));
    assert_eq!(frozen.summary().dropped_methods, vec!["modify_a".to_string()]);

    store.call(m, "modify_a", vec![Value::None]).unwrap();
    let original = store.forward(m, vec![Value::None]).unwrap();
    assert_eq!(
        snapshot(&store, &original),
        Literal::Dict(vec![(DictKey::from("layer"), Literal::str("41"))])
    );
    let out = frozen.forward(&mut store, vec![Value::None]).unwrap();
    assert_eq!(snapshot(&store, &out), layer);
    assert!(frozen.call(&mut store, "modify_a", vec![Value::None]).is_err());
}

#[test]
fn test_folded_tensor_is_a_snapshot() {
    let mut b = GraphBuilder::method(1);
    let this = b.self_value();
    let a = b.get_attr(this, "a");
    let forward = b.finish(a);

    // bump: self.a[0] += 5
    let mut b = GraphBuilder::method(0);
    let this = b.self_value();
    let a = b.get_attr(this, "a");
    let zero = b.int(0);
    let row = b.builtin(Builtin::TensorSelect, &[a, zero]);
    let five = b.int(5);
    b.builtin(Builtin::TensorAddInPlace, &[row, five]);
    let bump = b.finish_none();

    let mut store = Store::new();
    let class = store.define_class(
        ClassType::new("FreezeMe")
            .with_attr("a", AttrType::Tensor)
            .with_method("forward", forward)
            .with_method("bump", bump),
    );
    let m = store.instantiate(class, "m").unwrap();
    store.set_literal(m, "a", &Literal::tensor([1.0, 5.0, 3.0])).unwrap();
    store.eval(m).unwrap();

    let frozen = freeze_default(&mut store, m);
    store.call(m, "bump", vec![]).unwrap();

    let out = frozen.forward(&mut store, vec![Value::None]).unwrap();
    assert_eq!(snapshot(&store, &out), Literal::tensor([1.0, 5.0, 3.0]));
    let original = store.forward(m, vec![Value::None]).unwrap();
    assert_eq!(snapshot(&store, &original), Literal::tensor([6.0, 5.0, 3.0]));
}

/// `forward`: `t = <container>[0]; t[row] += 10; return t.sum()`, with the
/// container read through `index_op`.
fn element_writer(index_op: Builtin, row: i64) -> modfreeze_core::Graph {
    let mut b = GraphBuilder::method(1);
    let this = b.self_value();
    let a = b.get_attr(this, "a");
    let zero = b.int(0);
    let t = b.builtin(index_op, &[a, zero]);
    let r = b.int(row);
    let view = b.builtin(Builtin::TensorSelect, &[t, r]);
    let ten = b.int(10);
    b.builtin(Builtin::TensorAddInPlace, &[view, ten]);
    let sum = b.builtin(Builtin::Sum, &[t]);
    b.finish(sum)
}

#[test]
fn test_tensor_inside_tuple_written_in_place_is_preserved() {
    let mut store = Store::new();
    let class = store.define_class(
        ClassType::new("FreezeMe")
            .with_attr("a", AttrType::Tuple)
            .with_method("forward", element_writer(Builtin::TupleIndex, 0)),
    );
    let m = store.instantiate(class, "m").unwrap();
    let tuple = Literal::Tuple(vec![
        Literal::tensor([1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
        Literal::str("hi"),
    ]);
    store.set_literal(m, "a", &tuple).unwrap();
    store.eval(m).unwrap();

    let mut reference = store.clone();
    let frozen = freeze_default(&mut store, m);
    assert!(frozen.hasattr(&store, "a"));
    assert_eq!(reason(&frozen, "a"), Some(PreserveReason::Mutated));

    let expected = reference.forward(m, vec![Value::None]).unwrap();
    let actual = frozen.forward(&mut store, vec![Value::None]).unwrap();
    assert_eq!(snapshot(&reference, &expected), Literal::scalar_tensor(31.0));
    assert_eq!(snapshot(&store, &actual), Literal::scalar_tensor(31.0));
}

#[test]
fn test_tensor_inside_list_written_in_place_is_preserved() {
    let mut store = Store::new();
    let class = store.define_class(
        ClassType::new("FreezeMe")
            .with_attr("a", AttrType::List)
            .with_method("forward", element_writer(Builtin::ListIndex, 1)),
    );
    let m = store.instantiate(class, "m").unwrap();
    store
        .set_literal(m, "a", &Literal::List(vec![Literal::tensor([1.0, 2.0, 3.0])]))
        .unwrap();
    store.eval(m).unwrap();

    let frozen = freeze_default(&mut store, m);
    assert!(frozen.hasattr(&store, "a"));
    let out = frozen.forward(&mut store, vec![Value::None]).unwrap();
    assert_eq!(snapshot(&store, &out), Literal::scalar_tensor(16.0));
}

#[test]
fn test_tensor_written_through_view_is_preserved() {
    // y = self.a.view(2, 3); y[1] += 10; return self.a.sum()
    let mut b = GraphBuilder::method(1);
    let this = b.self_value();
    let a = b.get_attr(this, "a");
    let two = b.int(2);
    let three = b.int(3);
    let grid = b.builtin(Builtin::TensorView, &[a, two, three]);
    let one = b.int(1);
    let row = b.builtin(Builtin::TensorSelect, &[grid, one]);
    let ten = b.int(10);
    b.builtin(Builtin::TensorAddInPlace, &[row, ten]);
    let a2 = b.get_attr(this, "a");
    let sum = b.builtin(Builtin::Sum, &[a2]);
    let forward = b.finish(sum);

    let mut store = Store::new();
    let class = store.define_class(
        ClassType::new("FreezeMe")
            .with_attr("a", AttrType::Tensor)
            .with_method("forward", forward),
    );
    let m = store.instantiate(class, "m").unwrap();
    store
        .set_literal(m, "a", &Literal::tensor([1.0, 2.0, 3.0, 4.0, 5.0, 6.0]))
        .unwrap();
    store.eval(m).unwrap();

    let frozen = freeze_default(&mut store, m);
    assert!(frozen.hasattr(&store, "a"));
    let out = frozen.forward(&mut store, vec![Value::None]).unwrap();
    assert_eq!(snapshot(&store, &out), Literal::scalar_tensor(51.0));
}

// ============================================================================
// Training mode
// ============================================================================

/// `forward(x)`: `x + 1` in training, `x + 2` otherwise.
fn training_branch_module(store: &mut Store) -> (ModuleId, ModuleId) {
    let mut b = GraphBuilder::method(1);
    let this = b.self_value();
    let x = b.input(1);
    let training = b.get_attr(this, "training");
    let outs = b.if_else(
        training,
        |b| {
            let one = b.int(1);
            vec![b.builtin(Builtin::Add, &[x, one])]
        },
        |b| {
            let two = b.int(2);
            vec![b.builtin(Builtin::Add, &[x, two])]
        },
    );
    let forward = b.finish(outs[0]);

    let leaf_class = store.define_class(ClassType::new("Dropout"));
    let class = store.define_class(
        ClassType::new("Net")
            .with_attr("dropout", AttrType::Module)
            .with_method("forward", forward),
    );
    let dropout = store.instantiate(leaf_class, "dropout").unwrap();
    let m = store.instantiate(class, "net").unwrap();
    store.add_submodule(m, "dropout", dropout).unwrap();
    (m, dropout)
}

#[test]
fn test_freeze_module_in_training_mode_is_rejected() {
    let mut store = Store::new();
    let (m, dropout) = training_branch_module(&mut store);

    let err = freeze(&mut store, m, &[], &[]).unwrap_err();
    assert!(matches!(err, FreezeError::TrainingMode { .. }));
    assert!(err.to_string().contains("Freezing module in training mode is not yet supported"));

    // a single sub-module left in training mode is enough
    store.eval(m).unwrap();
    store.train(dropout).unwrap();
    let err = freeze(&mut store, m, &[], &[]).unwrap_err();
    assert_eq!(
        err,
        FreezeError::TrainingMode {
            module: "dropout".to_string()
        }
    );
}

#[test]
fn test_eval_mode_branches_are_spliced() {
    let mut store = Store::new();
    let (m, _) = training_branch_module(&mut store);
    store.eval(m).unwrap();

    let frozen = freeze_default(&mut store, m);
    assert!(!frozen.hasattr(&store, "training"));
    assert!(!frozen.hasattr(&store, "dropout"));
    let graph = frozen.method_graph(&store, "forward").unwrap();
    assert_eq!(graph.count_ops(|op| matches!(op, Op::GetAttr { .. })), 0);
    assert_eq!(graph.count_ops(|op| matches!(op, Op::If { .. })), 0);
    assert_eq!(frozen.forward(&mut store, vec![Value::Int(1)]).unwrap(), Value::Int(3));
}

// ============================================================================
// User-preserved names
// ============================================================================

/// `forward = a + b`; `modify_a: a[0] += 10; return b`;
/// `modify_b: b[0] += 20; return a`.
fn modifier_module(store: &mut Store) -> ModuleId {
    let mut b = GraphBuilder::method(1);
    let this = b.self_value();
    let a = b.get_attr(this, "a");
    let bv = b.get_attr(this, "b");
    let sum = b.builtin(Builtin::Add, &[a, bv]);
    let forward = b.finish(sum);

    let modifier = |target: &str, delta: i64, returned: &str| {
        let mut b = GraphBuilder::method(1);
        let this = b.self_value();
        let t = b.get_attr(this, target);
        let zero = b.int(0);
        let row = b.builtin(Builtin::TensorSelect, &[t, zero]);
        let d = b.int(delta);
        b.builtin(Builtin::TensorAddInPlace, &[row, d]);
        let r = b.get_attr(this, returned);
        b.finish(r)
    };

    let class = store.define_class(
        ClassType::new("Module")
            .with_attr("a", AttrType::Tensor)
            .with_attr("b", AttrType::Tensor)
            .with_method("forward", forward)
            .with_method("modify_a", modifier("a", 10, "b"))
            .with_method("modify_b", modifier("b", 20, "a")),
    );
    let m = store.instantiate(class, "m").unwrap();
    store.set_literal(m, "a", &Literal::tensor([1.5])).unwrap();
    store.set_literal(m, "b", &Literal::tensor([2.5])).unwrap();
    store.eval(m).unwrap();
    m
}

#[test]
fn test_freeze_module_with_user_preserved_attr() {
    let mut store = Store::new();
    let m = modifier_module(&mut store);

    let frozen = freeze(&mut store, m, &["a"], &[]).unwrap();
    assert!(frozen.hasattr(&store, "a"));
    assert!(!frozen.hasattr(&store, "b"));
    assert_eq!(reason(&frozen, "a"), Some(PreserveReason::UserRequested));

    // the preserved attribute stays live
    store.call(m, "modify_a", vec![Value::None]).unwrap();
    let out = frozen.forward(&mut store, vec![Value::None]).unwrap();
    assert_eq!(snapshot(&store, &out), Literal::tensor([14.0]));
}

#[test]
fn test_freeze_module_with_user_preserved_method() {
    let mut store = Store::new();
    let m = modifier_module(&mut store);

    let frozen = freeze(&mut store, m, &[], &["modify_a"]).unwrap();
    assert!(frozen.hasattr(&store, "a"));
    assert_eq!(reason(&frozen, "a"), Some(PreserveReason::Mutated));
    // returned by the kept method, so it stays live too
    assert_eq!(reason(&frozen, "b"), Some(PreserveReason::ReadByKeptMethod));
    assert!(frozen.summary().visible_methods.contains(&"modify_a".to_string()));
    assert_eq!(frozen.summary().dropped_methods, vec!["modify_b".to_string()]);

    let (expected, actual) = run_both(&mut store, m, &frozen, &[Literal::None]);
    assert_eq!(expected, actual);

    let returned = frozen.call(&mut store, "modify_a", vec![Value::None]).unwrap();
    assert_eq!(snapshot(&store, &returned), Literal::tensor([2.5]));
    let out = frozen.forward(&mut store, vec![Value::None]).unwrap();
    assert_eq!(snapshot(&store, &out), Literal::tensor([14.0]));
}

#[test]
fn test_preserved_method_reads_stay_live() {
    // forward: self.b += 10; return self.a + self.b
    // modify_a: self.a[0] += 10; return self.b + self.a
    let mut b = GraphBuilder::method(1);
    let this = b.self_value();
    let bv = b.get_attr(this, "b");
    let ten = b.int(10);
    b.builtin(Builtin::TensorAddInPlace, &[bv, ten]);
    let a = b.get_attr(this, "a");
    let bv = b.get_attr(this, "b");
    let sum = b.builtin(Builtin::Add, &[a, bv]);
    let forward = b.finish(sum);

    let mut b = GraphBuilder::method(1);
    let this = b.self_value();
    let a = b.get_attr(this, "a");
    let zero = b.int(0);
    let row = b.builtin(Builtin::TensorSelect, &[a, zero]);
    let ten = b.int(10);
    b.builtin(Builtin::TensorAddInPlace, &[row, ten]);
    let bv = b.get_attr(this, "b");
    let a = b.get_attr(this, "a");
    let sum = b.builtin(Builtin::Add, &[bv, a]);
    let modify_a = b.finish(sum);

    let mut store = Store::new();
    let class = store.define_class(
        ClassType::new("Module")
            .with_attr("a", AttrType::Tensor)
            .with_attr("b", AttrType::Tensor)
            .with_method("forward", forward)
            .with_method("modify_a", modify_a),
    );
    let m = store.instantiate(class, "m").unwrap();
    store.set_literal(m, "a", &Literal::tensor([1.0])).unwrap();
    store.set_literal(m, "b", &Literal::tensor([2.0])).unwrap();
    store.eval(m).unwrap();

    let frozen = freeze(&mut store, m, &[], &["modify_a"]).unwrap();
    let forward_reads = frozen.method_graph(&store, "forward").unwrap().attribute_reads();
    let modify_reads = frozen.method_graph(&store, "modify_a").unwrap().attribute_reads();
    assert!(forward_reads.contains(&"a".to_string()));
    assert!(modify_reads.contains(&"b".to_string()));
}

#[test]
fn test_unknown_preserved_name_is_rejected() {
    let mut store = Store::new();
    let m = modifier_module(&mut store);
    let modules_before = store.module_count();

    let err = freeze(&mut store, m, &["nope"], &[]).unwrap_err();
    assert_eq!(err, FreezeError::UnknownPreservedName("nope".to_string()));
    assert_eq!(store.module_count(), modules_before);
}

// ============================================================================
// Returned modules
// ============================================================================

#[test]
fn test_freeze_module_returning_self_is_rejected() {
    let mut b = GraphBuilder::method(1);
    let this = b.self_value();
    let forward = b.finish(this);

    let mut store = Store::new();
    let class = store.define_class(ClassType::new("FreezeMe").with_method("forward", forward));
    let m = store.instantiate(class, "m").unwrap();
    store.eval(m).unwrap();

    let err = freeze(&mut store, m, &[], &[]).unwrap_err();
    assert!(matches!(err, FreezeError::SelfReturn { .. }));
    assert!(err.to_string().contains("return itself"));
}

#[test]
fn test_freeze_module_returning_self_through_helper_is_rejected() {
    let mut h = GraphBuilder::method(0);
    let this = h.self_value();
    let helper = h.finish(this);

    let mut b = GraphBuilder::method(1);
    let this = b.self_value();
    let out = b.call_method(this, "helper", &[]);
    let forward = b.finish(out);

    let mut store = Store::new();
    let class = store.define_class(
        ClassType::new("FreezeMe")
            .with_method("forward", forward)
            .with_method("helper", helper),
    );
    let m = store.instantiate(class, "m").unwrap();
    store.eval(m).unwrap();

    let err = freeze(&mut store, m, &[], &[]).unwrap_err();
    assert!(matches!(err, FreezeError::SelfReturn { ref method, .. } if method == "forward"));
}

#[test]
fn test_freeze_module_returning_self_through_fork_is_rejected() {
    let mut h = GraphBuilder::method(0);
    let this = h.self_value();
    let helper = h.finish(this);

    let mut b = GraphBuilder::method(1);
    let this = b.self_value();
    let fut = b.fork_method(this, "helper", &[]);
    let out = b.wait(fut);
    let forward = b.finish(out);

    let mut store = Store::new();
    let class = store.define_class(
        ClassType::new("FreezeMe")
            .with_method("forward", forward)
            .with_method("helper", helper),
    );
    let m = store.instantiate(class, "m").unwrap();
    store.eval(m).unwrap();
    let modules_before = store.module_count();

    let err = freeze(&mut store, m, &[], &[]).unwrap_err();
    assert!(matches!(err, FreezeError::SelfReturn { .. }));
    assert_eq!(store.module_count(), modules_before);
}

#[test]
fn test_preserved_method_returning_self_is_rejected() {
    let mut b = GraphBuilder::method(1);
    let x = b.input(1);
    let forward = b.finish(x);

    let mut b = GraphBuilder::method(0);
    let this = b.self_value();
    let get_self = b.finish(this);

    let mut store = Store::new();
    let class = store.define_class(
        ClassType::new("FreezeMe")
            .with_method("forward", forward)
            .with_method("get_self", get_self),
    );
    let m = store.instantiate(class, "m").unwrap();
    store.eval(m).unwrap();

    // only reachable through the preserved method
    assert!(freeze(&mut store, m, &[], &[]).is_ok());
    let err = freeze(&mut store, m, &[], &["get_self"]).unwrap_err();
    assert!(matches!(err, FreezeError::SelfReturn { ref method, .. } if method == "get_self"));
}

#[test]
fn test_preserved_sub_module_returning_parent_is_rejected() {
    // Inner.forward(x) = self.parent
    let mut b = GraphBuilder::method(1);
    let this = b.self_value();
    let parent = b.get_attr(this, "parent");
    let inner_forward = b.finish(parent);

    let mut b = GraphBuilder::method(1);
    let x = b.input(1);
    let forward = b.finish(x);

    let mut store = Store::new();
    let inner_class = store.define_class(
        ClassType::new("Inner")
            .with_attr("parent", AttrType::Module)
            .with_method("forward", inner_forward),
    );
    let class = store.define_class(
        ClassType::new("Outer")
            .with_attr("sub", AttrType::Module)
            .with_method("forward", forward),
    );
    let m = store.instantiate(class, "m").unwrap();
    let sub = store.instantiate(inner_class, "sub").unwrap();
    store.add_submodule(m, "sub", sub).unwrap();
    store.alias_submodule(sub, "parent", m).unwrap();
    store.eval(m).unwrap();

    let err = freeze(&mut store, m, &["sub"], &[]).unwrap_err();
    match err {
        FreezeError::SelfReturn { module, returned, .. } => {
            assert_eq!(module, "sub");
            assert_eq!(returned, store.path_of(m));
        }
        other => panic!("expected SelfReturn, got {other:?}"),
    }
}

/// `Leaf.forward(x) = x * self.k`
fn leaf_class(store: &mut Store) -> modfreeze_core::ClassId {
    let mut b = GraphBuilder::method(1);
    let this = b.self_value();
    let x = b.input(1);
    let k = b.get_attr(this, "k");
    let y = b.builtin(Builtin::Mul, &[x, k]);
    let forward = b.finish(y);
    store.define_class(
        ClassType::new("Leaf")
            .with_attr("k", AttrType::Int)
            .with_method("forward", forward),
    )
}

fn leaf(store: &mut Store, class: modfreeze_core::ClassId, name: &str, k: i64) -> ModuleId {
    let m = store.instantiate(class, name).unwrap();
    store.set_attr(m, "k", Value::Int(k)).unwrap();
    m
}

#[test]
fn test_returned_sub_module_keeps_nested_methods() {
    let mut store = Store::new();
    let leaf_class = leaf_class(&mut store);

    // Mid.forward(x) = self.inner(x)
    let mut b = GraphBuilder::method(1);
    let this = b.self_value();
    let x = b.input(1);
    let inner = b.get_attr(this, "inner");
    let y = b.call_method(inner, "forward", &[x]);
    let mid_forward = b.finish(y);
    let mid_class = store.define_class(
        ClassType::new("Mid")
            .with_attr("inner", AttrType::Module)
            .with_method("forward", mid_forward),
    );

    // Root.forward(x) = self.mid
    let mut b = GraphBuilder::method(1);
    let this = b.self_value();
    let mid = b.get_attr(this, "mid");
    let forward = b.finish(mid);
    let class = store.define_class(
        ClassType::new("Root")
            .with_attr("mid", AttrType::Module)
            .with_method("forward", forward),
    );

    let inner = leaf(&mut store, leaf_class, "inner", 3);
    let mid = store.instantiate(mid_class, "mid").unwrap();
    store.add_submodule(mid, "inner", inner).unwrap();
    let m = store.instantiate(class, "m").unwrap();
    store.add_submodule(m, "mid", mid).unwrap();
    store.eval(m).unwrap();

    let frozen = freeze_default(&mut store, m);
    assert_eq!(reason(&frozen, "mid.inner.k"), Some(PreserveReason::ReturnedModule));
    assert_eq!(store.forward(mid, vec![Value::Int(2)]).unwrap(), Value::Int(6));

    let returned = frozen.forward(&mut store, vec![Value::None]).unwrap();
    let mid_frozen = returned.as_module().unwrap();
    assert_ne!(mid_frozen, mid);
    assert_eq!(store.forward(mid_frozen, vec![Value::Int(2)]).unwrap(), Value::Int(6));
    let inner_frozen = frozen.submodule(&store, "mid.inner").unwrap();
    assert_eq!(store.forward(inner_frozen, vec![Value::Int(5)]).unwrap(), Value::Int(15));
}

#[test]
fn test_freeze_module_returning_sub_module() {
    // Conv.forward(x) = x * self.weight
    let mut b = GraphBuilder::method(1);
    let this = b.self_value();
    let x = b.input(1);
    let w = b.get_attr(this, "weight");
    let y = b.builtin(Builtin::Mul, &[x, w]);
    let conv_forward = b.finish(y);

    let mut b = GraphBuilder::method(1);
    let this = b.self_value();
    let conv = b.get_attr(this, "conv1");
    let forward = b.finish(conv);

    let mut store = Store::new();
    let conv_class = store.define_class(
        ClassType::new("Conv")
            .with_attr("weight", AttrType::Tensor)
            .with_method("forward", conv_forward),
    );
    let class = store.define_class(
        ClassType::new("FreezeMe")
            .with_attr("conv1", AttrType::Module)
            .with_method("forward", forward),
    );
    let conv = store.instantiate(conv_class, "conv1").unwrap();
    store.set_literal(conv, "weight", &Literal::tensor([2.0, 3.0])).unwrap();
    let m = store.instantiate(class, "m").unwrap();
    store.add_submodule(m, "conv1", conv).unwrap();
    store.eval(m).unwrap();

    let frozen = freeze_default(&mut store, m);
    assert!(frozen.hasattr(&store, "conv1"));
    assert_eq!(reason(&frozen, "conv1.weight"), Some(PreserveReason::ReturnedModule));

    let returned = frozen.forward(&mut store, vec![Value::None]).unwrap();
    let conv_frozen = returned.as_module().unwrap();
    let x = tensor(&mut store, &[1.0, 1.0]);
    let y = store.forward(conv_frozen, vec![x]).unwrap();
    assert_eq!(snapshot(&store, &y), Literal::tensor([2.0, 3.0]));
}

// ============================================================================
// Reassigned sub-modules
// ============================================================================

/// `forward(x) = { self.cur = self.b; self.cur(x) }` with an optional
/// preserved `swap()` doing the same assignment.
fn switching_module(store: &mut Store, assign_in_forward: bool) -> ModuleId {
    let leaf_class = leaf_class(store);

    let mut b = GraphBuilder::method(1);
    let this = b.self_value();
    let x = b.input(1);
    if assign_in_forward {
        let target = b.get_attr(this, "b");
        b.set_attr(this, "cur", target);
    }
    let cur = b.get_attr(this, "cur");
    let y = b.call_method(cur, "forward", &[x]);
    let forward = b.finish(y);

    let mut b = GraphBuilder::method(0);
    let this = b.self_value();
    let target = b.get_attr(this, "b");
    b.set_attr(this, "cur", target);
    let swap = b.finish_none();

    let class = store.define_class(
        ClassType::new("Switch")
            .with_attr("a", AttrType::Module)
            .with_attr("b", AttrType::Module)
            .with_attr("cur", AttrType::Module)
            .with_method("forward", forward)
            .with_method("swap", swap),
    );
    let a = leaf(store, leaf_class, "a", 2);
    let bm = leaf(store, leaf_class, "b", 5);
    let m = store.instantiate(class, "m").unwrap();
    store.add_submodule(m, "a", a).unwrap();
    store.add_submodule(m, "b", bm).unwrap();
    store.alias_submodule(m, "cur", a).unwrap();
    store.eval(m).unwrap();
    m
}

#[test]
fn test_sub_module_assigned_before_call_is_resolved() {
    let mut store = Store::new();
    let m = switching_module(&mut store, true);
    let mut reference = store.clone();

    let frozen = freeze_default(&mut store, m);
    assert!(frozen.hasattr(&store, "cur"));

    let expected = reference.forward(m, vec![Value::Int(1)]).unwrap();
    assert_eq!(expected, Value::Int(5));
    assert_eq!(frozen.forward(&mut store, vec![Value::Int(1)]).unwrap(), expected);
}

#[test]
fn test_sub_module_reassigned_elsewhere_is_dynamic_dispatch() {
    let mut store = Store::new();
    let m = switching_module(&mut store, false);

    // without swap, cur only ever holds `a`
    let frozen = freeze_default(&mut store, m);
    assert_eq!(frozen.forward(&mut store, vec![Value::Int(1)]).unwrap(), Value::Int(2));

    let err = freeze(&mut store, m, &[], &["swap"]).unwrap_err();
    match err {
        FreezeError::DynamicModule { attribute, member, .. } => {
            assert_eq!(attribute, "cur");
            assert_eq!(member, "forward");
        }
        other => panic!("expected DynamicModule, got {other:?}"),
    }
}

// ============================================================================
// Persistence
// ============================================================================

#[test]
fn test_frozen_store_survives_json() {
    let mut store = Store::new();
    let m = modifier_module(&mut store);
    let frozen = freeze(&mut store, m, &[], &["modify_a"]).unwrap();

    let json = serde_json::to_string(&store).unwrap();
    let mut restored: Store = serde_json::from_str(&json).unwrap();

    let expected = frozen.forward(&mut store, vec![Value::None]).unwrap();
    let actual = frozen.forward(&mut restored, vec![Value::None]).unwrap();
    assert_eq!(snapshot(&store, &expected), snapshot(&restored, &actual));
    assert!(frozen.hasattr(&restored, "a"));
}
