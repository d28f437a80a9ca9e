//! List effect handlers

use super::{union_of, EffectContext, EffectHandler};
use crate::dataflow::lattice::LocSet;
use crate::ir::Builtin;

/// Handler for `list.append(value)`
pub struct AppendEffect;

impl EffectHandler for AppendEffect {
    fn handles(&self, op: Builtin) -> bool {
        op == Builtin::ListAppend
    }

    fn apply(&self, cx: &mut dyn EffectContext, args: &[LocSet]) -> LocSet {
        if let [list, value, ..] = args {
            cx.store_into(list, value);
        }
        LocSet::new()
    }
}

/// Handler for `list[i] = value`
pub struct ListSetItemEffect;

impl EffectHandler for ListSetItemEffect {
    fn handles(&self, op: Builtin) -> bool {
        op == Builtin::ListSetItem
    }

    fn apply(&self, cx: &mut dyn EffectContext, args: &[LocSet]) -> LocSet {
        if let [list, _, value, ..] = args {
            cx.store_into(list, value);
        }
        LocSet::new()
    }
}

/// Handler for `[a, b, ...]`
pub struct ListConstructEffect;

impl EffectHandler for ListConstructEffect {
    fn handles(&self, op: Builtin) -> bool {
        op == Builtin::ListConstruct
    }

    fn apply(&self, cx: &mut dyn EffectContext, args: &[LocSet]) -> LocSet {
        cx.allocate(union_of(args))
    }
}

/// Handler for `list[i]`
pub struct ListIndexEffect;

impl EffectHandler for ListIndexEffect {
    fn handles(&self, op: Builtin) -> bool {
        op == Builtin::ListIndex
    }

    fn apply(&self, cx: &mut dyn EffectContext, args: &[LocSet]) -> LocSet {
        args.first().map(|list| cx.project(list)).unwrap_or_default()
    }
}

/// Handler for `a + b`. Concatenation builds a fresh container over the
/// elements of both operands; arithmetic results carry no elements.
pub struct ConcatEffect;

impl EffectHandler for ConcatEffect {
    fn handles(&self, op: Builtin) -> bool {
        op == Builtin::Add
    }

    fn apply(&self, cx: &mut dyn EffectContext, args: &[LocSet]) -> LocSet {
        let elements: LocSet = args.iter().flat_map(|a| cx.project(a)).collect();
        cx.allocate(elements)
    }
}
