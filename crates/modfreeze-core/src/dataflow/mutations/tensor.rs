//! Tensor effect handlers

use super::{EffectContext, EffectHandler};
use crate::dataflow::lattice::LocSet;
use crate::ir::Builtin;

/// Handler for `view` and `select`: the result shares the operand's
/// storage, so it denotes the same locations.
pub struct AliasingViewEffect;

impl EffectHandler for AliasingViewEffect {
    fn handles(&self, op: Builtin) -> bool {
        matches!(op, Builtin::TensorView | Builtin::TensorSelect)
    }

    fn apply(&self, _cx: &mut dyn EffectContext, args: &[LocSet]) -> LocSet {
        args.first().cloned().unwrap_or_default()
    }
}

/// Handler for `t.add_(other)`; returns `t` itself.
pub struct AddInPlaceEffect;

impl EffectHandler for AddInPlaceEffect {
    fn handles(&self, op: Builtin) -> bool {
        op == Builtin::TensorAddInPlace
    }

    fn apply(&self, cx: &mut dyn EffectContext, args: &[LocSet]) -> LocSet {
        let Some(target) = args.first() else {
            return LocSet::new();
        };
        cx.write(target);
        target.clone()
    }
}

/// Handler for `t[i] = value`. Values are copied element-wise, so nothing
/// escapes into the tensor.
pub struct TensorSetItemEffect;

impl EffectHandler for TensorSetItemEffect {
    fn handles(&self, op: Builtin) -> bool {
        op == Builtin::TensorSetItem
    }

    fn apply(&self, cx: &mut dyn EffectContext, args: &[LocSet]) -> LocSet {
        if let Some(target) = args.first() {
            cx.write(target);
        }
        LocSet::new()
    }
}

/// Handler for `t.sum()`
pub struct ReductionEffect;

impl EffectHandler for ReductionEffect {
    fn handles(&self, op: Builtin) -> bool {
        op == Builtin::Sum
    }

    fn apply(&self, cx: &mut dyn EffectContext, _args: &[LocSet]) -> LocSet {
        cx.allocate(LocSet::new())
    }
}
