//! Dict effect handlers

use super::{EffectContext, EffectHandler};
use crate::dataflow::lattice::LocSet;
use crate::ir::Builtin;

/// Handler for `dict[key] = value`
pub struct DictSetItemEffect;

impl EffectHandler for DictSetItemEffect {
    fn handles(&self, op: Builtin) -> bool {
        op == Builtin::DictSetItem
    }

    fn apply(&self, cx: &mut dyn EffectContext, args: &[LocSet]) -> LocSet {
        if let [dict, _, value, ..] = args {
            cx.store_into(dict, value);
        }
        LocSet::new()
    }
}

/// Handler for `{k: v, ...}`; keys are plain and only values are tracked.
pub struct DictConstructEffect;

impl EffectHandler for DictConstructEffect {
    fn handles(&self, op: Builtin) -> bool {
        op == Builtin::DictConstruct
    }

    fn apply(&self, cx: &mut dyn EffectContext, args: &[LocSet]) -> LocSet {
        let values = args.iter().skip(1).step_by(2).flat_map(|s| s.iter().copied()).collect();
        cx.allocate(values)
    }
}

/// Handler for `dict[key]`
pub struct DictGetEffect;

impl EffectHandler for DictGetEffect {
    fn handles(&self, op: Builtin) -> bool {
        op == Builtin::DictGet
    }

    fn apply(&self, cx: &mut dyn EffectContext, args: &[LocSet]) -> LocSet {
        args.first().map(|dict| cx.project(dict)).unwrap_or_default()
    }
}
