//! Tuple effect handlers
//!
//! Tuples carry no storage of their own, but their members keep their
//! identities, so a tuple is modelled as a fresh site holding its members.

use super::{union_of, EffectContext, EffectHandler};
use crate::dataflow::lattice::LocSet;
use crate::ir::Builtin;

/// Handler for `(a, b, ...)`
pub struct TupleConstructEffect;

impl EffectHandler for TupleConstructEffect {
    fn handles(&self, op: Builtin) -> bool {
        op == Builtin::TupleConstruct
    }

    fn apply(&self, cx: &mut dyn EffectContext, args: &[LocSet]) -> LocSet {
        cx.allocate(union_of(args))
    }
}

/// Handler for `tuple[i]`
pub struct TupleIndexEffect;

impl EffectHandler for TupleIndexEffect {
    fn handles(&self, op: Builtin) -> bool {
        op == Builtin::TupleIndex
    }

    fn apply(&self, cx: &mut dyn EffectContext, args: &[LocSet]) -> LocSet {
        args.first().map(|tuple| cx.project(tuple)).unwrap_or_default()
    }
}
