//! Modular effect tracking for builtin operations
//!
//! Each builtin that touches heap storage has its own handler describing
//! which abstract locations it writes, which values it stores into which
//! containers, and what its result may point to.

mod dict;
mod list;
mod tensor;
mod tuple;

use super::lattice::LocSet;
use crate::ir::Builtin;

pub use dict::*;
pub use list::*;
pub use tensor::*;
pub use tuple::*;

/// Operations a handler may perform on the analysis state.
pub trait EffectContext {
    /// In-place write to the storage denoted by `target`.
    fn write(&mut self, target: &LocSet);

    /// `value` is stored inside the container `target`.
    fn store_into(&mut self, target: &LocSet, value: &LocSet);

    /// Locations of values nested inside `source`.
    fn project(&self, source: &LocSet) -> LocSet;

    /// A fresh allocation at the current site holding `contents`.
    fn allocate(&mut self, contents: LocSet) -> LocSet;
}

/// Trait for handlers describing the effect of one builtin
pub trait EffectHandler {
    fn handles(&self, op: Builtin) -> bool;

    /// Applies the effect and returns the locations the result may denote.
    fn apply(&self, cx: &mut dyn EffectContext, args: &[LocSet]) -> LocSet;
}

/// Registry of all effect handlers
pub struct EffectRegistry {
    handlers: Vec<Box<dyn EffectHandler + Send + Sync>>,
}

impl EffectRegistry {
    pub fn new() -> Self {
        let mut registry = Self { handlers: Vec::new() };

        // Register list effects
        registry.register(Box::new(list::AppendEffect));
        registry.register(Box::new(list::ListSetItemEffect));
        registry.register(Box::new(list::ListConstructEffect));
        registry.register(Box::new(list::ListIndexEffect));
        registry.register(Box::new(list::ConcatEffect));

        // Register dict effects
        registry.register(Box::new(dict::DictSetItemEffect));
        registry.register(Box::new(dict::DictConstructEffect));
        registry.register(Box::new(dict::DictGetEffect));

        // Register tuple effects
        registry.register(Box::new(tuple::TupleConstructEffect));
        registry.register(Box::new(tuple::TupleIndexEffect));

        // Register tensor effects
        registry.register(Box::new(tensor::AliasingViewEffect));
        registry.register(Box::new(tensor::AddInPlaceEffect));
        registry.register(Box::new(tensor::TensorSetItemEffect));
        registry.register(Box::new(tensor::ReductionEffect));

        registry
    }

    pub fn register(&mut self, handler: Box<dyn EffectHandler + Send + Sync>) {
        self.handlers.push(handler);
    }

    /// Find and apply the handler for `op`
    pub fn apply(&self, op: Builtin, cx: &mut dyn EffectContext, args: &[LocSet]) -> LocSet {
        match self.handlers.iter().find(|h| h.handles(op)) {
            Some(handler) => handler.apply(cx, args),
            None => Self::fallback(op, cx, args),
        }
    }

    /// Unregistered builtins are pure and produce plain values, except that
    /// a mutating builtin without a handler conservatively writes its first
    /// operand.
    fn fallback(op: Builtin, cx: &mut dyn EffectContext, args: &[LocSet]) -> LocSet {
        if op.mutates() {
            if let Some(target) = args.first() {
                cx.write(target);
            }
        }
        LocSet::new()
    }
}

impl Default for EffectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Union of the given operands.
pub fn union_of<'a>(args: impl IntoIterator<Item = &'a LocSet>) -> LocSet {
    args.into_iter().flat_map(|s| s.iter().copied()).collect()
}
