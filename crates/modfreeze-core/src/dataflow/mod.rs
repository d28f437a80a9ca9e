//! Dataflow analysis over method graphs
//!
//! This module implements the analysis half of freezing:
//! - Slot table and abstract locations
//! - Modular effect tracking for builtins that touch heap storage
//! - Points-to fixpoint solver producing per-slot mutation facts

mod lattice;
pub mod mutations;
mod solver;

pub use lattice::{join, Loc, LocSet, SiteId, SlotEffects, SlotId, SlotInfo, SlotRef, SlotTable};
pub use mutations::EffectRegistry;
pub use solver::{Entry, EntryFacts, MutationDetector, MutationFacts};
