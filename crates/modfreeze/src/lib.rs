//! # Modfreeze
//!
//! Command-line front end: reads a store document, freezes one of its
//! module trees and reports what was folded, preserved and dropped.

pub mod cli;
pub mod document;

pub use document::{FrozenDocument, StoreDocument};
