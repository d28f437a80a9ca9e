//! # Modfreeze Analysis
//!
//! Measurement and verification of frozen modules.
//!
//! ## Modules
//!
//! - **[`metrics`]** - Tree size before and after freezing
//! - **[`verify`]** - Equivalence of frozen and unfrozen method results
//!
//! ## Quick Start
//!
//! ```rust
//! use modfreeze_analysis::prelude::*;
//! use modfreeze_core::FreezeOptions;
//!
//! let collector = MetricsCollector::new();
//! let verifier = EquivalenceVerifier::new(FreezeOptions::default());
//! ```

pub mod metrics;
pub mod verify;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::metrics::{FreezeMetrics, MethodMetrics, MetricsCollector, TreeMetrics};
    pub use crate::verify::quickcheck::TypedLiteral;
    pub use crate::verify::{CallOutcome, Divergence, EquivalenceVerifier, VerificationResult, VerificationStatus};
}

pub use metrics::{FreezeMetrics, MetricsCollector, TreeMetrics};
pub use verify::{Divergence, EquivalenceVerifier, VerificationResult, VerificationStatus};
