//! Equivalence verification
//!
//! Runs one method on an unfrozen copy of a store and on a frozen copy,
//! with the same sequence of arguments, and compares every result
//! structurally. Both copies are clones; the caller's store is never
//! touched.

pub mod quickcheck;

use anyhow::{Context, Result};
use modfreeze_core::{FreezeOptions, FreezePipeline, FreezeSummary, Literal, ModuleId, Store, Value};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum Divergence {
    #[error("call {call} of '{method}': original returned {original:?}, frozen returned {frozen:?}")]
    Output {
        method: String,
        call: usize,
        original: Literal,
        frozen: Literal,
    },

    #[error("call {call} of '{method}' failed only on the {side} module: {message}")]
    Failure {
        method: String,
        call: usize,
        side: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationStatus {
    Equivalent,
    Diverged,
}

/// Result of one call on both copies. Errors are kept as messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallOutcome {
    pub args: Vec<Literal>,
    pub original: Result<Literal, String>,
    pub frozen: Result<Literal, String>,
}

impl CallOutcome {
    /// Equal results, or both sides failed.
    pub fn agrees(&self) -> bool {
        match (&self.original, &self.frozen) {
            (Ok(a), Ok(b)) => a == b,
            (Err(_), Err(_)) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub method: String,
    pub status: VerificationStatus,
    pub calls: Vec<CallOutcome>,
    pub summary: FreezeSummary,
}

impl VerificationResult {
    pub fn is_equivalent(&self) -> bool {
        self.status == VerificationStatus::Equivalent
    }

    /// First disagreeing call as an error.
    pub fn divergence(&self) -> Option<Divergence> {
        let (call, outcome) = self.calls.iter().enumerate().find(|(_, o)| !o.agrees())?;
        let method = self.method.clone();
        Some(match (&outcome.original, &outcome.frozen) {
            (Ok(original), Ok(frozen)) => Divergence::Output {
                method,
                call,
                original: original.clone(),
                frozen: frozen.clone(),
            },
            (Err(message), _) => Divergence::Failure {
                method,
                call,
                side: "original",
                message: message.clone(),
            },
            (_, Err(message)) => Divergence::Failure {
                method,
                call,
                side: "frozen",
                message: message.clone(),
            },
        })
    }
}

pub struct EquivalenceVerifier {
    options: FreezeOptions,
    method: String,
}

impl EquivalenceVerifier {
    /// Verifies the entry method named by `options`.
    pub fn new(options: FreezeOptions) -> Self {
        let method = options.entry.clone();
        Self { options, method }
    }

    pub fn with_method(mut self, method: &str) -> Self {
        self.method = method.to_string();
        self
    }

    /// Calls the method once per element of `calls`, in order, on both
    /// copies. State mutated by one call is visible to the next.
    pub fn verify(&self, store: &Store, root: ModuleId, calls: &[Vec<Literal>]) -> Result<VerificationResult> {
        let mut original = store.clone();
        let mut frozen_store = store.clone();
        let frozen = FreezePipeline::new()
            .freeze(&mut frozen_store, root, &self.options)
            .with_context(|| format!("freezing {}", store.path_of(root)))?;

        let mut outcomes = Vec::with_capacity(calls.len());
        for args in calls {
            let outcome = CallOutcome {
                args: args.clone(),
                original: run(&mut original, root, &self.method, args),
                frozen: run(&mut frozen_store, frozen.root(), &self.method, args),
            };
            debug!(method = self.method.as_str(), agrees = outcome.agrees(), "verified call");
            outcomes.push(outcome);
        }

        let status = if outcomes.iter().all(CallOutcome::agrees) {
            VerificationStatus::Equivalent
        } else {
            VerificationStatus::Diverged
        };
        Ok(VerificationResult {
            method: self.method.clone(),
            status,
            calls: outcomes,
            summary: frozen.summary().clone(),
        })
    }

    /// Like [`verify`](Self::verify), failing on the first divergence.
    pub fn check(&self, store: &Store, root: ModuleId, calls: &[Vec<Literal>]) -> Result<FreezeSummary> {
        let result = self.verify(store, root, calls)?;
        if let Some(divergence) = result.divergence() {
            return Err(divergence.into());
        }
        Ok(result.summary)
    }
}

fn run(store: &mut Store, module: ModuleId, method: &str, args: &[Literal]) -> Result<Literal, String> {
    let args: Vec<Value> = args.iter().map(|l| store.heap.alloc_literal(l)).collect();
    let value = store.call(module, method, args).map_err(|e| e.to_string())?;
    Ok(normalize(store.heap.snapshot(&value)))
}

/// Module references differ between the two copies; compare them by kind.
fn normalize(literal: Literal) -> Literal {
    match literal {
        Literal::Module(_) => Literal::Str("<module>".to_string()),
        Literal::List(items) => Literal::List(items.into_iter().map(normalize).collect()),
        Literal::Tuple(items) => Literal::Tuple(items.into_iter().map(normalize).collect()),
        Literal::Dict(entries) => Literal::Dict(entries.into_iter().map(|(k, v)| (k, normalize(v))).collect()),
        other => other,
    }
}
