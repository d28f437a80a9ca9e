//! Error types for the store, the reference interpreter and the freezing pass

use thiserror::Error;

/// Errors raised while building or mutating a [`Store`](crate::Store).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("class '{class}' does not declare an attribute named '{name}'")]
    UndeclaredAttribute { class: String, name: String },

    #[error("attribute '{name}' of class '{class}' is declared as {expected}, got {found}")]
    AttributeType {
        class: String,
        name: String,
        expected: String,
        found: String,
    },

    #[error("module '{child}' is already owned by '{owner}'")]
    AlreadyOwned { child: String, owner: String },

    #[error("attaching '{child}' under '{parent}' would make a module its own descendant")]
    OwnershipCycle { parent: String, child: String },

    #[error("unknown module id {0}")]
    UnknownModule(u32),

    #[error("unknown class id {0}")]
    UnknownClass(u32),
}

/// Errors raised by the reference interpreter.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EvalError {
    /// Invoking a method the module does not expose. On a frozen module this
    /// is how dropped helper methods surface.
    #[error("{class} does not have a field with name '{method}'")]
    MissingMethod { class: String, method: String },

    #[error("{class} does not have a field with name '{name}'")]
    MissingAttribute { class: String, name: String },

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("type error in {op}: {detail}")]
    Type { op: String, detail: String },

    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: i64, len: usize },

    #[error("key {0} not found")]
    MissingKey(String),

    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error("use of undefined value %{0}")]
    UndefinedValue(u32),

    #[error("method '{method}' expects {expected} arguments, got {found}")]
    Arity {
        method: String,
        expected: usize,
        found: usize,
    },

    #[error("call depth exceeded {0}")]
    CallDepth(usize),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EvalError {
    pub(crate) fn ty(op: &str, detail: impl Into<String>) -> Self {
        EvalError::Type {
            op: op.to_string(),
            detail: detail.into(),
        }
    }
}

/// Terminal failures of a freeze request. No partially frozen module is ever
/// produced alongside one of these.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FreezeError {
    #[error("Freezing module in training mode is not yet supported (module '{module}' has training=true)")]
    TrainingMode { module: String },

    #[error("attempted to freeze a module that return itself: method '{method}' of '{module}' returns '{returned}'")]
    SelfReturn {
        module: String,
        method: String,
        returned: String,
    },

    #[error("module contains attributes values that overlaps: '{attribute}' shares storage with preserved attribute '{other}'")]
    OverlappingAttributes { attribute: String, other: String },

    #[error("preserved name '{0}' is neither an attribute nor a method of the module")]
    UnknownPreservedName(String),

    #[error("'{attribute}' may hold any of {candidates} when '{member}' is used; dynamic dispatch is not supported")]
    DynamicModule {
        attribute: String,
        member: String,
        candidates: String,
    },

    #[error("malformed module: {0}")]
    Malformed(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors loading [`FreezeOptions`](crate::FreezeOptions) from disk.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read options file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid options file: {0}")]
    Json(#[from] serde_json::Error),
}
