//! # Modfreeze Core
//!
//! Freezing of hierarchical script modules: attributes that no reachable
//! method can observe changing are folded into the method graphs as
//! constants, and everything else is preserved by reference.
//!
//! ## Modules
//!
//! - **[`store`]** - Module arena, classes and free functions
//! - **[`value`]** - Attribute values and the storage heap
//! - **[`ir`]** - Method graph IR, builder and builtin semantics
//! - **[`interp`]** - Reference interpreter
//! - **[`dataflow`]** - Mutation detection over method graphs
//! - **[`interprocedural`]** - Call graph over module instances
//! - **[`freeze`]** - Alias analysis, preserved-set resolution, rewriting and
//!   class specialization
//!
//! ## Quick Start
//!
//! ```rust
//! use modfreeze_core::{freeze, AttrType, ClassType, GraphBuilder, Store, Value};
//!
//! let mut b = GraphBuilder::method(0);
//! let this = b.self_value();
//! let a = b.get_attr(this, "a");
//! let forward = b.finish(a);
//!
//! let mut store = Store::new();
//! let class = store.define_class(
//!     ClassType::new("M").with_attr("a", AttrType::Int).with_method("forward", forward),
//! );
//! let m = store.instantiate(class, "m").unwrap();
//! store.set_attr(m, "a", Value::Int(3)).unwrap();
//! store.eval(m).unwrap();
//!
//! let frozen = freeze(&mut store, m, &[], &[]).unwrap();
//! assert!(!frozen.hasattr(&store, "a"));
//! assert_eq!(frozen.forward(&mut store, vec![]).unwrap(), Value::Int(3));
//! ```

pub mod dataflow;
pub mod error;
pub mod freeze;
pub mod interp;
pub mod interprocedural;
pub mod ir;
pub mod module;
pub mod options;
pub mod store;
pub mod value;

pub use error::{ConfigError, EvalError, FreezeError, StoreError};
pub use freeze::{freeze, FreezePipeline, FreezeSummary, FrozenModule, PreserveReason, PreservedAttr};
pub use interp::Interpreter;
pub use ir::{Builtin, Graph, GraphBuilder, Op, ValueId};
pub use module::{AttrType, ClassId, ClassType, Module, ModuleId};
pub use options::FreezeOptions;
pub use store::Store;
pub use value::{DictKey, Heap, Literal, StorageId, TensorView, Value};
