//! # strata-nn
//!
//! Dynamic module trees for the strata dispatch framework.
//!
//! A [`Module`] is a named tree of computational units. Every parameter and
//! buffer lives in a shared, lockable [`Param`] slot so that forward hooks
//! can materialize and evict tensor data around the module's computation
//! without the module's cooperation. Tied parameters are expressed by sharing
//! one slot (or one storage) across several names.

pub mod args;
pub mod init;
pub mod linear;
pub mod module;

pub use args::{Args, Value};
pub use init::InitScope;
pub use linear::{linear, linear_from_weights, linear_with, LinearOp};
pub use module::{join_path, Module, ModuleHook, Op, Param, ParamSlot};
