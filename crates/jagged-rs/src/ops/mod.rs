//! Dispatch of operations on jagged tensors.

pub mod builtin;
pub mod registry;

pub use builtin::default_jagged_ops;
pub use registry::{expect_jagged, DispatchError, JaggedOpFn, JaggedOpTable, OpKey, OpValue};
