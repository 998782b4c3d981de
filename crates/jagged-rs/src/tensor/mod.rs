//! Core tensor abstractions backing jagged tensors.
//!
//! The tensor module defines shapes, dtypes, device tags, descriptor kinds and
//! the host tensor used both as the dense values buffer and as the offsets or
//! lengths descriptor of a jagged tensor.

pub mod device;
pub mod dtype;
mod host_tensor;
pub mod kind;
pub mod shape;

pub use device::Device;
pub use dtype::DType;
pub use host_tensor::Tensor;
pub use kind::{Extreme, ExtremeFn, TensorKind};
pub use shape::Shape;
