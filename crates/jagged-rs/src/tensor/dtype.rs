//! Enumerates the scalar element types carried by host tensors.

use serde::{Deserialize, Serialize};

/// Logical dtype identifier shared by dense buffers and ragged descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit floating point following IEEE-754 semantics.
    F32,
    /// 32-bit signed integer.
    I32,
    /// 64-bit signed integer, the canonical dtype for offsets.
    I64,
}
