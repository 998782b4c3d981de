use thiserror::Error;

use crate::tensor::{DType, Device};

/// Misuse of the equivalence registry. These indicate a bug in the caller
/// (or in the registry) and are never recovered from silently.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("metadata requested through a canonical key that a merge invalidated")]
    StaleCanonical,
    #[error(
        "registry invariant violated in {store} store: canonical={canonical}, invalidated={invalidated}"
    )]
    InvariantViolation {
        store: &'static str,
        canonical: bool,
        invalidated: bool,
    },
}

/// Rejected jagged tensor construction.
#[derive(Debug, Error)]
pub enum JaggedError {
    #[error("jagged construction requires an offsets tensor")]
    MissingOffsets,
    #[error("jagged construction requires a values tensor")]
    MissingValues,
    #[error("offsets must be 1-D, found rank {rank}")]
    OffsetsNotRank1 { rank: usize },
    #[error("offsets must hold at least one entry")]
    EmptyOffsets,
    #[error("lengths must be 1-D, found rank {rank}")]
    LengthsNotRank1 { rank: usize },
    #[error("ragged_idx {ragged_idx} is out of range for values of rank {rank}")]
    InvalidRaggedIdx { ragged_idx: usize, rank: usize },
    #[error(
        "jagged values cannot require grad, please detach before passing them to the constructor"
    )]
    ValuesRequireGrad,
    #[error("outer size has no nested int at ragged_idx {ragged_idx}")]
    MissingNestedInt { ragged_idx: usize },
    #[error("when constructing a jagged tensor, all tensors in list must have the same dtype (found {first:?} and {other:?})")]
    DtypeMismatch { first: DType, other: DType },
    #[error("when constructing a jagged tensor, all tensors in list must be on the same device (found {first} and {other})")]
    DeviceMismatch { first: Device, other: Device },
    #[error(
        "cannot represent given tensor list as a jagged tensor; only shapes of the form \
         (B, *, D_0, D_1, ..., D_N) are supported, with only * allowed to be ragged"
    )]
    NotRepresentable,
    #[error("cannot build a jagged tensor from an empty tensor list")]
    EmptyList,
    #[error("start and length must broadcast to the batch size {batch_size}")]
    NotBroadcastable { batch_size: usize },
    #[error("tensor must be at least 2-D for the jagged narrow constructor, found rank {rank}")]
    NarrowRank { rank: usize },
    #[error("cannot compute {what} of a jagged tensor with an empty batch")]
    EmptyBatch { what: &'static str },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Tensor(#[from] anyhow::Error),
}
