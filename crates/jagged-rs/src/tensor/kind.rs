//! Descriptor kinds and the capabilities each kind brings to the registry.
//!
//! A concrete tensor owns real data and receives counter-based nested ints.
//! Fake and functional tensors stand in for values during tracing; they
//! construct their own symbolic nested ints and are subject to the re-merge
//! heuristic applied on unflatten.

use serde::{Deserialize, Serialize};

/// Which extreme of a sequence to compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Extreme {
    Max,
    Min,
}

impl Extreme {
    /// Metadata cache key under which the extreme sequence length is stored.
    pub fn cache_key(self) -> &'static str {
        match self {
            Extreme::Max => "max_seqlen",
            Extreme::Min => "min_seqlen",
        }
    }
}

/// Computes an extreme value of a 1-D integer sequence. `None` for an empty input.
pub type ExtremeFn = fn(&[i64]) -> Option<i64>;

fn sequence_max(values: &[i64]) -> Option<i64> {
    values.iter().copied().max()
}

fn sequence_min(values: &[i64]) -> Option<i64> {
    values.iter().copied().min()
}

/// Runtime category of a tensor object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TensorKind {
    #[default]
    Concrete,
    Fake,
    Functional,
}

impl TensorKind {
    /// Whether descriptors of this kind build their own symbolic nested ints.
    pub fn provides_symbolic_constructor(self) -> bool {
        matches!(self, TensorKind::Fake | TensorKind::Functional)
    }

    /// The extreme-value capability used when a jagged tensor computes its
    /// sequence length bounds.
    pub fn default_extreme_fn(self, extreme: Extreme) -> ExtremeFn {
        match extreme {
            Extreme::Max => sequence_max,
            Extreme::Min => sequence_min,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TensorKind::Concrete => "concrete",
            TensorKind::Fake => "fake",
            TensorKind::Functional => "functional",
        }
    }
}
