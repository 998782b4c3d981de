//! Jagged tensors and the equivalence registry behind their ragged sizes.
//!
//! Components, leaf first:
//!
//! - [`UnionFind`]: disjoint sets over descriptor identities.
//! - [`TensorCounter`]: per-object ids handed to nested int constructors.
//! - [`EquivalenceRegistry`]: merge, per-class metadata, member enumeration
//!   and nested int construction.
//! - [`JaggedTensor`]: values + offsets/lengths with a registry-backed
//!   ragged size, plus flatten/unflatten.

mod constructors;
mod counter;
mod error;
mod jagged;
mod state;
mod union_find;

pub use constructors::{buffer_from_jagged, jagged_from_list, jagged_from_tensor_and_lengths};
pub use counter::TensorCounter;
pub use error::{JaggedError, RegistryError};
pub use jagged::{
    FlattenContext, InnerTensors, JaggedOptions, JaggedRecord, JaggedTensor, MetadataCache,
    SymShape,
};
pub use state::{ClassMetadata, EquivalenceRegistry, EquivalentMembers, RegistryConfig};
pub use union_find::UnionFind;
