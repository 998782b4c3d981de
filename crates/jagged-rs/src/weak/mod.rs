//! Identity-keyed containers that hold their keys weakly.

mod identity_map;

pub use identity_map::WeakIdentityMap;
