//! Symbolic sizes for ragged dimensions.
//!
//! A [`NestedInt`] stands in for the per-row length of a jagged tensor. It is
//! not a number: it names an equivalence class of offsets/lengths descriptors,
//! and two jagged tensors whose ragged dims carry equal nested ints are
//! structurally compatible. Sizes and strides of a jagged tensor mix plain
//! integers with nested ints, which [`SymInt`] models.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};

use crate::tensor::Tensor;

static SYMBOL_COUNTER: AtomicU64 = AtomicU64::new(0);
static REGISTRY_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Process-unique identity of one equivalence registry.
///
/// Counter ids restart at zero in every registry, so nested ints and the
/// per-descriptor cache are both scoped by the registry that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistryId(u64);

impl RegistryId {
    /// Allocates an id no other registry in this process has.
    pub fn fresh() -> Self {
        RegistryId(REGISTRY_COUNTER.fetch_add(1, AtomicOrdering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// Counter id of a descriptor within one registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId {
    pub registry: RegistryId,
    pub index: u64,
}

/// Where the id of a nested int came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NestedIntOrigin {
    /// Allocated by the registry's tensor counter for a concrete descriptor.
    Counter,
    /// Allocated by a traced descriptor's own symbolic factory.
    Symbol,
}

#[derive(Debug)]
struct NestedIntNode {
    registry: RegistryId,
    id: u64,
    origin: NestedIntOrigin,
    vec: Weak<Tensor>,
}

/// Opaque handle for the not-yet-concrete length structure of a ragged dim.
///
/// Clones share the same node, so [`NestedInt::ptr_eq`] identifies handles
/// produced by one cached construction. The descriptor is held weakly; a
/// descriptor caching its own nested int therefore never keeps itself alive.
#[derive(Debug, Clone)]
pub struct NestedInt {
    node: Arc<NestedIntNode>,
    coeff: usize,
}

impl NestedInt {
    /// Creates a counter-backed nested int for `vec`.
    pub fn new(id: TensorId, vec: &Arc<Tensor>) -> Self {
        Self::with_origin(id.registry, id.index, NestedIntOrigin::Counter, vec)
    }

    /// Allocates a fresh symbol for a traced descriptor.
    pub fn symbolic(registry: RegistryId, vec: &Arc<Tensor>) -> Self {
        let id = SYMBOL_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
        Self::with_origin(registry, id, NestedIntOrigin::Symbol, vec)
    }

    fn with_origin(
        registry: RegistryId,
        id: u64,
        origin: NestedIntOrigin,
        vec: &Arc<Tensor>,
    ) -> Self {
        NestedInt {
            node: Arc::new(NestedIntNode {
                registry,
                id,
                origin,
                vec: Arc::downgrade(vec),
            }),
            coeff: 1,
        }
    }

    /// Registry that issued this nested int.
    pub fn registry(&self) -> RegistryId {
        self.node.registry
    }

    pub fn id(&self) -> u64 {
        self.node.id
    }

    pub fn origin(&self) -> NestedIntOrigin {
        self.node.origin
    }

    pub fn coeff(&self) -> usize {
        self.coeff
    }

    /// The descriptor this nested int was created for, if it is still alive.
    pub fn vec(&self) -> Option<Arc<Tensor>> {
        self.node.vec.upgrade()
    }

    /// Scales the nested int by a static factor (used for strides).
    pub fn mul(&self, factor: usize) -> NestedInt {
        NestedInt {
            node: Arc::clone(&self.node),
            coeff: self.coeff * factor,
        }
    }

    /// Rebinds this nested int to a new descriptor and a counter id, keeping
    /// the coefficient. The id comes from the registry's counter, so the
    /// result is counter-backed whatever the origin of `self`.
    pub fn clone_with_new_vec(&self, id: TensorId, vec: &Arc<Tensor>) -> NestedInt {
        NestedInt {
            node: Arc::new(NestedIntNode {
                registry: id.registry,
                id: id.index,
                origin: NestedIntOrigin::Counter,
                vec: Arc::downgrade(vec),
            }),
            coeff: self.coeff,
        }
    }

    /// Whether both handles come from the same construction.
    pub fn ptr_eq(&self, other: &NestedInt) -> bool {
        Arc::ptr_eq(&self.node, &other.node) && self.coeff == other.coeff
    }
}

impl PartialEq for NestedInt {
    fn eq(&self, other: &Self) -> bool {
        self.node.origin == other.node.origin
            && self.node.registry == other.node.registry
            && self.node.id == other.node.id
            && self.coeff == other.coeff
    }
}

impl Eq for NestedInt {}

impl fmt::Display for NestedInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.node.origin {
            NestedIntOrigin::Counter => 'j',
            NestedIntOrigin::Symbol => 's',
        };
        if self.coeff != 1 {
            write!(f, "{}*", self.coeff)?;
        }
        write!(f, "{prefix}{}", self.node.id)
    }
}

/// Custom nested int constructor: receives the descriptor's counter id and
/// the descriptor itself. Constructors may borrow from the caller's frame.
pub type NestedIntCtor<'a> = dyn Fn(TensorId, &Arc<Tensor>) -> NestedInt + 'a;

/// Default constructor: one nested int per descriptor object and registry,
/// cached on the descriptor so repeated calls hand back the same handle.
pub fn get_nested_int(id: TensorId, vec: &Arc<Tensor>) -> NestedInt {
    vec.create_nested_int(id.registry, || NestedInt::new(id, vec), true)
}

/// A size or stride entry that is either static or symbolic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymInt {
    Int(usize),
    Nested(NestedInt),
}

impl SymInt {
    pub fn as_int(&self) -> Option<usize> {
        match self {
            SymInt::Int(value) => Some(*value),
            SymInt::Nested(_) => None,
        }
    }

    pub fn as_nested(&self) -> Option<&NestedInt> {
        match self {
            SymInt::Int(_) => None,
            SymInt::Nested(nested) => Some(nested),
        }
    }

    pub fn is_nested(&self) -> bool {
        matches!(self, SymInt::Nested(_))
    }

    pub fn mul_usize(&self, factor: usize) -> SymInt {
        match self {
            SymInt::Int(value) => SymInt::Int(value * factor),
            SymInt::Nested(nested) => SymInt::Nested(nested.mul(factor)),
        }
    }
}

impl From<usize> for SymInt {
    fn from(value: usize) -> Self {
        SymInt::Int(value)
    }
}

impl From<NestedInt> for SymInt {
    fn from(value: NestedInt) -> Self {
        SymInt::Nested(value)
    }
}

impl fmt::Display for SymInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SymInt::Int(value) => write!(f, "{value}"),
            SymInt::Nested(nested) => write!(f, "{nested}"),
        }
    }
}
