//! Equivalence registry for ragged descriptors.
//!
//! Offsets and lengths tensors ("descriptors") are grouped into equivalence
//! classes with a [`UnionFind`] over object identity. Each class carries a
//! metadata dictionary and a set of weak references to its live members.
//! Both stores are keyed by the class's canonical descriptor only.
//!
//! ## Merge attribution
//!
//! `merge(src, tgt)` makes the old root of `tgt` the canonical key of the
//! joined class. The joined metadata and member set live under that key and
//! the slot of the old `src` root is overwritten with an invalidation marker.
//! A canonical key must therefore never be cached across a merge; always
//! re-resolve through [`EquivalenceRegistry::canonical`] (which every public
//! lookup does) before reading.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};

use super::counter::TensorCounter;
use super::error::RegistryError;
use super::union_find::UnionFind;
use crate::symbolic::{get_nested_int, NestedInt, NestedIntCtor, RegistryId, TensorId};
use crate::tensor::Tensor;
use crate::weak::WeakIdentityMap;

/// Registry behaviour switches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Check store invariants after every merge.
    pub validate_after_merge: bool,
    /// Dump the metadata store at debug level whenever a jagged tensor is built.
    pub log_metadata: bool,
}

impl RegistryConfig {
    /// Reads `JAGGED_VALIDATE_INVARIANTS` and `JAGGED_LOG_METADATA`.
    pub fn from_env() -> Self {
        RegistryConfig {
            validate_after_merge: crate::env::validate_invariants_enabled(),
            log_metadata: crate::env::log_metadata_enabled(),
        }
    }
}

/// Lazily computed facts about one equivalence class.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassMetadata {
    entries: BTreeMap<String, i64>,
}

impl ClassMetadata {
    pub const SUM_VEC: &'static str = "sum_vec";

    pub fn get(&self, key: &str) -> Option<i64> {
        self.entries.get(key).copied()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: i64) -> Option<i64> {
        self.entries.insert(key.into(), value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Total number of rows across the class (the leading dim of `values`).
    pub fn sum_vec(&self) -> Option<i64> {
        self.get(Self::SUM_VEC)
    }

    pub fn set_sum_vec(&mut self, sum: i64) {
        self.insert(Self::SUM_VEC, sum);
    }

    /// Folds `other` into `self`. Entries from `other` overwrite.
    pub fn update(&mut self, other: ClassMetadata) {
        self.entries.extend(other.entries);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), *value))
    }
}

/// Weak references to the members of one class.
#[derive(Default)]
struct MemberSet {
    members: Vec<Weak<Tensor>>,
}

impl MemberSet {
    fn insert(&mut self, vec: &Arc<Tensor>) {
        self.members.retain(|member| member.strong_count() > 0);
        let weak = Arc::downgrade(vec);
        if !self.members.iter().any(|member| member.ptr_eq(&weak)) {
            self.members.push(weak);
        }
    }

    fn extend(&mut self, other: MemberSet) {
        for member in other.members {
            if let Some(vec) = member.upgrade() {
                self.insert(&vec);
            }
        }
    }
}

enum Slot<T> {
    Live(T),
    Invalidated,
}

impl<T> Slot<T> {
    fn is_invalidated(&self) -> bool {
        matches!(self, Slot::Invalidated)
    }
}

impl<T: Default> Default for Slot<T> {
    fn default() -> Self {
        Slot::Live(T::default())
    }
}

/// Removes and returns the live value stored for a canonical key, or the
/// default when the key has no slot yet.
fn take_live<T: Default>(
    store: &mut WeakIdentityMap<Tensor, Slot<T>>,
    key: &Arc<Tensor>,
) -> Result<T, RegistryError> {
    if store.get(key).is_some_and(Slot::is_invalidated) {
        return Err(RegistryError::StaleCanonical);
    }
    Ok(match store.remove(key) {
        Some(Slot::Live(value)) => value,
        _ => T::default(),
    })
}

/// Lazy sequence of the live members of an equivalence class.
///
/// Members collected after the snapshot was taken are skipped.
pub struct EquivalentMembers {
    inner: std::vec::IntoIter<Weak<Tensor>>,
}

impl Iterator for EquivalentMembers {
    type Item = Arc<Tensor>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.by_ref().find_map(|member| member.upgrade())
    }
}

/// Owns the identity union-find, the id counter, and the per-class stores.
///
/// One registry is created per session and handed by reference to every
/// jagged construction, unflatten and dispatch call.
pub struct EquivalenceRegistry {
    id: RegistryId,
    config: RegistryConfig,
    counter: TensorCounter,
    union_find: UnionFind<Tensor>,
    metadata: WeakIdentityMap<Tensor, Slot<ClassMetadata>>,
    members: WeakIdentityMap<Tensor, Slot<MemberSet>>,
}

impl EquivalenceRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        let id = RegistryId::fresh();
        EquivalenceRegistry {
            id,
            config,
            counter: TensorCounter::new(id),
            union_find: UnionFind::new(),
            metadata: WeakIdentityMap::new(),
            members: WeakIdentityMap::new(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(RegistryConfig::from_env())
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Scope of every nested int and counter id this registry hands out.
    pub fn id(&self) -> RegistryId {
        self.id
    }

    /// Canonical descriptor of `vec`'s class, registering `vec` if unseen.
    pub fn canonical(&mut self, vec: &Arc<Tensor>) -> Arc<Tensor> {
        self.union_find.canonical(vec)
    }

    pub fn same_class(&mut self, a: &Arc<Tensor>, b: &Arc<Tensor>) -> bool {
        self.union_find.same_set(a, b)
    }

    /// Counter id of a descriptor object.
    pub fn tensor_id(&mut self, vec: &Arc<Tensor>) -> TensorId {
        self.counter.get_id(vec)
    }

    /// Number of live descriptors known to the registry.
    pub fn tracked_descriptors(&self) -> usize {
        self.union_find.len()
    }

    /// Physically drops every entry whose descriptor is gone.
    ///
    /// Stores sweep themselves once dead entries pile up; this forces a sweep
    /// now. The union-find goes first since dropping a member can release its
    /// class root.
    pub fn purge(&mut self) {
        self.union_find.purge();
        self.counter.purge();
        self.metadata.purge();
        self.members.purge();
    }

    fn track(&mut self, vec: &Arc<Tensor>) -> Result<(), RegistryError> {
        let canonical = self.union_find.canonical(vec);
        match self.members.get_or_default(&canonical) {
            Slot::Live(set) => {
                set.insert(vec);
                Ok(())
            }
            Slot::Invalidated => Err(RegistryError::StaleCanonical),
        }
    }

    /// Declares `src` and `tgt` structurally equal.
    ///
    /// The joined class keeps `tgt`'s former canonical key. Metadata entries
    /// from both sides are combined, with `tgt`'s class winning collisions.
    pub fn merge(&mut self, src: &Arc<Tensor>, tgt: &Arc<Tensor>) -> Result<(), RegistryError> {
        if Arc::ptr_eq(src, tgt) {
            return Ok(());
        }

        let canonical_src = self.union_find.canonical(src);
        let canonical_tgt = self.union_find.canonical(tgt);
        self.track(src)?;
        self.track(tgt)?;

        self.union_find.merge(src, tgt);
        let src_id = self.counter.get_id(src).index;
        let tgt_id = self.counter.get_id(tgt).index;
        tracing::debug!(src_id, tgt_id, "merging ragged descriptors");

        if Arc::ptr_eq(&canonical_src, &canonical_tgt) {
            return Ok(());
        }

        let mut merged = take_live(&mut self.metadata, &canonical_src)?;
        merged.update(take_live(&mut self.metadata, &canonical_tgt)?);
        self.metadata.insert(&canonical_tgt, Slot::Live(merged));
        self.metadata.insert(&canonical_src, Slot::Invalidated);

        let src_members = take_live(&mut self.members, &canonical_src)?;
        let mut tgt_members = take_live(&mut self.members, &canonical_tgt)?;
        tgt_members.extend(src_members);
        self.members.insert(&canonical_tgt, Slot::Live(tgt_members));
        self.members.insert(&canonical_src, Slot::Invalidated);

        tracing::trace!(
            invalidated = ?self.counter.peek(&canonical_src),
            canonical = ?self.counter.peek(&canonical_tgt),
            "invalidated merged canonical key"
        );

        if self.config.validate_after_merge {
            self.validate_invariants()?;
        }
        Ok(())
    }

    /// Asserts that two descriptors describe the same ragged structure.
    pub fn assume_equal(&mut self, a: &Arc<Tensor>, b: &Arc<Tensor>) -> Result<(), RegistryError> {
        self.merge(a, b)
    }

    /// Metadata of `vec`'s class, created empty on first use.
    pub fn get_metadata(&mut self, vec: &Arc<Tensor>) -> Result<&mut ClassMetadata, RegistryError> {
        let canonical = self.union_find.canonical(vec);
        self.track(vec)?;
        tracing::trace!(
            vec = ?self.counter.peek(vec),
            canonical = ?self.counter.peek(&canonical),
            "metadata lookup"
        );
        match self.metadata.get_or_default(&canonical) {
            Slot::Live(metadata) => Ok(metadata),
            Slot::Invalidated => Err(RegistryError::StaleCanonical),
        }
    }

    /// Reads the metadata slot of a key the caller believes is canonical,
    /// without re-resolving it.
    ///
    /// Fails with [`RegistryError::StaleCanonical`] if a merge has since
    /// invalidated the key. Returns `Ok(None)` if the key never stored metadata.
    pub fn metadata_for_key(
        &self,
        key: &Arc<Tensor>,
    ) -> Result<Option<&ClassMetadata>, RegistryError> {
        match self.metadata.get(key) {
            Some(Slot::Live(metadata)) => Ok(Some(metadata)),
            Some(Slot::Invalidated) => Err(RegistryError::StaleCanonical),
            None => Ok(None),
        }
    }

    /// All currently live descriptors in `vec`'s class.
    pub fn get_equivalent_members(
        &mut self,
        vec: &Arc<Tensor>,
    ) -> Result<EquivalentMembers, RegistryError> {
        let canonical = self.union_find.canonical(vec);
        self.track(vec)?;
        let snapshot = match self.members.get(&canonical) {
            Some(Slot::Live(set)) => set.members.clone(),
            Some(Slot::Invalidated) => return Err(RegistryError::StaleCanonical),
            None => Vec::new(),
        };
        Ok(EquivalentMembers {
            inner: snapshot.into_iter(),
        })
    }

    /// Builds the nested int for a descriptor.
    ///
    /// Traced descriptors without a custom constructor use their own symbolic
    /// factory with caching. Everything else goes through `ctor` (or the
    /// default constructor) with the descriptor's counter id; any caching is
    /// up to the constructor.
    pub fn create_symbolic_size(
        &mut self,
        vec: &Arc<Tensor>,
        ctor: Option<&NestedIntCtor<'_>>,
    ) -> Result<NestedInt, RegistryError> {
        self.track(vec)?;
        let kind = vec.kind();
        if ctor.is_none() && kind.provides_symbolic_constructor() {
            tracing::trace!(kind = kind.as_str(), "using descriptor's symbolic factory");
            return Ok(vec.create_nested_int(self.id, || NestedInt::symbolic(self.id, vec), true));
        }

        let id = self.counter.get_id(vec);
        tracing::trace!(id = id.index, custom = ctor.is_some(), "creating nested int");
        Ok(match ctor {
            Some(ctor) => ctor(id, vec),
            None => get_nested_int(id, vec),
        })
    }

    /// Whether two nested ints denote the same ragged structure.
    pub fn same_nested_int(&mut self, a: &NestedInt, b: &NestedInt) -> bool {
        if a == b {
            return true;
        }
        if a.coeff() != b.coeff() {
            return false;
        }
        match (a.vec(), b.vec()) {
            (Some(vec_a), Some(vec_b)) => self.same_class(&vec_a, &vec_b),
            _ => false,
        }
    }

    /// Checks that a key is canonical exactly when its slot is not invalidated.
    pub fn validate_invariants(&mut self) -> Result<(), RegistryError> {
        let metadata: Vec<_> = self
            .metadata
            .items()
            .into_iter()
            .map(|(key, slot)| (key, slot.is_invalidated()))
            .collect();
        let members: Vec<_> = self
            .members
            .items()
            .into_iter()
            .map(|(key, slot)| (key, slot.is_invalidated()))
            .collect();

        for (store, entries) in [("metadata", metadata), ("members", members)] {
            for (key, invalidated) in entries {
                let canonical = Arc::ptr_eq(&self.union_find.canonical(&key), &key);
                if canonical == invalidated {
                    return Err(RegistryError::InvariantViolation {
                        store,
                        canonical,
                        invalidated,
                    });
                }
            }
        }
        Ok(())
    }

    /// Dumps the metadata store at debug level.
    pub fn log_metadata(&self) {
        for (key, slot) in self.metadata.items() {
            let id = self.counter.peek(&key);
            match slot {
                Slot::Live(metadata) => {
                    tracing::debug!(id = ?id, facts = ?metadata.entries, "ragged class metadata")
                }
                Slot::Invalidated => tracing::debug!(id = ?id, "ragged class metadata invalidated"),
            }
        }
    }
}

impl Default for EquivalenceRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}
