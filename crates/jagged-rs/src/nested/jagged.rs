//! Jagged tensors: a dense values buffer plus an offsets (or lengths) descriptor.
//!
//! A jagged tensor with logical shape `[B, x, D]` is backed by values of shape
//! `[sum(x), D]` and offsets of length `B + 1`. The ragged extent `x` is a
//! [`NestedInt`] obtained from the [`EquivalenceRegistry`], so two jagged
//! tensors built over the same (or merged) descriptors report equal sizes
//! without comparing offsets by value.
//!
//! Strides mix plain integers with nested ints as well: `[B, x, D]` with
//! contiguous values has strides `[x*D, D, 1]`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::error::JaggedError;
use super::state::EquivalenceRegistry;
use crate::symbolic::{NestedInt, SymInt, TensorId};
use crate::tensor::{DType, Device, Extreme, Tensor};

/// Symbolic sizes or strides of a jagged tensor.
pub type SymShape = SmallVec<[SymInt; 4]>;

/// Lazily computed per-tensor properties (sequence length extremes).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataCache(BTreeMap<String, i64>);

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache pre-filled with known sequence length bounds.
    pub fn with_seqlens(max_seqlen: i64, min_seqlen: i64) -> Self {
        let mut cache = Self::new();
        cache.insert(Extreme::Max.cache_key(), max_seqlen);
        cache.insert(Extreme::Min.cache_key(), min_seqlen);
        cache
    }

    pub fn get(&self, key: &str) -> Option<i64> {
        self.0.get(key).copied()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: i64) -> Option<i64> {
        self.0.insert(key.into(), value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Optional construction arguments.
#[derive(Debug, Clone)]
pub struct JaggedOptions {
    pub lengths: Option<Arc<Tensor>>,
    /// Logical dimension that is ragged. Must be in `1..=values.rank()`.
    pub ragged_idx: usize,
    pub requires_grad: bool,
    pub metadata_cache: Option<MetadataCache>,
}

impl Default for JaggedOptions {
    fn default() -> Self {
        JaggedOptions {
            lengths: None,
            ragged_idx: 1,
            requires_grad: false,
            metadata_cache: None,
        }
    }
}

impl JaggedOptions {
    pub fn with_lengths(mut self, lengths: Arc<Tensor>) -> Self {
        self.lengths = Some(lengths);
        self
    }

    pub fn with_ragged_idx(mut self, ragged_idx: usize) -> Self {
        self.ragged_idx = ragged_idx;
        self
    }

    pub fn with_requires_grad(mut self, requires_grad: bool) -> Self {
        self.requires_grad = requires_grad;
        self
    }

    pub fn with_metadata_cache(mut self, cache: MetadataCache) -> Self {
        self.metadata_cache = Some(cache);
        self
    }
}

/// Component tensors of a flattened jagged tensor.
///
/// Every field is optional so that a partially populated set coming back
/// across a boundary is rejected by [`JaggedTensor::unflatten`] rather than
/// by the type system.
#[derive(Debug, Clone, Default)]
pub struct InnerTensors {
    pub values: Option<Tensor>,
    pub offsets: Option<Arc<Tensor>>,
    pub lengths: Option<Arc<Tensor>>,
}

impl InnerTensors {
    /// Names of the populated components, in flatten order.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names = Vec::with_capacity(3);
        if self.values.is_some() {
            names.push("values");
        }
        if self.offsets.is_some() {
            names.push("offsets");
        }
        if self.lengths.is_some() {
            names.push("lengths");
        }
        names
    }
}

/// Non-tensor state carried next to the components of a flattened jagged tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlattenContext {
    pub requires_grad: bool,
    pub metadata_cache: MetadataCache,
    pub ragged_idx: usize,
}

/// Ragged tensor in the jagged layout.
#[derive(Debug, Clone)]
pub struct JaggedTensor {
    values: Tensor,
    offsets: Arc<Tensor>,
    lengths: Option<Arc<Tensor>>,
    ragged_idx: usize,
    ragged_size: NestedInt,
    size: SymShape,
    stride: SymShape,
    requires_grad: bool,
    metadata_cache: MetadataCache,
    dynamic_dims: BTreeSet<usize>,
}

impl JaggedTensor {
    /// Builds a jagged tensor over `values` with the given offsets.
    ///
    /// The ragged size is looked up (or created) in `registry` for `lengths`
    /// when present and `offsets` otherwise, and the class's `sum_vec` fact is
    /// set to the leading dim of `values`.
    pub fn new(
        registry: &mut EquivalenceRegistry,
        mut values: Tensor,
        offsets: Arc<Tensor>,
        options: JaggedOptions,
    ) -> Result<Self, JaggedError> {
        let JaggedOptions {
            lengths,
            ragged_idx,
            requires_grad,
            metadata_cache,
        } = options;

        if offsets.rank() != 1 {
            return Err(JaggedError::OffsetsNotRank1 {
                rank: offsets.rank(),
            });
        }
        if offsets.dims()[0] == 0 {
            return Err(JaggedError::EmptyOffsets);
        }
        if let Some(lengths) = &lengths {
            if lengths.rank() != 1 {
                return Err(JaggedError::LengthsNotRank1 {
                    rank: lengths.rank(),
                });
            }
        }
        let rank = values.rank();
        if ragged_idx == 0 || ragged_idx > rank {
            return Err(JaggedError::InvalidRaggedIdx { ragged_idx, rank });
        }
        if values.requires_grad_flag() {
            return Err(JaggedError::ValuesRequireGrad);
        }

        let ragged_source = lengths.as_ref().unwrap_or(&offsets);
        let ragged_size = registry.create_symbolic_size(ragged_source, None)?;
        registry
            .get_metadata(ragged_source)?
            .set_sum_vec(values.dims()[0] as i64);
        if registry.config().log_metadata {
            registry.log_metadata();
        }

        let batch = offsets.dims()[0] - 1;
        let dims = values.dims();
        let mut non_ragged: Vec<usize> = dims[..ragged_idx - 1].to_vec();
        non_ragged.extend_from_slice(&dims[ragged_idx..]);

        let mut size = SymShape::new();
        size.push(SymInt::Int(batch));
        size.extend(non_ragged[..ragged_idx - 1].iter().copied().map(SymInt::Int));
        size.push(SymInt::Nested(ragged_size.clone()));
        size.extend(non_ragged[ragged_idx - 1..].iter().copied().map(SymInt::Int));

        let values_stride = values.stride();
        let mut stride = SymShape::new();
        stride.push(SymInt::Nested(ragged_size.mul(values_stride[ragged_idx - 1])));
        stride.extend(values_stride.iter().copied().map(SymInt::Int));

        // The collapsed ragged dim is always dynamic.
        values.mark_dynamic(ragged_idx - 1);
        let mut dynamic_dims = BTreeSet::new();
        dynamic_dims.insert(ragged_idx);

        tracing::trace!(
            batch,
            ragged_idx,
            nested_int = %ragged_size,
            "constructed jagged tensor"
        );

        Ok(JaggedTensor {
            values,
            offsets,
            lengths,
            ragged_idx,
            ragged_size,
            size,
            stride,
            requires_grad,
            metadata_cache: metadata_cache.unwrap_or_default(),
            dynamic_dims,
        })
    }

    pub fn values(&self) -> &Tensor {
        &self.values
    }

    pub fn offsets(&self) -> &Arc<Tensor> {
        &self.offsets
    }

    pub fn lengths(&self) -> Option<&Arc<Tensor>> {
        self.lengths.as_ref()
    }

    /// The descriptor that backs the ragged size: lengths if present, else offsets.
    pub fn ragged_source(&self) -> &Arc<Tensor> {
        self.lengths.as_ref().unwrap_or(&self.offsets)
    }

    pub fn ragged_idx(&self) -> usize {
        self.ragged_idx
    }

    pub fn nested_int(&self) -> &NestedInt {
        &self.ragged_size
    }

    pub fn size(&self) -> &[SymInt] {
        &self.size
    }

    pub fn stride(&self) -> &[SymInt] {
        &self.stride
    }

    pub fn dim(&self) -> usize {
        self.size.len()
    }

    /// Number of rows (the batch dim).
    pub fn batch_size(&self) -> usize {
        self.offsets.dims()[0] - 1
    }

    pub fn dtype(&self) -> DType {
        self.values.dtype()
    }

    pub fn device(&self) -> Device {
        self.values.device()
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Contiguous jagged tensors carry no lengths.
    pub fn is_contiguous(&self) -> bool {
        self.lengths.is_none()
    }

    pub fn is_dynamic(&self, dim: usize) -> bool {
        self.dynamic_dims.contains(&dim)
    }

    pub fn metadata_cache(&self) -> &MetadataCache {
        &self.metadata_cache
    }

    pub fn metadata_cache_mut(&mut self) -> &mut MetadataCache {
        &mut self.metadata_cache
    }

    /// Longest row, computed once and cached.
    pub fn max_seqlen(&mut self) -> Result<i64, JaggedError> {
        let extreme_fn = self.ragged_source().kind().default_extreme_fn(Extreme::Max);
        self.seqlen_extreme_with(Extreme::Max, extreme_fn)
    }

    /// Shortest row, computed once and cached.
    pub fn min_seqlen(&mut self) -> Result<i64, JaggedError> {
        let extreme_fn = self.ragged_source().kind().default_extreme_fn(Extreme::Min);
        self.seqlen_extreme_with(Extreme::Min, extreme_fn)
    }

    /// Returns the cached extreme or computes it with `extreme_fn` over the
    /// row lengths (`lengths`, or `offsets.diff()` when contiguous).
    pub fn seqlen_extreme_with<F>(&mut self, extreme: Extreme, extreme_fn: F) -> Result<i64, JaggedError>
    where
        F: FnOnce(&[i64]) -> Option<i64>,
    {
        let key = extreme.cache_key();
        if let Some(value) = self.metadata_cache.get(key) {
            return Ok(value);
        }
        let row_lengths = match &self.lengths {
            Some(lengths) => lengths.to_i64_vec()?,
            None => self.offsets.diff()?,
        };
        let value = extreme_fn(&row_lengths).ok_or(JaggedError::EmptyBatch { what: key })?;
        self.metadata_cache.insert(key, value);
        Ok(value)
    }

    /// A jagged tensor with the same descriptors, ragged dim and cached
    /// properties over a new values buffer.
    pub fn with_values(
        &self,
        registry: &mut EquivalenceRegistry,
        values: Tensor,
    ) -> Result<Self, JaggedError> {
        let mut options = JaggedOptions::default()
            .with_ragged_idx(self.ragged_idx)
            .with_requires_grad(self.requires_grad)
            .with_metadata_cache(self.metadata_cache.clone());
        options.lengths = self.lengths.clone();
        JaggedTensor::new(registry, values, Arc::clone(&self.offsets), options)
    }

    /// Splits the tensor into its component tensors and context.
    pub fn flatten(&self) -> (InnerTensors, FlattenContext) {
        let inner = InnerTensors {
            values: Some(self.values.clone()),
            offsets: Some(Arc::clone(&self.offsets)),
            lengths: self.lengths.clone(),
        };
        let ctx = FlattenContext {
            requires_grad: self.requires_grad,
            metadata_cache: self.metadata_cache.clone(),
            ragged_idx: self.ragged_idx,
        };
        (inner, ctx)
    }

    /// Rebuilds a jagged tensor from flattened components.
    ///
    /// When the ragged descriptor is a traced tensor, the previous nested int
    /// (taken from `outer_size[ctx.ragged_idx]`) is rebound to the new
    /// descriptor, and if the new descriptor has the same runtime kind as the
    /// previous one the two are assumed to be equal and merged.
    pub fn unflatten(
        registry: &mut EquivalenceRegistry,
        inner: InnerTensors,
        ctx: FlattenContext,
        outer_size: &[SymInt],
    ) -> Result<Self, JaggedError> {
        let values = inner.values.ok_or(JaggedError::MissingValues)?;
        let offsets = inner.offsets.ok_or(JaggedError::MissingOffsets)?;
        let lengths = inner.lengths;
        let ragged_idx = ctx.ragged_idx;

        let vec = Arc::clone(lengths.as_ref().unwrap_or(&offsets));
        if vec.kind().provides_symbolic_constructor() {
            let old_nested_int = outer_size
                .get(ragged_idx)
                .and_then(SymInt::as_nested)
                .cloned()
                .ok_or(JaggedError::MissingNestedInt { ragged_idx })?;

            let use_cache = old_nested_int.coeff() == 1;
            let ctor = |id: TensorId, v: &Arc<Tensor>| {
                v.create_nested_int(
                    id.registry,
                    || old_nested_int.clone_with_new_vec(id, v),
                    use_cache,
                )
            };
            registry.create_symbolic_size(&vec, Some(&ctor))?;

            match old_nested_int.vec() {
                Some(old_vec) if old_vec.kind() == vec.kind() => {
                    tracing::debug!(
                        kind = vec.kind().as_str(),
                        "unflatten assumes new descriptor matches previous nested int"
                    );
                    registry.assume_equal(&vec, &old_vec)?;
                }
                Some(_) => {}
                None => tracing::debug!(
                    nested_int = %old_nested_int,
                    "previous descriptor was dropped, unflatten skips the re-merge"
                ),
            }
        }

        let mut options = JaggedOptions::default()
            .with_ragged_idx(ragged_idx)
            .with_requires_grad(ctx.requires_grad)
            .with_metadata_cache(ctx.metadata_cache);
        options.lengths = lengths;
        JaggedTensor::new(registry, values, offsets, options)
    }
}

/// Persisted form of a jagged tensor.
///
/// Only data is saved: sizes, strides and the nested int are tied to the
/// registry that built them, so [`JaggedTensor::from_record`] rebuilds them
/// through [`JaggedTensor::new`] and the loaded descriptors start a fresh
/// equivalence class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JaggedRecord {
    pub values: Tensor,
    pub offsets: Tensor,
    #[serde(default)]
    pub lengths: Option<Tensor>,
    pub ragged_idx: usize,
    #[serde(default)]
    pub requires_grad: bool,
    #[serde(default)]
    pub metadata_cache: MetadataCache,
}

impl JaggedTensor {
    pub fn to_record(&self) -> JaggedRecord {
        JaggedRecord {
            values: self.values.clone(),
            offsets: self.offsets.as_ref().clone(),
            lengths: self.lengths.as_deref().cloned(),
            ragged_idx: self.ragged_idx,
            requires_grad: self.requires_grad,
            metadata_cache: self.metadata_cache.clone(),
        }
    }

    pub fn from_record(
        registry: &mut EquivalenceRegistry,
        record: JaggedRecord,
    ) -> Result<Self, JaggedError> {
        let mut options = JaggedOptions::default()
            .with_ragged_idx(record.ragged_idx)
            .with_requires_grad(record.requires_grad)
            .with_metadata_cache(record.metadata_cache);
        options.lengths = record.lengths.map(Arc::new);
        JaggedTensor::new(registry, record.values, Arc::new(record.offsets), options)
    }
}

fn write_list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    f.write_str("(")?;
    for (index, item) in items.iter().enumerate() {
        if index > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    f.write_str(")")
}

impl fmt::Display for JaggedTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JaggedTensor(size=")?;
        write_list(f, &self.size)?;
        match self.offsets.to_i64_vec() {
            Ok(offsets) => write!(f, ", offsets={offsets:?}")?,
            Err(_) => write!(f, ", offsets=<{:?}>", self.offsets.dtype())?,
        }
        if self.requires_grad {
            f.write_str(", requires_grad=true")?;
        }
        write!(f, ", contiguous={})", self.is_contiguous())
    }
}
