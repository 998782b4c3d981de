//! Host-backed tensor used for dense buffers and ragged descriptors.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{bail, ensure, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::{device::Device, dtype::DType, kind::TensorKind, shape::Shape};
use crate::symbolic::{NestedInt, RegistryId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Storage {
    F32(Vec<f32>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

impl Storage {
    fn dtype(&self) -> DType {
        match self {
            Storage::F32(_) => DType::F32,
            Storage::I32(_) => DType::I32,
            Storage::I64(_) => DType::I64,
        }
    }

    fn len(&self) -> usize {
        match self {
            Storage::F32(data) => data.len(),
            Storage::I32(data) => data.len(),
            Storage::I64(data) => data.len(),
        }
    }

    fn slice(&self, start: usize, end: usize) -> Storage {
        match self {
            Storage::F32(data) => Storage::F32(data[start..end].to_vec()),
            Storage::I32(data) => Storage::I32(data[start..end].to_vec()),
            Storage::I64(data) => Storage::I64(data[start..end].to_vec()),
        }
    }

    fn extend_from(&mut self, other: &Storage) -> Result<()> {
        match (self, other) {
            (Storage::F32(dst), Storage::F32(src)) => dst.extend_from_slice(src),
            (Storage::I32(dst), Storage::I32(src)) => dst.extend_from_slice(src),
            (Storage::I64(dst), Storage::I64(src)) => dst.extend_from_slice(src),
            (dst, src) => bail!(
                "storage dtype mismatch: {:?} vs {:?}",
                dst.dtype(),
                src.dtype()
            ),
        }
        Ok(())
    }

    fn empty(dtype: DType) -> Storage {
        match dtype {
            DType::F32 => Storage::F32(Vec::new()),
            DType::I32 => Storage::I32(Vec::new()),
            DType::I64 => Storage::I64(Vec::new()),
        }
    }

    fn cast(&self, dtype: DType) -> Storage {
        match (self, dtype) {
            (Storage::F32(data), DType::F32) => Storage::F32(data.clone()),
            (Storage::F32(data), DType::I32) => Storage::I32(data.iter().map(|&v| v as i32).collect()),
            (Storage::F32(data), DType::I64) => Storage::I64(data.iter().map(|&v| v as i64).collect()),
            (Storage::I32(data), DType::F32) => Storage::F32(data.iter().map(|&v| v as f32).collect()),
            (Storage::I32(data), DType::I32) => Storage::I32(data.clone()),
            (Storage::I32(data), DType::I64) => Storage::I64(data.iter().map(|&v| v as i64).collect()),
            (Storage::I64(data), DType::F32) => Storage::F32(data.iter().map(|&v| v as f32).collect()),
            (Storage::I64(data), DType::I32) => Storage::I32(data.iter().map(|&v| v as i32).collect()),
            (Storage::I64(data), DType::I64) => Storage::I64(data.clone()),
        }
    }
}

/// Simple host-backed tensor.
///
/// Every tensor is stored densely in row-major order. Shared ownership through
/// `Arc<Tensor>` is what gives a tensor an identity: the equivalence registry
/// keys offsets and lengths descriptors by their allocation, never by value.
#[derive(Debug)]
pub struct Tensor {
    shape: Shape,
    device: Device,
    storage: Storage,
    requires_grad: bool,
    kind: TensorKind,
    dynamic_dims: BTreeSet<usize>,
    nested_ints: Mutex<BTreeMap<RegistryId, NestedInt>>,
}

impl Clone for Tensor {
    /// Copies data and flags. The copy is a distinct object, so its cached
    /// nested ints start out empty.
    fn clone(&self) -> Self {
        Tensor {
            shape: self.shape.clone(),
            device: self.device,
            storage: self.storage.clone(),
            requires_grad: self.requires_grad,
            kind: self.kind,
            dynamic_dims: self.dynamic_dims.clone(),
            nested_ints: Mutex::default(),
        }
    }
}

impl Tensor {
    fn from_storage(shape: Shape, storage: Storage) -> Self {
        Tensor {
            shape,
            device: Device::Cpu,
            storage,
            requires_grad: false,
            kind: TensorKind::Concrete,
            dynamic_dims: BTreeSet::new(),
            nested_ints: Mutex::default(),
        }
    }

    /// Constructs an `F32` tensor from raw values, validating the length against the shape.
    pub fn from_f32(shape: Shape, data: Vec<f32>) -> Result<Self> {
        if data.len() != shape.num_elements() {
            bail!(
                "tensor data length ({}) does not match shape {:?}",
                data.len(),
                shape.dims()
            );
        }
        Ok(Tensor::from_storage(shape, Storage::F32(data)))
    }

    /// Constructs an `I32` tensor, ensuring the payload matches the expected element count.
    pub fn from_i32(shape: Shape, data: Vec<i32>) -> Result<Self> {
        if data.len() != shape.num_elements() {
            bail!(
                "tensor data length ({}) does not match shape {:?}",
                data.len(),
                shape.dims()
            );
        }
        Ok(Tensor::from_storage(shape, Storage::I32(data)))
    }

    /// Constructs an `I64` tensor, ensuring the payload matches the expected element count.
    pub fn from_i64(shape: Shape, data: Vec<i64>) -> Result<Self> {
        if data.len() != shape.num_elements() {
            bail!(
                "tensor data length ({}) does not match shape {:?}",
                data.len(),
                shape.dims()
            );
        }
        Ok(Tensor::from_storage(shape, Storage::I64(data)))
    }

    /// Builds a 1-D `I64` tensor, the usual form of an offsets descriptor.
    pub fn vector_i64(data: Vec<i64>) -> Self {
        let shape = Shape::new([data.len()]);
        Tensor::from_storage(shape, Storage::I64(data))
    }

    /// Returns a zero-initialized `F32` tensor of the requested shape.
    pub fn zeros(shape: Shape) -> Self {
        let len = shape.num_elements();
        Tensor::from_storage(shape, Storage::F32(vec![0.0; len]))
    }

    /// Returns the total number of elements stored in the tensor.
    pub fn len(&self) -> usize {
        self.shape.num_elements()
    }

    /// Reports whether the tensor contains zero elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    /// Row-major strides; host tensors are always contiguous.
    pub fn stride(&self) -> Vec<usize> {
        self.shape.contiguous_strides()
    }

    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn kind(&self) -> TensorKind {
        self.kind
    }

    /// Re-tags the tensor with a different runtime category.
    pub fn with_kind(mut self, kind: TensorKind) -> Self {
        self.kind = kind;
        self
    }

    /// Borrows `f32` data when the dtype matches.
    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.storage {
            Storage::F32(data) => Some(data),
            _ => None,
        }
    }

    /// Borrows `i32` data when the dtype matches.
    pub fn as_i32(&self) -> Option<&[i32]> {
        match &self.storage {
            Storage::I32(data) => Some(data),
            _ => None,
        }
    }

    /// Borrows `i64` data when the dtype matches.
    pub fn as_i64(&self) -> Option<&[i64]> {
        match &self.storage {
            Storage::I64(data) => Some(data),
            _ => None,
        }
    }

    /// Reads an integer tensor as `i64` values.
    pub fn to_i64_vec(&self) -> Result<Vec<i64>> {
        match &self.storage {
            Storage::I64(data) => Ok(data.clone()),
            Storage::I32(data) => Ok(data.iter().map(|&v| i64::from(v)).collect()),
            Storage::F32(_) => bail!("expected an integer tensor, found {:?}", self.dtype()),
        }
    }

    /// First-order difference of a 1-D integer tensor (`out[i] = x[i + 1] - x[i]`).
    pub fn diff(&self) -> Result<Vec<i64>> {
        ensure!(
            self.rank() == 1,
            "diff expects a 1-D tensor, found rank {}",
            self.rank()
        );
        let values = self.to_i64_vec()?;
        Ok(values.windows(2).map(|pair| pair[1] - pair[0]).collect())
    }

    /// Toggles gradient tracking.
    pub fn requires_grad(mut self, flag: bool) -> Self {
        self.requires_grad = flag;
        self
    }

    /// Returns the current gradient tracking flag.
    pub fn requires_grad_flag(&self) -> bool {
        self.requires_grad
    }

    /// Returns a copy that does not track gradients.
    pub fn detach(&self) -> Self {
        self.clone().requires_grad(false)
    }

    /// Records that `dim` must be treated as dynamically shaped downstream.
    pub fn mark_dynamic(&mut self, dim: usize) {
        self.dynamic_dims.insert(dim);
    }

    pub fn is_dynamic(&self, dim: usize) -> bool {
        self.dynamic_dims.contains(&dim)
    }

    pub fn dynamic_dims(&self) -> impl Iterator<Item = usize> + '_ {
        self.dynamic_dims.iter().copied()
    }

    fn nested_int_cache(&self) -> MutexGuard<'_, BTreeMap<RegistryId, NestedInt>> {
        // The cache holds plain handles, so a poisoned lock still has usable data.
        self.nested_ints.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Per-object nested int factory.
    ///
    /// With `use_cache` the first nested int created for `registry` is stored
    /// on this tensor and returned by every later cached call from that
    /// registry; without it `creation_fn` runs unconditionally and nothing is
    /// stored.
    pub fn create_nested_int<F>(&self, registry: RegistryId, creation_fn: F, use_cache: bool) -> NestedInt
    where
        F: FnOnce() -> NestedInt,
    {
        if !use_cache {
            return creation_fn();
        }
        if let Some(cached) = self.nested_int_cache().get(&registry) {
            return cached.clone();
        }
        // Built outside the lock: constructors may look at this tensor again.
        let created = creation_fn();
        self.nested_int_cache()
            .entry(registry)
            .or_insert(created)
            .clone()
    }

    /// The nested int cached on this tensor for `registry`, if any.
    pub fn cached_nested_int(&self, registry: RegistryId) -> Option<NestedInt> {
        self.nested_int_cache().get(&registry).cloned()
    }

    /// Concatenates tensors along the first axis.
    pub fn cat_rows(tensors: &[&Tensor]) -> Result<Tensor> {
        let Some(first) = tensors.first() else {
            bail!("cat_rows expects at least one tensor");
        };
        let trailing = &first.dims()[1..];
        let mut rows = 0;
        let mut storage = Storage::empty(first.dtype());
        for tensor in tensors {
            ensure!(
                tensor.dtype() == first.dtype(),
                "cat_rows dtype mismatch: {:?} vs {:?}",
                tensor.dtype(),
                first.dtype()
            );
            ensure!(
                &tensor.dims()[1..] == trailing,
                "cat_rows trailing dims mismatch: {:?} vs {:?}",
                tensor.dims(),
                first.dims()
            );
            rows += tensor.dims()[0];
            storage.extend_from(&tensor.storage)?;
        }
        let mut dims = vec![rows];
        dims.extend_from_slice(trailing);
        let mut out = Tensor::from_storage(Shape::new(dims), storage);
        out.device = first.device;
        out.requires_grad = tensors.iter().any(|tensor| tensor.requires_grad);
        Ok(out)
    }

    /// Reinterprets the buffer under a new shape with the same element count.
    pub fn reshape<D: Into<Vec<usize>>>(&self, dims: D) -> Result<Tensor> {
        let shape = Shape::new(dims);
        ensure!(
            shape.num_elements() == self.len(),
            "cannot reshape {:?} into {:?}",
            self.dims(),
            shape.dims()
        );
        let mut out = self.clone();
        out.shape = shape;
        out.dynamic_dims.clear();
        Ok(out)
    }

    /// Copies rows `start..end` of the first axis.
    pub fn slice_rows(&self, start: usize, end: usize) -> Result<Tensor> {
        let rows = self.dims()[0];
        ensure!(
            start <= end && end <= rows,
            "row slice {}..{} out of bounds for {} rows",
            start,
            end,
            rows
        );
        let row_len: usize = self.dims()[1..].iter().product();
        let mut dims = self.dims().to_vec();
        dims[0] = end - start;
        let mut out = Tensor::from_storage(
            Shape::new(dims),
            self.storage.slice(start * row_len, end * row_len),
        );
        out.device = self.device;
        out.kind = self.kind;
        Ok(out)
    }

    /// Converts the element type, keeping shape and placement.
    pub fn to_dtype(&self, dtype: DType) -> Tensor {
        if dtype == self.dtype() {
            return self.clone();
        }
        let mut out = self.clone();
        out.storage = self.storage.cast(dtype);
        out
    }

    /// Re-tags the tensor with a different device.
    pub fn to_device(&self, device: Device) -> Tensor {
        let mut out = self.clone();
        out.device = device;
        out
    }

    /// Elementwise negation.
    pub fn neg(&self) -> Tensor {
        let mut out = self.clone();
        out.storage = match &self.storage {
            Storage::F32(data) => Storage::F32(data.iter().map(|v| -v).collect()),
            Storage::I32(data) => Storage::I32(data.iter().map(|v| -v).collect()),
            Storage::I64(data) => Storage::I64(data.iter().map(|v| -v).collect()),
        };
        out
    }

    /// Elementwise addition of two tensors with identical shape and dtype.
    pub fn add(&self, rhs: &Tensor) -> Result<Tensor> {
        ensure!(
            self.shape == rhs.shape,
            "add shape mismatch: {:?} vs {:?}",
            self.dims(),
            rhs.dims()
        );
        let storage = match (&self.storage, &rhs.storage) {
            (Storage::F32(a), Storage::F32(b)) => {
                Storage::F32(a.iter().zip(b).map(|(x, y)| x + y).collect())
            }
            (Storage::I32(a), Storage::I32(b)) => {
                Storage::I32(a.iter().zip(b).map(|(x, y)| x + y).collect())
            }
            (Storage::I64(a), Storage::I64(b)) => {
                Storage::I64(a.iter().zip(b).map(|(x, y)| x + y).collect())
            }
            (a, b) => bail!("add dtype mismatch: {:?} vs {:?}", a.dtype(), b.dtype()),
        };
        debug_assert_eq!(storage.len(), self.len());
        let mut out = self.clone();
        out.storage = storage;
        Ok(out)
    }
}

impl PartialEq for Tensor {
    /// Value equality over shape, dtype, device and data. Identity questions go
    /// through `Arc::ptr_eq` instead.
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape && self.device == other.device && self.storage == other.storage
    }
}

/// Persisted form of a tensor: data and flags, without identity-bound state
/// (cached nested ints, dynamic dim hints).
#[derive(Serialize, Deserialize)]
struct TensorRecord {
    dims: Vec<usize>,
    #[serde(default)]
    device: Device,
    #[serde(default)]
    kind: TensorKind,
    #[serde(default)]
    requires_grad: bool,
    data: Storage,
}

impl Serialize for Tensor {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        TensorRecord {
            dims: self.dims().to_vec(),
            device: self.device,
            kind: self.kind,
            requires_grad: self.requires_grad,
            data: self.storage.clone(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Tensor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let record = TensorRecord::deserialize(deserializer)?;
        if record.dims.is_empty() {
            return Err(serde::de::Error::custom("tensor must have at least one dimension"));
        }
        let shape = Shape::new(record.dims);
        if shape.num_elements() != record.data.len() {
            return Err(serde::de::Error::custom(format!(
                "tensor data holds {} elements but shape {:?} needs {}",
                record.data.len(),
                shape.dims(),
                shape.num_elements()
            )));
        }
        let mut tensor = Tensor::from_storage(shape, record.data);
        tensor.device = record.device;
        tensor.kind = record.kind;
        tensor.requires_grad = record.requires_grad;
        Ok(tensor)
    }
}
