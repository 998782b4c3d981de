//! Operation table consulted by the jagged dispatch hook.
//!
//! Operations that jagged tensors understand are registered under an
//! [`OpKey`]. Dispatch looks the key up and forwards the arguments unchanged;
//! a miss surfaces as [`DispatchError::NotImplemented`] so an outer layer can
//! retry through a generic path.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use thiserror::Error;

use crate::nested::{EquivalenceRegistry, JaggedTensor};
use crate::tensor::Tensor;

/// Identity of an operation (e.g., "add").
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct OpKey(&'static str);

impl OpKey {
    /// Creates a new key from a static identifier.
    pub const fn new(name: &'static str) -> Self {
        OpKey(name)
    }

    /// Returns the string representation of the key.
    pub fn as_str(self) -> &'static str {
        self.0
    }
}

/// Argument or result of a dispatched operation.
#[derive(Debug, Clone)]
pub enum OpValue {
    Jagged(JaggedTensor),
    Dense(Tensor),
    Scalar(f64),
}

impl OpValue {
    pub fn kind_name(&self) -> &'static str {
        match self {
            OpValue::Jagged(_) => "jagged",
            OpValue::Dense(_) => "dense",
            OpValue::Scalar(_) => "scalar",
        }
    }

    pub fn as_jagged(&self) -> Option<&JaggedTensor> {
        match self {
            OpValue::Jagged(jagged) => Some(jagged),
            _ => None,
        }
    }

    pub fn into_jagged(self) -> Option<JaggedTensor> {
        match self {
            OpValue::Jagged(jagged) => Some(jagged),
            _ => None,
        }
    }

    pub fn as_dense(&self) -> Option<&Tensor> {
        match self {
            OpValue::Dense(tensor) => Some(tensor),
            _ => None,
        }
    }
}

/// Fetches the jagged argument at `index` or fails with a descriptive error.
pub fn expect_jagged<'a>(args: &'a [OpValue], index: usize, op: OpKey) -> Result<&'a JaggedTensor> {
    match args.get(index) {
        Some(OpValue::Jagged(jagged)) => Ok(jagged),
        Some(other) => bail!(
            "{} expects a jagged tensor at argument {}, found {}",
            op.as_str(),
            index,
            other.kind_name()
        ),
        None => bail!("{} expects at least {} arguments", op.as_str(), index + 1),
    }
}

/// Jagged-aware implementation of an operation.
pub type JaggedOpFn =
    Arc<dyn Fn(&mut EquivalenceRegistry, &[OpValue]) -> Result<OpValue> + Send + Sync>;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("operation {op} not implemented for jagged layout")]
    NotImplemented { op: &'static str },
    #[error(transparent)]
    Kernel(#[from] anyhow::Error),
}

/// Table of jagged-aware operations keyed by [`OpKey`].
#[derive(Default, Clone)]
pub struct JaggedOpTable {
    ops: HashMap<OpKey, JaggedOpFn>,
}

impl JaggedOpTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `implementation` for `key`, replacing any previous entry.
    pub fn register<F>(&mut self, key: OpKey, implementation: F)
    where
        F: Fn(&mut EquivalenceRegistry, &[OpValue]) -> Result<OpValue> + Send + Sync + 'static,
    {
        if self.ops.insert(key, Arc::new(implementation)).is_some() {
            tracing::debug!(op = key.as_str(), "replaced jagged op implementation");
        }
    }

    pub fn lookup(&self, key: OpKey) -> Option<JaggedOpFn> {
        self.ops.get(&key).cloned()
    }

    pub fn contains(&self, key: OpKey) -> bool {
        self.ops.contains_key(&key)
    }

    /// Registered keys, sorted by name.
    pub fn keys(&self) -> Vec<OpKey> {
        let mut keys: Vec<_> = self.ops.keys().copied().collect();
        keys.sort_by_key(|key| key.as_str());
        keys
    }

    /// Routes `key` to its jagged implementation.
    pub fn dispatch(
        &self,
        registry: &mut EquivalenceRegistry,
        key: OpKey,
        args: &[OpValue],
    ) -> Result<OpValue, DispatchError> {
        let implementation = self
            .ops
            .get(&key)
            .ok_or(DispatchError::NotImplemented { op: key.as_str() })?;
        tracing::trace!(op = key.as_str(), args = args.len(), "jagged dispatch");
        Ok(implementation(registry, args)?)
    }

    /// Like [`JaggedOpTable::dispatch`], but a missing implementation runs
    /// `fallback` on the same arguments instead of failing.
    pub fn dispatch_or_fallback<F>(
        &self,
        registry: &mut EquivalenceRegistry,
        key: OpKey,
        args: &[OpValue],
        fallback: F,
    ) -> Result<OpValue, DispatchError>
    where
        F: FnOnce(&[OpValue]) -> Result<OpValue>,
    {
        match self.dispatch(registry, key, args) {
            Err(DispatchError::NotImplemented { op }) => {
                tracing::trace!(op, "jagged op missing, using fallback");
                Ok(fallback(args)?)
            }
            other => other,
        }
    }
}
