//! Jagged implementations for a handful of elementwise operations.
//!
//! Each operation runs on the flat values buffer and rewraps the result over
//! the input's descriptors, so the output shares the input's nested int.

use anyhow::{bail, Result};

use super::registry::{expect_jagged, JaggedOpTable, OpKey, OpValue};
use crate::nested::EquivalenceRegistry;

pub const CLONE: OpKey = OpKey::new("clone");
pub const NEG: OpKey = OpKey::new("neg");
pub const ADD: OpKey = OpKey::new("add");

/// Table pre-populated with the built-in jagged operations.
pub fn default_jagged_ops() -> JaggedOpTable {
    let mut table = JaggedOpTable::new();
    table.register(CLONE, jagged_clone);
    table.register(NEG, jagged_neg);
    table.register(ADD, jagged_add);
    table
}

fn jagged_clone(registry: &mut EquivalenceRegistry, args: &[OpValue]) -> Result<OpValue> {
    let input = expect_jagged(args, 0, CLONE)?;
    let values = input.values().clone();
    Ok(OpValue::Jagged(input.with_values(registry, values)?))
}

fn jagged_neg(registry: &mut EquivalenceRegistry, args: &[OpValue]) -> Result<OpValue> {
    let input = expect_jagged(args, 0, NEG)?;
    let values = input.values().neg();
    Ok(OpValue::Jagged(input.with_values(registry, values)?))
}

fn jagged_add(registry: &mut EquivalenceRegistry, args: &[OpValue]) -> Result<OpValue> {
    let lhs = expect_jagged(args, 0, ADD)?;
    let rhs = expect_jagged(args, 1, ADD)?;
    if lhs.ragged_idx() != rhs.ragged_idx()
        || !registry.same_nested_int(lhs.nested_int(), rhs.nested_int())
    {
        bail!(
            "cannot add jagged tensors with different ragged structure: {} vs {}",
            lhs.nested_int(),
            rhs.nested_int()
        );
    }
    let values = lhs.values().add(rhs.values())?;
    Ok(OpValue::Jagged(lhs.with_values(registry, values)?))
}
