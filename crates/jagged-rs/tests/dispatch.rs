use std::sync::Arc;

use anyhow::Result;
use jagged_rs::nested::{jagged_from_list, EquivalenceRegistry, JaggedTensor};
use jagged_rs::ops::builtin::{ADD, CLONE, NEG};
use jagged_rs::ops::{default_jagged_ops, DispatchError, JaggedOpTable, OpKey, OpValue};
use jagged_rs::tensor::{Shape, Tensor};

fn build(registry: &mut EquivalenceRegistry, lens: &[usize], offsets: Option<Arc<Tensor>>) -> Result<JaggedTensor> {
    let parts = lens
        .iter()
        .map(|&rows| Tensor::from_f32(Shape::new([rows, 2]), (0..rows * 2).map(|i| i as f32).collect()))
        .collect::<Result<Vec<_>>>()?;
    let (jagged, _) = jagged_from_list(registry, &parts, offsets, None, None)?;
    Ok(jagged)
}

fn as_jagged(value: OpValue) -> JaggedTensor {
    value.into_jagged().expect("op should return a jagged tensor")
}

#[test]
fn default_table_lists_builtin_ops() {
    let table = default_jagged_ops();
    let names: Vec<_> = table.keys().into_iter().map(OpKey::as_str).collect();
    assert_eq!(names, vec!["add", "clone", "neg"]);
    assert!(table.contains(NEG));
    assert!(!table.contains(OpKey::new("matmul")));
}

#[test]
fn unary_ops_keep_the_ragged_structure() -> Result<()> {
    let mut registry = EquivalenceRegistry::default();
    let table = default_jagged_ops();
    let input = build(&mut registry, &[2, 1], None)?;

    let negated = as_jagged(table.dispatch(&mut registry, NEG, &[OpValue::Jagged(input.clone())])?);
    assert!(Arc::ptr_eq(negated.offsets(), input.offsets()));
    assert_eq!(negated.size(), input.size());
    assert_eq!(negated.values().as_f32(), Some(&[-0.0, -1.0, -2.0, -3.0, -0.0, -1.0][..]));

    let cloned = as_jagged(table.dispatch(&mut registry, CLONE, &[OpValue::Jagged(input.clone())])?);
    assert_eq!(cloned.values(), input.values());
    assert!(cloned.nested_int().ptr_eq(input.nested_int()));
    Ok(())
}

#[test]
fn add_requires_equivalent_nested_ints() -> Result<()> {
    let mut registry = EquivalenceRegistry::default();
    let table = default_jagged_ops();
    let lhs = build(&mut registry, &[1, 2], None)?;
    let rhs = build(&mut registry, &[1, 2], None)?;

    let args = [OpValue::Jagged(lhs.clone()), OpValue::Jagged(rhs.clone())];
    let err = table.dispatch(&mut registry, ADD, &args).unwrap_err();
    assert!(matches!(err, DispatchError::Kernel(_)));
    assert!(err.to_string().contains("different ragged structure"));

    registry.assume_equal(lhs.offsets(), rhs.offsets())?;
    let sum = as_jagged(table.dispatch(&mut registry, ADD, &args)?);
    assert_eq!(sum.values().as_f32(), Some(&[0.0, 2.0, 0.0, 2.0, 4.0, 6.0][..]));
    assert!(Arc::ptr_eq(sum.offsets(), lhs.offsets()));
    Ok(())
}

#[test]
fn add_over_shared_offsets_needs_no_merge() -> Result<()> {
    let mut registry = EquivalenceRegistry::default();
    let table = default_jagged_ops();
    let lhs = build(&mut registry, &[3], None)?;
    let rhs = build(&mut registry, &[3], Some(Arc::clone(lhs.offsets())))?;

    let out = table.dispatch(
        &mut registry,
        ADD,
        &[OpValue::Jagged(lhs), OpValue::Jagged(rhs)],
    )?;
    assert!(out.as_jagged().is_some());
    Ok(())
}

#[test]
fn missing_ops_report_not_implemented_or_fall_back() -> Result<()> {
    let mut registry = EquivalenceRegistry::default();
    let table = default_jagged_ops();
    let input = build(&mut registry, &[1], None)?;
    let args = [OpValue::Jagged(input)];
    let sum_op = OpKey::new("sum");

    let err = table.dispatch(&mut registry, sum_op, &args).unwrap_err();
    assert!(matches!(err, DispatchError::NotImplemented { op: "sum" }));

    let out = table.dispatch_or_fallback(&mut registry, sum_op, &args, |args| {
        let values = args[0].as_jagged().expect("jagged input").values();
        let total = values.as_f32().map(|data| data.iter().sum::<f32>()).unwrap_or_default();
        Ok(OpValue::Scalar(f64::from(total)))
    })?;
    assert!(matches!(out, OpValue::Scalar(total) if total == 1.0));
    Ok(())
}

#[test]
fn registered_ops_replace_previous_entries() -> Result<()> {
    let mut registry = EquivalenceRegistry::default();
    let mut table = JaggedOpTable::new();
    table.register(NEG, |_, _| Ok(OpValue::Scalar(1.0)));
    table.register(NEG, |_, _| Ok(OpValue::Scalar(2.0)));

    let out = table.dispatch(&mut registry, NEG, &[])?;
    assert!(matches!(out, OpValue::Scalar(value) if value == 2.0));

    let implementation = table.lookup(NEG).expect("registered");
    assert!(matches!(implementation(&mut registry, &[])?, OpValue::Scalar(_)));
    Ok(())
}

#[test]
fn ops_reject_non_jagged_arguments() {
    let mut registry = EquivalenceRegistry::default();
    let table = default_jagged_ops();
    let dense = OpValue::Dense(Tensor::zeros(Shape::new([2])));
    let err = table.dispatch(&mut registry, NEG, &[dense]).unwrap_err();
    assert!(err.to_string().contains("expects a jagged tensor"));

    let err = table.dispatch(&mut registry, NEG, &[]).unwrap_err();
    assert!(err.to_string().contains("at least 1 arguments"));
}
