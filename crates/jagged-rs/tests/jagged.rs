use std::sync::Arc;

use anyhow::Result;
use jagged_rs::nested::{
    buffer_from_jagged, jagged_from_list, jagged_from_tensor_and_lengths, EquivalenceRegistry,
    JaggedError, JaggedOptions, JaggedRecord, JaggedTensor, MetadataCache,
};
use jagged_rs::symbolic::SymInt;
use jagged_rs::tensor::{DType, Device, Extreme, Shape, Tensor};

fn rows(count: usize, width: usize, start: f32) -> Result<Tensor> {
    let data = (0..count * width).map(|i| start + i as f32).collect();
    Tensor::from_f32(Shape::new([count, width]), data)
}

fn nested_at(size: &[SymInt], dim: usize) -> &jagged_rs::NestedInt {
    size[dim].as_nested().expect("ragged dim should be symbolic")
}

#[test]
fn from_list_builds_offsets_and_sizes() -> Result<()> {
    let mut registry = EquivalenceRegistry::default();
    let parts = [rows(3, 2, 0.0)?, rows(2, 2, 6.0)?];

    let (mut jagged, offsets) = jagged_from_list(&mut registry, &parts, None, None, None)?;
    assert_eq!(offsets.to_i64_vec()?, vec![0, 3, 5]);
    assert!(Arc::ptr_eq(jagged.offsets(), &offsets));
    assert_eq!(jagged.values().dims(), &[5, 2]);
    assert_eq!(jagged.dim(), 3);
    assert_eq!(jagged.batch_size(), 2);
    assert!(jagged.is_contiguous());

    let size = jagged.size();
    assert_eq!(size[0], SymInt::Int(2));
    assert_eq!(size[2], SymInt::Int(2));
    let ragged = nested_at(size, 1).clone();
    assert_eq!(&ragged, jagged.nested_int());

    let stride = jagged.stride();
    assert_eq!(stride.len(), 3);
    assert_eq!(stride[0], SymInt::Nested(ragged.mul(2)));
    assert_eq!(&stride[1..], &[SymInt::Int(2), SymInt::Int(1)]);

    assert_eq!(jagged.max_seqlen()?, 3);
    assert_eq!(jagged.min_seqlen()?, 2);
    assert_eq!(
        registry.get_metadata(&offsets)?.sum_vec(),
        Some(5),
        "sum_vec tracks the values leading dim"
    );
    Ok(())
}

#[test]
fn ragged_dim_is_marked_dynamic() -> Result<()> {
    let mut registry = EquivalenceRegistry::default();
    let parts = [rows(1, 3, 0.0)?, rows(4, 3, 0.0)?];
    let (jagged, _) = jagged_from_list(&mut registry, &parts, None, None, None)?;
    assert!(jagged.is_dynamic(1));
    assert!(!jagged.is_dynamic(0));
    assert!(jagged.values().is_dynamic(0));
    Ok(())
}

#[test]
fn shared_offsets_give_equal_sizes() -> Result<()> {
    let mut registry = EquivalenceRegistry::default();
    let parts = [rows(2, 4, 0.0)?, rows(1, 4, 0.0)?];
    let (first, offsets) = jagged_from_list(&mut registry, &parts, None, None, None)?;
    let (second, _) = jagged_from_list(&mut registry, &parts, Some(Arc::clone(&offsets)), None, None)?;

    assert_eq!(first.size(), second.size());
    assert!(first.nested_int().ptr_eq(second.nested_int()));
    Ok(())
}

#[test]
fn distinct_offsets_differ_until_assumed_equal() -> Result<()> {
    let mut registry = EquivalenceRegistry::default();
    let parts = [rows(2, 4, 0.0)?, rows(1, 4, 0.0)?];
    let (first, first_offsets) = jagged_from_list(&mut registry, &parts, None, None, None)?;
    let (second, second_offsets) = jagged_from_list(&mut registry, &parts, None, None, None)?;

    assert_ne!(first.size(), second.size());
    assert!(!registry.same_nested_int(first.nested_int(), second.nested_int()));

    registry.assume_equal(&first_offsets, &second_offsets)?;
    assert!(registry.same_nested_int(first.nested_int(), second.nested_int()));
    Ok(())
}

#[test]
fn from_list_applies_dtype_and_device() -> Result<()> {
    let mut registry = EquivalenceRegistry::default();
    let parts = [rows(2, 1, 0.0)?, rows(3, 1, 0.0)?];
    let (jagged, offsets) = jagged_from_list(
        &mut registry,
        &parts,
        None,
        Some(DType::I64),
        Some(Device::Cuda(0)),
    )?;
    assert_eq!(jagged.dtype(), DType::I64);
    assert_eq!(jagged.device(), Device::Cuda(0));
    assert_eq!(offsets.device(), Device::Cuda(0));
    Ok(())
}

#[test]
fn from_list_rejects_bad_inputs() -> Result<()> {
    let mut registry = EquivalenceRegistry::default();

    let err = jagged_from_list(&mut registry, &[], None, None, None).unwrap_err();
    assert!(matches!(err, JaggedError::EmptyList));

    let ints = Tensor::from_i32(Shape::new([1, 2]), vec![1, 2])?;
    let err = jagged_from_list(&mut registry, &[rows(1, 2, 0.0)?, ints], None, None, None)
        .unwrap_err();
    assert!(matches!(
        err,
        JaggedError::DtypeMismatch {
            first: DType::F32,
            other: DType::I32
        }
    ));

    let moved = rows(1, 2, 0.0)?.to_device(Device::Cuda(1));
    let err = jagged_from_list(&mut registry, &[rows(1, 2, 0.0)?, moved], None, None, None)
        .unwrap_err();
    assert!(matches!(err, JaggedError::DeviceMismatch { .. }));

    let err = jagged_from_list(&mut registry, &[rows(2, 2, 0.0)?, rows(2, 3, 0.0)?], None, None, None)
        .unwrap_err();
    assert!(matches!(err, JaggedError::NotRepresentable));
    assert!(err.to_string().contains("only * allowed to be ragged"));
    Ok(())
}

#[test]
fn constructor_validates_descriptors_and_values() -> Result<()> {
    let mut registry = EquivalenceRegistry::default();
    let offsets = Arc::new(Tensor::vector_i64(vec![0, 2, 3]));

    let square = Arc::new(Tensor::from_i64(Shape::new([2, 2]), vec![0, 1, 2, 3])?);
    let err = JaggedTensor::new(&mut registry, rows(3, 2, 0.0)?, square, JaggedOptions::default())
        .unwrap_err();
    assert!(matches!(err, JaggedError::OffsetsNotRank1 { rank: 2 }));

    let empty = Arc::new(Tensor::vector_i64(Vec::new()));
    let err = JaggedTensor::new(&mut registry, rows(3, 2, 0.0)?, empty, JaggedOptions::default())
        .unwrap_err();
    assert!(matches!(err, JaggedError::EmptyOffsets));

    let err = JaggedTensor::new(
        &mut registry,
        rows(3, 2, 0.0)?,
        Arc::clone(&offsets),
        JaggedOptions::default().with_ragged_idx(3),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        JaggedError::InvalidRaggedIdx {
            ragged_idx: 3,
            rank: 2
        }
    ));

    let err = JaggedTensor::new(
        &mut registry,
        rows(3, 2, 0.0)?.requires_grad(true),
        Arc::clone(&offsets),
        JaggedOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, JaggedError::ValuesRequireGrad));

    let lengths = Arc::new(Tensor::from_i64(Shape::new([1, 2]), vec![2, 1])?);
    let err = JaggedTensor::new(
        &mut registry,
        rows(3, 2, 0.0)?,
        offsets,
        JaggedOptions::default().with_lengths(lengths),
    )
    .unwrap_err();
    assert!(matches!(err, JaggedError::LengthsNotRank1 { rank: 2 }));
    Ok(())
}

#[test]
fn requires_grad_is_carried_by_the_wrapper() -> Result<()> {
    let mut registry = EquivalenceRegistry::default();
    let parts = [
        rows(2, 2, 0.0)?.requires_grad(true),
        rows(1, 2, 0.0)?.requires_grad(true),
    ];
    let (jagged, _) = jagged_from_list(&mut registry, &parts, None, None, None)?;
    assert!(jagged.requires_grad());
    assert!(!jagged.values().requires_grad_flag());
    assert_eq!(buffer_from_jagged(&jagged), jagged.values());
    Ok(())
}

#[test]
fn sequence_lengths_are_computed_once_and_cached() -> Result<()> {
    let mut registry = EquivalenceRegistry::default();
    let offsets = Arc::new(Tensor::vector_i64(vec![0, 1, 4, 6]));
    let mut jagged = JaggedTensor::new(
        &mut registry,
        rows(6, 2, 0.0)?,
        offsets,
        JaggedOptions::default(),
    )?;
    assert!(jagged.metadata_cache().is_empty());

    assert_eq!(jagged.max_seqlen()?, 3);
    assert_eq!(jagged.min_seqlen()?, 1);
    assert_eq!(jagged.metadata_cache().get(Extreme::Max.cache_key()), Some(3));

    // A cached value wins over whatever a later function would compute.
    let cached = jagged.seqlen_extreme_with(Extreme::Max, |_| Some(99))?;
    assert_eq!(cached, 3);
    Ok(())
}

#[test]
fn preset_metadata_cache_short_circuits() -> Result<()> {
    let mut registry = EquivalenceRegistry::default();
    let offsets = Arc::new(Tensor::vector_i64(vec![0, 1, 4]));
    let mut jagged = JaggedTensor::new(
        &mut registry,
        rows(4, 1, 0.0)?,
        offsets,
        JaggedOptions::default().with_metadata_cache(MetadataCache::with_seqlens(10, 0)),
    )?;
    assert_eq!(jagged.max_seqlen()?, 10);
    assert_eq!(jagged.min_seqlen()?, 0);
    Ok(())
}

#[test]
fn empty_batch_has_no_sequence_extremes() -> Result<()> {
    let mut registry = EquivalenceRegistry::default();
    let offsets = Arc::new(Tensor::vector_i64(vec![0]));
    let mut jagged = JaggedTensor::new(
        &mut registry,
        Tensor::zeros(Shape::new([0, 3])),
        offsets,
        JaggedOptions::default(),
    )?;
    assert_eq!(jagged.batch_size(), 0);
    assert!(matches!(
        jagged.max_seqlen(),
        Err(JaggedError::EmptyBatch { what: "max_seqlen" })
    ));
    Ok(())
}

#[test]
fn inner_ragged_idx_moves_the_nested_int() -> Result<()> {
    let mut registry = EquivalenceRegistry::default();
    // Ragged total of 5 sits in the second values dim.
    let values = Tensor::zeros(Shape::new([3, 5, 4]));
    let offsets = Arc::new(Tensor::vector_i64(vec![0, 2, 5]));
    let jagged = JaggedTensor::new(
        &mut registry,
        values,
        offsets,
        JaggedOptions::default().with_ragged_idx(2),
    )?;

    let size = jagged.size();
    assert_eq!(size.len(), 4);
    assert_eq!(size[0], SymInt::Int(2));
    assert_eq!(size[1], SymInt::Int(3));
    assert!(size[2].is_nested());
    assert_eq!(size[3], SymInt::Int(4));
    assert!(jagged.is_dynamic(2));
    Ok(())
}

#[test]
fn narrow_produces_contiguous_layout_when_rows_tile() -> Result<()> {
    let mut registry = EquivalenceRegistry::default();
    let padded = Tensor::from_f32(
        Shape::new([3, 4, 1]),
        (0..12).map(|i| i as f32).collect(),
    )?;
    let starts = Tensor::vector_i64(vec![1, 0, 0]);
    let lengths = Tensor::vector_i64(vec![3, 4, 2]);

    let (mut jagged, offsets, lengths_out) =
        jagged_from_tensor_and_lengths(&mut registry, &padded, &starts, &lengths)?;
    assert!(lengths_out.is_none());
    assert!(jagged.is_contiguous());
    assert_eq!(offsets.to_i64_vec()?, vec![0, 3, 7, 9]);
    assert_eq!(jagged.values().dims(), &[9, 1]);
    assert_eq!(jagged.values().as_f32().expect("f32 values")[0], 1.0);
    assert_eq!(jagged.max_seqlen()?, 4);
    assert_eq!(jagged.min_seqlen()?, 2);
    Ok(())
}

#[test]
fn narrow_keeps_lengths_for_gapped_rows() -> Result<()> {
    let mut registry = EquivalenceRegistry::default();
    let padded = Tensor::zeros(Shape::new([3, 4, 2]));
    let starts = Tensor::vector_i64(vec![0]);
    let lengths = Tensor::vector_i64(vec![2, 3, 1]);

    let (mut jagged, offsets, lengths_out) =
        jagged_from_tensor_and_lengths(&mut registry, &padded, &starts, &lengths)?;
    let lengths_out = lengths_out.expect("non-contiguous narrow carries lengths");
    assert!(!jagged.is_contiguous());
    assert_eq!(offsets.to_i64_vec()?, vec![0, 4, 8, 9]);
    assert_eq!(lengths_out.to_i64_vec()?, vec![2, 3, 1]);
    assert!(Arc::ptr_eq(jagged.ragged_source(), &lengths_out));
    assert_eq!(jagged.values().dims(), &[12, 2]);
    assert_eq!(jagged.max_seqlen()?, 3);
    assert_eq!(jagged.min_seqlen()?, 1);

    let rendered = jagged.to_string();
    assert!(rendered.contains("offsets=[0, 4, 8, 9]"), "{rendered}");
    assert!(rendered.ends_with("contiguous=false)"), "{rendered}");
    Ok(())
}

#[test]
fn narrow_rejects_unbroadcastable_arguments() -> Result<()> {
    let mut registry = EquivalenceRegistry::default();
    let padded = Tensor::zeros(Shape::new([3, 4]));
    let starts = Tensor::vector_i64(vec![0, 0]);
    let lengths = Tensor::vector_i64(vec![1, 1, 1]);
    let err = jagged_from_tensor_and_lengths(&mut registry, &padded, &starts, &lengths)
        .unwrap_err();
    assert!(matches!(err, JaggedError::NotBroadcastable { batch_size: 3 }));

    let flat = Tensor::zeros(Shape::new([3]));
    let err = jagged_from_tensor_and_lengths(
        &mut registry,
        &flat,
        &Tensor::vector_i64(vec![0]),
        &Tensor::vector_i64(vec![1]),
    )
    .unwrap_err();
    assert!(matches!(err, JaggedError::NarrowRank { rank: 1 }));
    Ok(())
}

#[test]
fn saved_tensor_loads_into_a_fresh_class() -> Result<()> {
    let mut registry = EquivalenceRegistry::default();
    let padded = rows(3, 4, 0.0)?.reshape([3, 4, 1])?;
    let starts = Tensor::vector_i64(vec![0]);
    let lengths = Tensor::vector_i64(vec![2, 3, 1]);
    let (mut original, offsets, lengths_out) =
        jagged_from_tensor_and_lengths(&mut registry, &padded, &starts, &lengths)?;
    let lengths_out = lengths_out.expect("gapped rows keep lengths");
    original.max_seqlen()?;

    let encoded = serde_json::to_string(&original.to_record())?;
    let record: JaggedRecord = serde_json::from_str(&encoded)?;
    let loaded = JaggedTensor::from_record(&mut registry, record)?;

    assert_eq!(loaded.values(), original.values());
    assert_eq!(loaded.offsets().as_ref(), offsets.as_ref());
    assert!(!Arc::ptr_eq(loaded.offsets(), &offsets));
    let loaded_lengths = loaded.lengths().expect("lengths are saved");
    assert_eq!(loaded_lengths.to_i64_vec()?, vec![2, 3, 1]);
    assert!(!registry.same_class(loaded_lengths, &lengths_out));
    assert_ne!(loaded.size(), original.size());
    assert_eq!(loaded.ragged_idx(), original.ragged_idx());
    assert_eq!(loaded.metadata_cache(), original.metadata_cache());
    assert_eq!(loaded.metadata_cache().get("max_seqlen"), Some(3));
    assert_eq!(
        registry.get_metadata(loaded_lengths)?.sum_vec(),
        Some(loaded.values().dims()[0] as i64)
    );
    Ok(())
}

#[test]
fn saved_contiguous_tensor_has_no_lengths() -> Result<()> {
    let mut registry = EquivalenceRegistry::default();
    let parts = [rows(2, 2, 0.0)?, rows(1, 2, 4.0)?];
    let (original, _) = jagged_from_list(&mut registry, &parts, None, None, None)?;

    let encoded = serde_json::to_value(original.to_record())?;
    assert!(encoded["lengths"].is_null());
    let mut reloaded_registry = EquivalenceRegistry::default();
    let record: JaggedRecord = serde_json::from_value(encoded)?;
    let loaded = JaggedTensor::from_record(&mut reloaded_registry, record)?;
    assert!(loaded.lengths().is_none());
    assert!(loaded.is_contiguous());
    assert_eq!(loaded.offsets().to_i64_vec()?, vec![0, 2, 3]);
    assert_eq!(nested_at(loaded.size(), 1).registry(), reloaded_registry.id());
    Ok(())
}

#[test]
fn saved_tensor_rejects_mismatched_data() {
    let json = r#"{
        "values": {"dims": [2, 2], "data": {"F32": [0.0, 1.0, 2.0]}},
        "offsets": {"dims": [2], "data": {"I64": [0, 2]}},
        "ragged_idx": 1
    }"#;
    assert!(serde_json::from_str::<JaggedRecord>(json).is_err());
}
