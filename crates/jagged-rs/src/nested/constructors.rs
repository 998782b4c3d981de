//! Public entry points that assemble jagged tensors from dense inputs.

use std::sync::Arc;

use anyhow::anyhow;

use super::error::JaggedError;
use super::jagged::{JaggedOptions, JaggedTensor, MetadataCache};
use super::state::EquivalenceRegistry;
use crate::tensor::{DType, Device, Tensor};

/// Builds a jagged tensor from a list of tensors that differ only in their
/// leading dim.
///
/// Offsets are computed as `[0, cumsum(rows)]` when not supplied. Returns the
/// jagged tensor together with its offsets.
pub fn jagged_from_list(
    registry: &mut EquivalenceRegistry,
    tensors: &[Tensor],
    offsets: Option<Arc<Tensor>>,
    dtype: Option<DType>,
    device: Option<Device>,
) -> Result<(JaggedTensor, Arc<Tensor>), JaggedError> {
    let first = tensors.first().ok_or(JaggedError::EmptyList)?;
    for tensor in tensors {
        if tensor.dtype() != first.dtype() {
            return Err(JaggedError::DtypeMismatch {
                first: first.dtype(),
                other: tensor.dtype(),
            });
        }
        if tensor.device() != first.device() {
            return Err(JaggedError::DeviceMismatch {
                first: first.device(),
                other: tensor.device(),
            });
        }
    }

    // Only the dim right after the batch dim may be ragged.
    let trailing = &first.dims()[1..];
    if tensors.iter().any(|tensor| &tensor.dims()[1..] != trailing) {
        return Err(JaggedError::NotRepresentable);
    }

    let parts: Vec<&Tensor> = tensors.iter().collect();
    let mut values = Tensor::cat_rows(&parts)?;
    if let Some(dtype) = dtype {
        values = values.to_dtype(dtype);
    }
    if let Some(device) = device {
        values = values.to_device(device);
    }

    let offsets = match offsets {
        Some(offsets) => offsets,
        None => {
            let mut cumulative = Vec::with_capacity(tensors.len() + 1);
            cumulative.push(0i64);
            let mut total = 0i64;
            for tensor in tensors {
                total += tensor.dims()[0] as i64;
                cumulative.push(total);
            }
            Arc::new(Tensor::vector_i64(cumulative).to_device(values.device()))
        }
    };

    let rows = tensors.iter().map(|tensor| tensor.dims()[0] as i64);
    let max_seqlen = rows.clone().max().unwrap_or_default();
    let min_seqlen = rows.min().unwrap_or_default();

    let options = JaggedOptions::default()
        .with_requires_grad(values.requires_grad_flag())
        .with_metadata_cache(MetadataCache::with_seqlens(max_seqlen, min_seqlen));
    let jagged = JaggedTensor::new(registry, values.detach(), Arc::clone(&offsets), options)?;
    Ok((jagged, offsets))
}

/// Broadcasts a 1-D (or single element) integer tensor to `batch_size` entries.
fn expand_to_batch(tensor: &Tensor, batch_size: usize) -> Result<Vec<i64>, JaggedError> {
    if tensor.rank() != 1 {
        return Err(JaggedError::NotBroadcastable { batch_size });
    }
    let values = tensor.to_i64_vec()?;
    match values.len() {
        len if len == batch_size => Ok(values),
        1 => Ok(vec![values[0]; batch_size]),
        _ => Err(JaggedError::NotBroadcastable { batch_size }),
    }
}

fn to_index(value: i64) -> Result<usize, JaggedError> {
    usize::try_from(value)
        .map_err(|_| JaggedError::Tensor(anyhow!("offset {value} is negative")))
}

/// Builds a jagged tensor that narrows each row of a padded `[B, S, ...]`
/// tensor to `lengths[i]` entries starting at `starts[i]`.
///
/// When the narrowed rows happen to tile the buffer contiguously the result
/// is a contiguous jagged tensor over re-based offsets and no lengths are
/// returned; otherwise the result keeps the full buffer and carries lengths.
pub fn jagged_from_tensor_and_lengths(
    registry: &mut EquivalenceRegistry,
    tensor: &Tensor,
    starts: &Tensor,
    lengths: &Tensor,
) -> Result<(JaggedTensor, Arc<Tensor>, Option<Arc<Tensor>>), JaggedError> {
    let batch_size = tensor.dims()[0];
    let start_list = expand_to_batch(starts, batch_size)?;
    let length_list = expand_to_batch(lengths, batch_size)?;

    if tensor.rank() < 2 {
        return Err(JaggedError::NarrowRank {
            rank: tensor.rank(),
        });
    }
    if batch_size == 0 {
        return Err(JaggedError::EmptyBatch { what: "offsets" });
    }

    let max_seq_len = tensor.dims()[1] as i64;
    let mut offsets: Vec<i64> = start_list
        .iter()
        .enumerate()
        .map(|(row, start)| start + max_seq_len * row as i64)
        .collect();
    let last = batch_size - 1;
    offsets.push(start_list[last] + max_seq_len * last as i64 + length_list[last]);

    let mut flat_dims = vec![tensor.dims()[0] * tensor.dims()[1]];
    flat_dims.extend_from_slice(&tensor.dims()[2..]);
    let values = tensor.reshape(flat_dims)?;

    let middle_lengths = if batch_size >= 2 {
        &length_list[1..batch_size - 1]
    } else {
        &[][..]
    };
    let middle_offsets = if offsets.len() >= 3 {
        &offsets[1..offsets.len() - 2]
    } else {
        &[][..]
    };
    let is_contiguous = middle_lengths.iter().all(|&len| len == max_seq_len)
        && middle_offsets
            .windows(2)
            .all(|pair| pair[1] - pair[0] == max_seq_len)
        && offsets[0] + length_list[0] == max_seq_len;

    let source_lengths = lengths.to_i64_vec()?;
    let max_seqlen = source_lengths.iter().copied().max().unwrap_or_default();
    let min_seqlen = source_lengths.iter().copied().min().unwrap_or_default();
    let options = JaggedOptions::default()
        .with_requires_grad(values.requires_grad_flag())
        .with_metadata_cache(MetadataCache::with_seqlens(max_seqlen, min_seqlen));

    if is_contiguous {
        let base = offsets[0];
        let values = values.slice_rows(to_index(base)?, to_index(offsets[batch_size])?)?;
        let rebased = Arc::new(Tensor::vector_i64(
            offsets.iter().map(|offset| offset - base).collect(),
        ));
        let jagged = JaggedTensor::new(registry, values.detach(), Arc::clone(&rebased), options)?;
        Ok((jagged, rebased, None))
    } else {
        let offsets = Arc::new(Tensor::vector_i64(offsets));
        let length_list = Arc::new(Tensor::vector_i64(length_list));
        let options = options.with_lengths(Arc::clone(&length_list));
        let jagged = JaggedTensor::new(registry, values.detach(), Arc::clone(&offsets), options)?;
        Ok((jagged, offsets, Some(length_list)))
    }
}

/// Recovers the flat backing buffer of a jagged tensor.
pub fn buffer_from_jagged(jagged: &JaggedTensor) -> &Tensor {
    jagged.values()
}
