//! Turns stream responses and table items into [`Sample`]s.
//!
//! A logical sample arrives as one or more stream responses. The first one
//! carries the item metadata and trajectory; every data-bearing response
//! contributes one chunk. Assembly is complete when the received chunk keys
//! cover the keys the trajectory declares.
use crate::chunk::{
    chunk_keys, is_timestep_trajectory, timestep_trajectory_length, timestep_trajectory_offset,
    unpack_chunk_column_slice, ChunkData, FlatTrajectory,
};
use crate::error::{Result, SamplerError};
use crate::sample::Sample;
use crate::table::SampledItem;
use crate::tensor::Tensor;
use crate::wire::{SampleInfo, SampleResponse};
use std::collections::{HashMap, HashSet, VecDeque};

/// True when `responses` contains every chunk the first response's
/// trajectory declares.
pub(crate) fn sample_is_done(responses: &[SampleResponse]) -> bool {
    let Some(info) = responses.first().and_then(|r| r.info.as_ref()) else {
        return false;
    };

    let received: HashSet<u64> = responses
        .iter()
        .filter_map(|r| r.data.as_ref())
        .map(|d| d.key)
        .collect();

    chunk_keys(&info.item.trajectory)
        .iter()
        .all(|key| received.contains(key))
}

/// Materializes one sample out of a complete response set.
pub(crate) fn stream_sample(responses: Vec<SampleResponse>) -> Result<Sample> {
    let info = responses
        .first()
        .and_then(|r| r.info.clone())
        .ok_or_else(|| {
            SamplerError::internal("first response of a sample carries no info".to_string())
        })?;

    if is_timestep_trajectory(&info.item.trajectory) {
        timestep_stream_sample(info, responses)
    } else {
        general_stream_sample(info, responses)
    }
}

/// Timestep-aligned fast path: chunks are decoded and trimmed in arrival
/// order and kept as separate groups, so their memory can be released
/// incrementally while the sample is iterated.
fn timestep_stream_sample(info: SampleInfo, responses: Vec<SampleResponse>) -> Result<Sample> {
    let trajectory = &info.item.trajectory;

    // The chunks are not required to align with the sampled span: part of the
    // first chunk and the tail of the last one are trimmed away.
    let mut offset = timestep_trajectory_offset(trajectory);
    let mut remaining = timestep_trajectory_length(trajectory);

    let mut chunks: VecDeque<Vec<Tensor>> = VecDeque::new();
    for data in responses.into_iter().filter_map(|r| r.data) {
        if remaining == 0 {
            return Err(SamplerError::internal(format!(
                "item {} received more chunk data than its trajectory declares",
                info.item.key
            )));
        }

        let mut batch_size: Option<usize> = None;
        let mut columns = Vec::with_capacity(data.tensors.len());
        for encoded in &data.tensors {
            let mut tensor = encoded.decode()?;
            if data.delta_encoded {
                tensor.delta_decode();
            }
            let rows = tensor.leading_dim().ok_or_else(|| {
                SamplerError::internal(format!("chunk {} stores a scalar tensor", data.key))
            })?;
            match batch_size {
                None => batch_size = Some(rows),
                Some(first) if first != rows => {
                    return Err(SamplerError::internal(format!(
                        "chunks of the same response must have identical batch size, but \
                         the first chunk has batch size {} while the current chunk has \
                         batch size {}",
                        first, rows
                    )));
                }
                Some(_) => {}
            }
            columns.push(tensor);
        }

        let batch_size = batch_size.ok_or_else(|| {
            SamplerError::internal(format!("chunk {} carries no tensors", data.key))
        })?;
        if offset >= batch_size {
            return Err(SamplerError::internal(format!(
                "trajectory offset {} is out of range for chunk {} with batch size {}",
                offset, data.key, batch_size
            )));
        }

        let end = (offset + remaining).min(batch_size);
        let trimmed = columns
            .iter()
            .map(|t| t.slice_rows(offset..end))
            .collect::<Vec<_>>();
        chunks.push_back(trimmed);

        remaining -= end - offset;
        offset = 0;
    }

    if remaining != 0 {
        return Err(SamplerError::internal(format!(
            "item {} is missing {} trajectory rows after unpacking",
            info.item.key, remaining
        )));
    }

    let squeeze = trajectory.columns.iter().map(|c| c.squeeze).collect();
    Sample::new(
        info.item.key,
        info.probability,
        info.table_size,
        info.item.priority,
        chunks,
        squeeze,
    )
}

/// General path: index the chunks by key, then cut and concatenate each
/// column's slices into a single chunk group.
fn general_stream_sample(info: SampleInfo, responses: Vec<SampleResponse>) -> Result<Sample> {
    let chunks: HashMap<u64, ChunkData> = responses
        .into_iter()
        .filter_map(|r| r.data)
        .map(|d| (d.key, d))
        .collect();

    let columns = unpack_columns(&info.item.trajectory, info.item.key, |key| {
        chunks.get(&key)
    })?;

    let squeeze = info.item.trajectory.columns.iter().map(|c| c.squeeze).collect();
    Sample::new(
        info.item.key,
        info.probability,
        info.table_size,
        info.item.priority,
        VecDeque::from(vec![columns]),
        squeeze,
    )
}

/// Materializes a sample from an item handed out by the in-process table.
/// The chunks stay shared with the table's store; only the sampled rows are
/// copied out.
pub(crate) fn table_sample(item: &SampledItem) -> Result<Sample> {
    let chunks: HashMap<u64, &ChunkData> = item
        .chunks
        .iter()
        .map(|c| (c.key, c.as_ref()))
        .collect();

    let columns = unpack_columns(&item.item.trajectory, item.item.key, |key| {
        chunks.get(&key).copied()
    })?;

    let squeeze = item.item.trajectory.columns.iter().map(|c| c.squeeze).collect();
    Sample::new(
        item.item.key,
        item.probability,
        item.table_size,
        item.item.priority,
        VecDeque::from(vec![columns]),
        squeeze,
    )
}

fn unpack_columns<'a>(
    trajectory: &FlatTrajectory,
    item_key: u64,
    lookup: impl Fn(u64) -> Option<&'a ChunkData>,
) -> Result<Vec<Tensor>> {
    let mut columns = Vec::with_capacity(trajectory.columns.len());
    for column in &trajectory.columns {
        let mut parts = Vec::with_capacity(column.chunk_slices.len());
        for slice in &column.chunk_slices {
            let chunk = lookup(slice.chunk_key).ok_or_else(|| {
                SamplerError::internal(format!(
                    "chunk {} could not be found when unpacking item {}",
                    slice.chunk_key, item_key
                ))
            })?;
            parts.push(unpack_chunk_column_slice(chunk, slice)?);
        }
        columns.push(Tensor::concat_rows(&parts)?);
    }
    Ok(columns)
}
