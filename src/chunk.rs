//! Chunked trajectory schema shared by the wire protocol and the in-process
//! table.
//!
//! A sampled item does not carry its own tensors. It references *chunks*,
//! server-side storage units holding a batch of rows per column, and describes
//! how to cut them with a [`FlatTrajectory`]: per column, an ordered list of
//! [`ChunkSlice`]s plus a flag telling whether the column's unit leading
//! dimension is dropped when the item is materialized as a trajectory.
use crate::error::{Result, SamplerError};
use crate::tensor::{EncodedTensor, Tensor};

/// One storage unit: a batch of rows for each column stored in the chunk.
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkData {
    /// Key the chunk is addressed by.
    pub key: u64,

    /// One packed tensor per column held by this chunk.
    pub tensors: Vec<EncodedTensor>,

    /// Whether the packed tensors are stored as first-order row deltas.
    pub delta_encoded: bool,
}

/// A contiguous span of rows cut out of one chunk column.
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkSlice {
    /// Chunk the rows are read from.
    pub chunk_key: u64,

    /// First row of the span.
    pub offset: usize,

    /// Number of rows in the span.
    pub length: usize,

    /// Position of the column inside the chunk's tensor list.
    pub index: usize,
}

/// One column of an item: its chunk slices in trajectory order.
#[derive(Clone, Debug, PartialEq)]
pub struct TrajectoryColumn {
    pub chunk_slices: Vec<ChunkSlice>,

    /// Drop the unit leading dimension when materializing as a trajectory.
    pub squeeze: bool,
}

/// The per-item schema: how every column is assembled from chunks.
#[derive(Clone, Debug, PartialEq)]
pub struct FlatTrajectory {
    pub columns: Vec<TrajectoryColumn>,
}

/// Metadata of one item held by a replay table.
#[derive(Clone, Debug, PartialEq)]
pub struct ItemInfo {
    pub key: u64,
    pub priority: f64,
    pub trajectory: FlatTrajectory,
}

/// Keys of every chunk the trajectory references, in first-appearance order.
pub fn chunk_keys(trajectory: &FlatTrajectory) -> Vec<u64> {
    let mut keys = Vec::new();
    for column in &trajectory.columns {
        for slice in &column.chunk_slices {
            if !keys.contains(&slice.chunk_key) {
                keys.push(slice.chunk_key);
            }
        }
    }
    keys
}

/// True when every column is cut from the same chunks with the same offsets
/// and lengths, which makes row-by-row iteration well defined.
pub fn is_timestep_trajectory(trajectory: &FlatTrajectory) -> bool {
    let Some(first) = trajectory.columns.first() else {
        return false;
    };
    trajectory.columns.iter().skip(1).all(|column| {
        column.chunk_slices.len() == first.chunk_slices.len()
            && column
                .chunk_slices
                .iter()
                .zip(&first.chunk_slices)
                .all(|(a, b)| {
                    a.chunk_key == b.chunk_key && a.offset == b.offset && a.length == b.length
                })
    })
}

/// Rows skipped at the front of the first chunk of a timestep trajectory.
pub fn timestep_trajectory_offset(trajectory: &FlatTrajectory) -> usize {
    trajectory
        .columns
        .first()
        .and_then(|c| c.chunk_slices.first())
        .map_or(0, |s| s.offset)
}

/// Total number of rows in a timestep trajectory.
pub fn timestep_trajectory_length(trajectory: &FlatTrajectory) -> usize {
    trajectory
        .columns
        .first()
        .map_or(0, |c| c.chunk_slices.iter().map(|s| s.length).sum())
}

/// Decodes one column span out of a chunk: unpack the addressed tensor,
/// invert the delta transform if needed and cut the requested rows.
pub fn unpack_chunk_column_slice(chunk: &ChunkData, slice: &ChunkSlice) -> Result<Tensor> {
    let encoded = chunk.tensors.get(slice.index).ok_or_else(|| {
        SamplerError::internal(format!(
            "chunk {} holds {} tensors but column index {} was requested",
            chunk.key,
            chunk.tensors.len(),
            slice.index
        ))
    })?;

    let mut tensor = encoded.decode()?;
    if chunk.delta_encoded {
        tensor.delta_decode();
    }

    let rows = tensor.leading_dim().ok_or_else(|| {
        SamplerError::internal(format!("chunk {} stores a scalar tensor", chunk.key))
    })?;
    let end = slice.offset + slice.length;
    if end > rows {
        return Err(SamplerError::internal(format!(
            "slice [{}, {}) is out of range for chunk {} with {} rows",
            slice.offset, end, chunk.key, rows
        )));
    }

    Ok(tensor.slice_rows(slice.offset..end))
}
