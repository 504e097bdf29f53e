//! An assembled replay sample and its consumer-facing views.
use crate::error::{Result, SamplerError};
use crate::tensor::Tensor;
use std::collections::VecDeque;

/// One item sampled from a replay table, fully decoded.
///
/// The trajectory data lives in *chunk groups*: each group holds one tensor
/// per column, and every tensor in a group shares the group's leading (batch)
/// dimension. Timestep-decomposable samples may span several groups, which
/// lets [`Sample::next_timestep`] release group memory as iteration crosses a
/// group boundary; a general trajectory always arrives as a single group with
/// the columns already concatenated.
///
/// A sample supports exactly one of two consumption styles:
///
/// * row-by-row iteration with [`Sample::next_timestep`], or
/// * one-shot materialization with [`Sample::as_batched_timesteps`] or
///   [`Sample::as_trajectory`].
///
/// Mixing them would silently drop the rows already iterated, so the batch
/// views fail with [`SamplerError::DataLoss`] once iteration has started.
///
/// Every emitted row or batch starts with four metadata tensors in fixed
/// order: key (`u64`), probability (`f64`), table size (`i64`) and priority
/// (`f64`), followed by the data columns.
#[derive(Clone, Debug)]
pub struct Sample {
    key: u64,
    probability: f64,
    table_size: i64,
    priority: f64,
    num_timesteps: usize,
    num_data_columns: usize,
    chunks: VecDeque<Vec<Tensor>>,
    squeeze_columns: Vec<bool>,
    next_index: usize,
    has_been_iterated: bool,
}

impl Sample {
    /// Builds a sample from decoded chunk groups.
    ///
    /// Rejects an empty group list, empty groups, non-uniform column counts
    /// and columns without a batch dimension; all of these are protocol
    /// violations on the part of whoever produced the chunks.
    pub fn new(
        key: u64,
        probability: f64,
        table_size: i64,
        priority: f64,
        chunks: VecDeque<Vec<Tensor>>,
        squeeze_columns: Vec<bool>,
    ) -> Result<Self> {
        let Some(first) = chunks.front() else {
            return Err(SamplerError::internal(format!(
                "sample {} must hold at least one chunk group",
                key
            )));
        };
        let num_data_columns = first.len();
        if num_data_columns == 0 {
            return Err(SamplerError::internal(format!(
                "sample {} holds an empty chunk group",
                key
            )));
        }
        if squeeze_columns.len() != num_data_columns {
            return Err(SamplerError::internal(format!(
                "sample {} has {} columns but {} squeeze flags",
                key,
                num_data_columns,
                squeeze_columns.len()
            )));
        }

        let mut num_timesteps = 0;
        for group in &chunks {
            if group.len() != num_data_columns {
                return Err(SamplerError::internal(format!(
                    "sample {} mixes chunk groups of {} and {} columns",
                    key,
                    num_data_columns,
                    group.len()
                )));
            }
            for tensor in group {
                if tensor.leading_dim().is_none() {
                    return Err(SamplerError::internal(format!(
                        "sample {} holds a scalar chunk tensor",
                        key
                    )));
                }
            }
            num_timesteps += group[0].leading_dim().unwrap_or(0);
        }

        Ok(Self {
            key,
            probability,
            table_size,
            priority,
            num_timesteps,
            num_data_columns,
            chunks,
            squeeze_columns,
            next_index: 0,
            has_been_iterated: false,
        })
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn probability(&self) -> f64 {
        self.probability
    }

    pub fn table_size(&self) -> i64 {
        self.table_size
    }

    pub fn priority(&self) -> f64 {
        self.priority
    }

    /// Total rows across all chunk groups at construction time.
    pub fn num_timesteps(&self) -> usize {
        self.num_timesteps
    }

    pub fn num_data_columns(&self) -> usize {
        self.num_data_columns
    }

    /// True once every row has been iterated or the sample materialized.
    pub fn is_end_of_sample(&self) -> bool {
        self.chunks.is_empty()
    }

    /// True when all columns span the same number of rows, making row-by-row
    /// iteration well defined. Evaluated over the groups not yet consumed.
    pub fn is_timestep_decomposable(&self) -> bool {
        let mut lengths = vec![0usize; self.num_data_columns];
        for group in &self.chunks {
            for (length, tensor) in lengths.iter_mut().zip(group) {
                match tensor.leading_dim() {
                    Some(rows) => *length += rows,
                    None => return false,
                }
            }
        }
        lengths.windows(2).all(|w| w[0] == w[1])
    }

    /// Produces the next row: the four metadata scalars followed by row
    /// `next_index` of every column in the head group.
    ///
    /// The head group is dropped as soon as its rows are exhausted, releasing
    /// its memory before the rest of the sample is consumed.
    pub fn next_timestep(&mut self) -> Result<Vec<Tensor>> {
        let Some(group) = self.chunks.front() else {
            return Err(SamplerError::internal(
                "next_timestep called on an exhausted sample".to_string(),
            ));
        };

        let mut result = Vec::with_capacity(self.num_data_columns + 4);
        result.push(Tensor::scalar_u64(self.key));
        result.push(Tensor::scalar_f64(self.probability));
        result.push(Tensor::scalar_i64(self.table_size));
        result.push(Tensor::scalar_f64(self.priority));
        for tensor in group {
            result.push(tensor.row(self.next_index));
        }

        self.next_index += 1;
        if Some(self.next_index) == group[0].leading_dim() {
            self.chunks.pop_front();
            self.next_index = 0;
        }
        self.has_been_iterated = true;

        Ok(result)
    }

    /// Materializes the whole sample as one batch of timesteps: metadata
    /// broadcast to `num_timesteps` rows, data columns concatenated across
    /// groups.
    pub fn as_batched_timesteps(&mut self) -> Result<Vec<Tensor>> {
        self.check_not_consumed()?;
        if !self.is_timestep_decomposable() {
            return Err(SamplerError::failed_precondition(
                "trajectory cannot be decomposed into timesteps".to_string(),
            ));
        }

        let mut result = Vec::with_capacity(self.num_data_columns + 4);
        result.push(Tensor::broadcast_u64(self.key, self.num_timesteps));
        result.push(Tensor::broadcast_f64(self.probability, self.num_timesteps));
        result.push(Tensor::broadcast_i64(self.table_size, self.num_timesteps));
        result.push(Tensor::broadcast_f64(self.priority, self.num_timesteps));
        result.extend(self.concat_columns()?);
        Ok(result)
    }

    /// Materializes the whole sample as a trajectory: scalar metadata, then
    /// one tensor per column with `squeeze`-flagged columns stripped of their
    /// unit leading dimension.
    pub fn as_trajectory(&mut self) -> Result<Vec<Tensor>> {
        self.check_not_consumed()?;

        let mut result = Vec::with_capacity(self.num_data_columns + 4);
        result.push(Tensor::scalar_u64(self.key));
        result.push(Tensor::scalar_f64(self.probability));
        result.push(Tensor::scalar_i64(self.table_size));
        result.push(Tensor::scalar_f64(self.priority));

        // A general trajectory arrives as a single group whose columns are
        // already concatenated; skip the concat in that case.
        if self.chunks.len() == 1 {
            result.extend(self.chunks.pop_front().unwrap_or_default());
        } else {
            result.extend(self.concat_columns()?);
        }

        for (i, squeeze) in self.squeeze_columns.iter().enumerate() {
            if !squeeze {
                continue;
            }
            result[i + 4] = result[i + 4].squeeze_leading()?;
        }

        Ok(result)
    }

    fn check_not_consumed(&self) -> Result<()> {
        if self.has_been_iterated {
            return Err(SamplerError::data_loss(
                "some timesteps of this sample have already been iterated".to_string(),
            ));
        }
        if self.chunks.is_empty() {
            return Err(SamplerError::data_loss(
                "sample has already been materialized".to_string(),
            ));
        }
        Ok(())
    }

    /// Drains the groups and concatenates each column across them.
    fn concat_columns(&mut self) -> Result<Vec<Tensor>> {
        let mut columns: Vec<Vec<Tensor>> = (0..self.num_data_columns)
            .map(|_| Vec::with_capacity(self.chunks.len()))
            .collect();
        while let Some(group) = self.chunks.pop_front() {
            for (column, tensor) in columns.iter_mut().zip(group) {
                column.push(tensor);
            }
        }
        columns
            .iter()
            .map(|parts| Tensor::concat_rows(parts))
            .collect()
    }
}
