//! Client-side sampling engine for experience-replay training loops.
//!
//! A training process asks a [`Sampler`] for up to `max_samples` items from a
//! named table on a replay server (or an in-process table). The sampler fans
//! the request across a pool of worker threads, each of which drives one
//! long-lived sampling session at a time: a bidirectional request/response
//! stream for a remote server, or direct `sample_flexible_batch` calls for a
//! co-located table. Workers assemble the multi-chunk trajectory of each item
//! into dense tensors and hand the finished [`Sample`]s to the consumer
//! through a bounded queue in arrival order.
//!
//! The code might look like below.
//!
//! ```ignore
//! fn train(client: Arc<dyn StreamClient>) -> Result<()> {
//!     let config = SamplerConfig {
//!         max_samples: Some(1_000_000),
//!         max_in_flight_samples_per_worker: 100,
//!         rate_limiter_timeout: Duration::from_secs(10),
//!         ..Default::default()
//!     };
//!     let mut sampler = Sampler::new_remote(client, "experience", &config, None)?;
//!
//!     loop {
//!         match sampler.next_trajectory() {
//!             Ok(tensors) => learner.step(tensors),
//!             Err(err) if err.is_out_of_range() => break, // budget reached
//!             Err(err) => return Err(err.into()),
//!         }
//!     }
//!     sampler.close();
//!     Ok(())
//! }
//! ```
//!
//! # Consumption styles
//!
//! Each sample can be consumed in one of three ways, all emitting the four
//! metadata tensors (key, probability, table size, priority) ahead of the
//! data columns:
//!
//! * [`Sampler::next_timestep`] — row-by-row iteration, releasing chunk
//!   memory incrementally;
//! * [`Sampler::next_sample`] — one batch of timesteps per item, metadata
//!   broadcast along the time axis;
//! * [`Sampler::next_trajectory`] — one tensor per column, unit leading
//!   dimensions dropped from `squeeze`-flagged columns.
//!
//! # Failure model
//!
//! The first fatal worker error closes the queue and is returned from every
//! subsequent consumer call. A transient transport failure
//! ([`SamplerError::Unavailable`]) is retried on a fresh stream instead, so
//! planned server restarts do not poison long-running training jobs.
mod assemble;
mod chunk;
mod error;
mod queue;
mod sample;
mod sampler;
mod signature;
mod table;
mod tensor;
mod wire;
mod worker;

pub use chunk::{
    chunk_keys, is_timestep_trajectory, timestep_trajectory_length, timestep_trajectory_offset,
    unpack_chunk_column_slice, ChunkData, ChunkSlice, FlatTrajectory, ItemInfo, TrajectoryColumn,
};
pub use error::{Result, SamplerError};
pub use queue::SampleQueue;
pub use sample::Sample;
pub use sampler::{Sampler, SamplerConfig};
pub use signature::{metadata_specs, Signature, TensorSpec};
pub use table::{ReplayTable, SampledItem};
pub use tensor::{Dtype, EncodedTensor, Tensor};
pub use wire::{
    SampleInfo, SampleRequest, SampleResponse, SampleStream, StreamClient, StreamHandle,
};
pub use worker::{LocalWorker, RemoteWorker, SamplerWorker};
