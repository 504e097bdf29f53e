//! Messages and transport seams of the bidirectional sample stream.
//!
//! The engine does not talk to a concrete transport. It writes
//! [`SampleRequest`]s and reads [`SampleResponse`]s through the
//! [`SampleStream`] trait, and aborts in-flight streams through a
//! [`StreamHandle`] obtained at open time. Process-internal test doubles and
//! real RPC clients plug in behind the same traits.
use crate::chunk::{ChunkData, ItemInfo};
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;

/// One batch request written by a worker.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleRequest {
    /// Logical table to sample from.
    pub table: String,

    /// Number of samples the server should stream back for this request.
    pub num_samples: usize,

    /// Upper bound on how long a single sample may wait on the server's rate
    /// limiter. Not a per-message deadline.
    pub rate_limiter_timeout: Duration,

    /// Upper limit on items the table may return from one acquisition of its
    /// internal lock. `None` lets the server pick.
    pub flexible_batch_size: Option<usize>,
}

/// Metadata attached to the first response of each sample.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleInfo {
    pub item: ItemInfo,

    /// Inclusion probability of the item at sampling time.
    pub probability: f64,

    /// Number of items in the table at sampling time.
    pub table_size: i64,
}

/// One message read from the stream.
///
/// A logical sample spans one or more responses. The first carries `info`;
/// the sample is complete once the union of received `data` chunk keys covers
/// every key referenced by the item's trajectory.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct SampleResponse {
    pub info: Option<SampleInfo>,
    pub data: Option<ChunkData>,
}

impl SampleResponse {
    pub fn from_info(info: SampleInfo) -> Self {
        Self {
            info: Some(info),
            data: None,
        }
    }

    pub fn from_data(data: ChunkData) -> Self {
        Self {
            info: None,
            data: Some(data),
        }
    }
}

/// Factory for sample streams, typically one per server connection.
pub trait StreamClient: Send + Sync {
    /// Opens a new stream together with a handle that can abort it from
    /// another thread.
    ///
    /// Opening must not wait for the server to become ready; an absent server
    /// surfaces as [`SamplerError::Unavailable`] from [`SampleStream::finish`]
    /// after the first failed write or read.
    ///
    /// [`SamplerError::Unavailable`]: crate::SamplerError::Unavailable
    fn open_stream(&self) -> (Box<dyn SampleStream>, Arc<dyn StreamHandle>);
}

/// A live bidirectional stream.
///
/// `write` and `read` return `false`/`None` once the stream is broken or
/// cancelled; the terminal status is then read with `finish`.
pub trait SampleStream: Send {
    fn write(&mut self, request: SampleRequest) -> bool;

    fn read(&mut self) -> Option<SampleResponse>;

    /// Terminal status of the stream. Only meaningful after `write` or `read`
    /// has failed.
    fn finish(&mut self) -> Result<()>;
}

/// Cancels the stream it was obtained from. Safe to call from any thread and
/// after the stream has already terminated.
pub trait StreamHandle: Send + Sync {
    fn cancel(&self);
}
