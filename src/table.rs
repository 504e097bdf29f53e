//! Interface of an in-process replay table.
//!
//! When the table lives in the same process there is no stream to drive; the
//! local worker calls [`ReplayTable::sample_flexible_batch`] directly and
//! assembles samples from chunks shared with the table's chunk store.
use crate::chunk::{ChunkData, ItemInfo};
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;

/// One item drawn from the table, with the chunks backing its trajectory.
///
/// Chunks are reference-counted with the table's store; they stay alive for
/// as long as the assembled sample needs them and no longer.
#[derive(Clone, Debug)]
pub struct SampledItem {
    pub item: ItemInfo,

    /// Inclusion probability of the item at sampling time.
    pub probability: f64,

    /// Number of items in the table at sampling time.
    pub table_size: i64,

    /// Every chunk referenced by `item.trajectory`.
    pub chunks: Vec<Arc<ChunkData>>,
}

/// Sampling surface of an in-process replay table.
pub trait ReplayTable: Send + Sync {
    fn name(&self) -> &str;

    /// Returns up to `batch_size` items without releasing the table lock
    /// between them.
    ///
    /// May block up to `timeout` waiting on the table's rate limiter, in
    /// which case it returns [`SamplerError::DeadlineExceeded`]. The local
    /// worker issues short timeouts on purpose and treats that status as a
    /// wake-up, not a failure.
    ///
    /// [`SamplerError::DeadlineExceeded`]: crate::SamplerError::DeadlineExceeded
    fn sample_flexible_batch(
        &self,
        batch_size: usize,
        timeout: Duration,
    ) -> Result<Vec<SampledItem>>;

    /// Batch size the table considers efficient, used when the sampler's
    /// `flexible_batch_size` is left on auto.
    fn default_flexible_batch_size(&self) -> usize;
}
