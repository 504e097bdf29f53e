use crate::error::Result;
use crate::queue::SampleQueue;
use crate::sample::Sample;
use std::time::Duration;

/// A producer of assembled samples.
///
/// One worker owns one sampling session at a time (a server stream, or a
/// direct handle on an in-process table). The sampler runs each worker on its
/// own thread and hands it quotas to fetch.
pub trait SamplerWorker: Send + Sync {
    /// Fetches up to `num_samples` samples and pushes each one to `queue` as
    /// soon as it is assembled.
    ///
    /// Returns the number of samples actually pushed together with the final
    /// status. The two are reported separately because a session can break
    /// after delivering part of its quota; the caller refunds the difference
    /// so the undelivered samples can be requested again.
    ///
    /// `rate_limiter_timeout` bounds how long a single sample may wait on the
    /// table's rate limiter. It is not a deadline for the call as a whole.
    fn fetch_samples(
        &self,
        queue: &SampleQueue<Sample>,
        num_samples: usize,
        rate_limiter_timeout: Duration,
    ) -> (usize, Result<()>);

    /// Marks the worker closed and aborts its active session, if any. Active
    /// and future `fetch_samples` calls finish with
    /// [`SamplerError::Cancelled`].
    ///
    /// [`SamplerError::Cancelled`]: crate::SamplerError::Cancelled
    fn cancel(&self);
}
