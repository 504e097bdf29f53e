use crate::assemble::table_sample;
use crate::error::{Result, SamplerError};
use crate::queue::SampleQueue;
use crate::sample::Sample;
use crate::table::ReplayTable;
use crate::worker::SamplerWorker;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// How often a blocked table call returns so cancellation can be observed.
const WAKEUP_PERIOD: Duration = Duration::from_secs(3);

/// A worker that samples an in-process table directly.
///
/// There is no stream to abort, so the worker never blocks on the table for
/// more than [`WAKEUP_PERIOD`] at a time: it issues short timeouts and treats
/// a deadline-exceeded status as a wake-up as long as the caller's real
/// rate-limiter deadline lies in the future.
pub struct LocalWorker {
    table: Arc<dyn ReplayTable>,
    flexible_batch_size: usize,
    closed: Mutex<bool>,
}

impl LocalWorker {
    /// `flexible_batch_size` must already be resolved and capped by the
    /// sampler's `max_in_flight_samples_per_worker`.
    pub fn new(table: Arc<dyn ReplayTable>, flexible_batch_size: usize) -> Self {
        debug_assert!(flexible_batch_size >= 1);
        Self {
            table,
            flexible_batch_size,
            closed: Mutex::new(false),
        }
    }
}

impl SamplerWorker for LocalWorker {
    fn fetch_samples(
        &self,
        queue: &SampleQueue<Sample>,
        num_samples: usize,
        rate_limiter_timeout: Duration,
    ) -> (usize, Result<()>) {
        // A huge timeout means "no deadline"; `checked_add` keeps it from
        // overflowing the clock.
        let final_deadline = Instant::now().checked_add(rate_limiter_timeout);
        let deadline_passed = |deadline: Option<Instant>| match deadline {
            Some(d) => Instant::now() >= d,
            None => false,
        };

        let mut produced = 0;
        while produced < num_samples {
            if *self.closed.lock().unwrap() {
                return (
                    produced,
                    Err(SamplerError::cancelled("close called on sampler")),
                );
            }

            let now = Instant::now();
            let timeout = match final_deadline {
                Some(deadline) => deadline
                    .min(now + WAKEUP_PERIOD)
                    .saturating_duration_since(now),
                None => WAKEUP_PERIOD,
            };
            let batch_size = self.flexible_batch_size.min(num_samples - produced);

            let items = match self.table.sample_flexible_batch(batch_size, timeout) {
                Ok(items) => items,
                // A deadline ahead of the real one is just a wake-up to check
                // for cancellation.
                Err(err) if err.is_deadline_exceeded() && !deadline_passed(final_deadline) => {
                    continue;
                }
                Err(err) => return (produced, Err(err)),
            };

            for item in &items {
                let sample = match table_sample(item) {
                    Ok(sample) => sample,
                    Err(err) => return (produced, Err(err)),
                };
                if !queue.push(sample) {
                    return (
                        produced,
                        Err(SamplerError::cancelled("close called on sampler")),
                    );
                }
                produced += 1;
            }
        }

        if produced != num_samples {
            return (
                produced,
                Err(SamplerError::internal(format!(
                    "produced {} samples but {} were requested",
                    produced, num_samples
                ))),
            );
        }
        (produced, Ok(()))
    }

    fn cancel(&self) {
        *self.closed.lock().unwrap() = true;
    }
}
