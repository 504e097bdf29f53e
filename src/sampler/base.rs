use crate::error::{Result, SamplerError};
use crate::queue::SampleQueue;
use crate::sample::Sample;
use crate::sampler::SamplerConfig;
use crate::signature::{validate_output, Signature, ValidationMode};
use crate::table::ReplayTable;
use crate::tensor::Tensor;
use crate::wire::StreamClient;
use crate::worker::{LocalWorker, RemoteWorker, SamplerWorker};
use log::{info, warn};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Counters and terminal flags shared by the workers and the consumer.
///
/// `requested` counts samples some worker has been dispatched for;
/// `returned` counts samples handed to the consumer. A worker that fails to
/// deliver part of its quota refunds the difference, so
/// `requested - returned` always equals the number of buffered plus in-flight
/// samples.
struct SharedState {
    requested: usize,
    returned: usize,
    closed: bool,
    /// First fatal worker error; sticky once set.
    worker_status: Result<()>,
}

struct Shared {
    state: Mutex<SharedState>,
    wake_workers: Condvar,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(SharedState {
                requested: 0,
                returned: 0,
                closed: false,
                worker_status: Ok(()),
            }),
            wake_workers: Condvar::new(),
        }
    }
}

impl SharedState {
    fn should_stop_workers(&self, max_samples: usize) -> bool {
        self.closed || self.returned == max_samples || self.worker_status.is_err()
    }
}

/// Samples items from a replay table through a pool of worker threads.
///
/// Workers fetch samples concurrently — remotely over bidirectional streams
/// or directly from an in-process table — and push them into a bounded queue
/// in the order they complete. The consumer drains the queue through
/// [`Sampler::next_timestep`], [`Sampler::next_sample`] or
/// [`Sampler::next_trajectory`].
///
/// All methods take `&self`, so the sampler can be shared behind an [`Arc`]
/// and [`Sampler::close`] may interrupt a consumer blocked on an empty queue
/// from another thread. Consumer calls themselves are serialized internally;
/// running several consumer threads is possible but gains nothing.
///
/// The first fatal worker error is sticky: once observed, every subsequent
/// consumer call returns it. Transient transport failures
/// ([`SamplerError::Unavailable`]) are retried on a fresh stream and never
/// poison the sampler.
pub struct Sampler {
    table_name: String,
    max_samples: usize,
    signature: Option<Signature>,
    shared: Arc<Shared>,
    queue: Arc<SampleQueue<Sample>>,
    workers: Vec<Arc<dyn SamplerWorker>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    /// Sample currently being iterated by `next_timestep`. The lock also
    /// serializes consumer calls.
    active_sample: Mutex<Option<Sample>>,
}

impl Sampler {
    /// Creates a sampler that streams from a remote replay server.
    pub fn new_remote(
        client: Arc<dyn StreamClient>,
        table_name: impl Into<String>,
        config: &SamplerConfig,
        signature: Option<Signature>,
    ) -> Result<Self> {
        config.validate()?;
        let table_name = table_name.into();
        let workers: Vec<Arc<dyn SamplerWorker>> = (0..config.effective_num_workers())
            .map(|_| {
                Arc::new(RemoteWorker::new(
                    client.clone(),
                    table_name.clone(),
                    config.max_in_flight_samples_per_worker,
                    config.flexible_batch_size,
                )) as Arc<dyn SamplerWorker>
            })
            .collect();
        Self::with_workers(workers, table_name, config, signature)
    }

    /// Creates a sampler that draws from a table in the same process.
    pub fn new_local(
        table: Arc<dyn ReplayTable>,
        config: &SamplerConfig,
        signature: Option<Signature>,
    ) -> Result<Self> {
        config.validate()?;
        // Local workers have no per-request cap, so the flexible batch size
        // takes over that role and is limited accordingly.
        let flexible_batch_size = config
            .flexible_batch_size
            .unwrap_or_else(|| table.default_flexible_batch_size())
            .min(config.max_in_flight_samples_per_worker)
            .max(1);
        let table_name = table.name().to_string();
        let workers: Vec<Arc<dyn SamplerWorker>> = (0..config.effective_num_workers())
            .map(|_| {
                Arc::new(LocalWorker::new(table.clone(), flexible_batch_size))
                    as Arc<dyn SamplerWorker>
            })
            .collect();
        Self::with_workers(workers, table_name, config, signature)
    }

    /// Starts one thread per worker. Used by both constructors and by tests
    /// that inject their own workers.
    pub(crate) fn with_workers(
        workers: Vec<Arc<dyn SamplerWorker>>,
        table_name: String,
        config: &SamplerConfig,
        signature: Option<Signature>,
    ) -> Result<Self> {
        config.validate()?;
        let max_samples = config.resolved_max_samples();
        let max_samples_per_stream = config.resolved_max_samples_per_stream();
        let shared = Arc::new(Shared::new());
        let queue = Arc::new(SampleQueue::new(config.queue_capacity()));

        let mut threads = Vec::with_capacity(workers.len());
        for (i, worker) in workers.iter().enumerate() {
            let worker_loop = WorkerLoop {
                shared: shared.clone(),
                queue: queue.clone(),
                worker: worker.clone(),
                table_name: table_name.clone(),
                max_samples,
                max_samples_per_stream,
                rate_limiter_timeout: config.rate_limiter_timeout,
            };
            let thread = std::thread::Builder::new()
                .name(format!("sampler-worker-{}", i))
                .spawn(move || worker_loop.run())
                .map_err(|e| {
                    SamplerError::internal(format!("failed to spawn worker thread: {}", e))
                })?;
            threads.push(thread);
        }
        info!(
            "sampler for table '{}' started {} worker(s)",
            table_name,
            workers.len()
        );

        Ok(Self {
            table_name,
            max_samples,
            signature,
            shared,
            queue,
            workers,
            threads: Mutex::new(threads),
            active_sample: Mutex::new(None),
        })
    }

    /// Returns the next timestep of the current sample, popping a new sample
    /// when the previous one is exhausted. The boolean is `true` on the last
    /// timestep of a sample.
    ///
    /// Fails with [`SamplerError::InvalidArgument`] when the sampled
    /// trajectory cannot be decomposed into timesteps.
    pub fn next_timestep(&self) -> Result<(Vec<Tensor>, bool)> {
        let mut active = self.active_sample.lock().unwrap();
        let exhausted = active.as_ref().map_or(true, |s| s.is_end_of_sample());
        if exhausted {
            *active = Some(self.pop_next_sample()?);
        }
        let sample = match active.as_mut() {
            Some(sample) => sample,
            None => return Err(SamplerError::internal("no active sample after pop")),
        };

        if !sample.is_timestep_decomposable() {
            return Err(SamplerError::invalid_argument(
                "sampled trajectory cannot be decomposed into timesteps",
            ));
        }

        let data = sample.next_timestep()?;
        validate_output(
            &data,
            self.signature.as_ref(),
            &self.table_name,
            ValidationMode::Timestep,
        )?;

        let end_of_sample = sample.is_end_of_sample();
        if end_of_sample {
            self.mark_returned();
        }
        Ok((data, end_of_sample))
    }

    /// Pops the next sample and materializes it as a batch of timesteps.
    pub fn next_sample(&self) -> Result<Vec<Tensor>> {
        let mut sample = self.pop_next_sample()?;
        let data = sample.as_batched_timesteps()?;
        validate_output(
            &data,
            self.signature.as_ref(),
            &self.table_name,
            ValidationMode::BatchedTimestep,
        )?;
        self.mark_returned();
        Ok(data)
    }

    /// Pops the next sample and materializes it as a trajectory.
    pub fn next_trajectory(&self) -> Result<Vec<Tensor>> {
        let mut sample = self.pop_next_sample()?;
        let data = sample.as_trajectory()?;
        validate_output(
            &data,
            self.signature.as_ref(),
            &self.table_name,
            ValidationMode::Trajectory,
        )?;
        self.mark_returned();
        Ok(data)
    }

    /// Stops all workers, closes the queue and joins the worker threads.
    /// Idempotent and callable from any thread; also called on drop.
    ///
    /// A local worker blocked on the table returns within one wake-up period
    /// (3 seconds), so `close` can take that long in the worst case.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.shared.wake_workers.notify_all();

        for worker in &self.workers {
            worker.cancel();
        }
        self.queue.close();

        let threads: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        for thread in threads {
            let _ = thread.join();
        }
        info!("sampler for table '{}' closed", self.table_name);
    }

    fn pop_next_sample(&self) -> Result<Sample> {
        if let Some(sample) = self.queue.pop() {
            return Ok(sample);
        }

        // The queue is closed; report why.
        let state = self.shared.state.lock().unwrap();
        if state.returned == self.max_samples {
            return Err(SamplerError::out_of_range("max_samples already returned"));
        }
        if state.closed {
            return Err(SamplerError::cancelled("sampler has been closed"));
        }
        match &state.worker_status {
            Err(err) => Err(err.clone()),
            Ok(()) => Err(SamplerError::internal("sample queue closed unexpectedly")),
        }
    }

    /// Counts one sample as returned; reaching `max_samples` shuts the queue
    /// so blocked workers and subsequent pops observe completion.
    fn mark_returned(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.returned += 1;
        if state.returned == self.max_samples {
            self.queue.close();
        }
        drop(state);
        self.shared.wake_workers.notify_all();
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.close();
    }
}

/// Per-thread worker loop: wait for quota, fetch, settle the counters.
struct WorkerLoop {
    shared: Arc<Shared>,
    queue: Arc<SampleQueue<Sample>>,
    worker: Arc<dyn SamplerWorker>,
    table_name: String,
    max_samples: usize,
    max_samples_per_stream: usize,
    rate_limiter_timeout: Duration,
}

impl WorkerLoop {
    fn run(self) {
        loop {
            let quota = {
                let mut state = self.shared.state.lock().unwrap();
                while !state.should_stop_workers(self.max_samples)
                    && state.requested >= self.max_samples
                {
                    state = self.shared.wake_workers.wait(state).unwrap();
                }
                if state.should_stop_workers(self.max_samples) {
                    return;
                }
                let quota = self
                    .max_samples_per_stream
                    .min(self.max_samples - state.requested);
                state.requested += quota;
                quota
            };

            let (produced, status) =
                self.worker
                    .fetch_samples(&self.queue, quota, self.rate_limiter_timeout);

            let mut state = self.shared.state.lock().unwrap();
            // Refund the part of the quota a broken session failed to
            // deliver.
            state.requested -= quota - produced;

            if let Err(err) = status {
                if err.is_unavailable() {
                    warn!(
                        "sample stream for table '{}' broke after {} of {} sample(s), \
                         retrying: {}",
                        self.table_name, produced, quota, err
                    );
                } else if state.worker_status.is_ok() {
                    state.worker_status = Err(err);
                    // Unblock pending pops; they will read the sticky status.
                    self.queue.close();
                    drop(state);
                    self.shared.wake_workers.notify_all();
                    return;
                }
            }
            drop(state);
            self.shared.wake_workers.notify_all();
        }
    }
}
