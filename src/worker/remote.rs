use crate::assemble::{sample_is_done, stream_sample};
use crate::error::{Result, SamplerError};
use crate::queue::SampleQueue;
use crate::sample::Sample;
use crate::wire::{SampleRequest, StreamClient, StreamHandle};
use crate::worker::SamplerWorker;
use log::debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A worker that drives a bidirectional sample stream to a replay server.
///
/// Each `fetch_samples` call opens a fresh stream, splits its quota into
/// requests of at most `samples_per_request` samples and assembles the
/// responses one sample at a time. When the stream breaks, the worker reports
/// how far it got together with the stream's terminal status; transient
/// failures are retried by the sampler on a new stream.
pub struct RemoteWorker {
    client: Arc<dyn StreamClient>,
    table_name: String,
    samples_per_request: usize,
    flexible_batch_size: Option<usize>,
    state: Mutex<StreamState>,
}

struct StreamState {
    closed: bool,
    active: Option<Arc<dyn StreamHandle>>,
}

impl RemoteWorker {
    pub fn new(
        client: Arc<dyn StreamClient>,
        table_name: impl Into<String>,
        samples_per_request: usize,
        flexible_batch_size: Option<usize>,
    ) -> Self {
        Self {
            client,
            table_name: table_name.into(),
            samples_per_request,
            flexible_batch_size,
            state: Mutex::new(StreamState {
                closed: false,
                active: None,
            }),
        }
    }
}

impl SamplerWorker for RemoteWorker {
    fn fetch_samples(
        &self,
        queue: &SampleQueue<Sample>,
        num_samples: usize,
        rate_limiter_timeout: Duration,
    ) -> (usize, Result<()>) {
        let mut stream = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return (0, Err(SamplerError::cancelled("close called on sampler")));
            }
            let (stream, handle) = self.client.open_stream();
            state.active = Some(handle);
            stream
        };
        debug!(
            "opened sample stream to table '{}' for {} sample(s)",
            self.table_name, num_samples
        );

        let mut produced = 0;
        while produced < num_samples {
            let request = SampleRequest {
                table: self.table_name.clone(),
                num_samples: self.samples_per_request.min(num_samples - produced),
                rate_limiter_timeout,
                flexible_batch_size: self.flexible_batch_size,
            };
            let requested = request.num_samples;
            if !stream.write(request) {
                return (produced, stream.finish());
            }

            for _ in 0..requested {
                let mut responses = Vec::new();
                while !sample_is_done(&responses) {
                    match stream.read() {
                        Some(response) => responses.push(response),
                        None => return (produced, stream.finish()),
                    }
                }

                let sample = match stream_sample(responses) {
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
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        if let Some(handle) = &state.active {
            handle.cancel();
        }
    }
}
