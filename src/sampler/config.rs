use crate::error::{Result, SamplerError};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
    time::Duration,
};

/// Number of workers used when `num_workers` is left on auto.
pub(crate) const DEFAULT_NUM_WORKERS: usize = 2;

/// Per-stream quota used when `max_samples_per_stream` is left on auto.
pub(crate) const DEFAULT_MAX_SAMPLES_PER_STREAM: usize = 100;

/// Configuration of a [`Sampler`](crate::Sampler).
///
/// `None` stands for "unlimited" on `max_samples` and for "auto" everywhere
/// else; every `Some` value must be at least 1.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SamplerConfig {
    /// Total number of samples to fetch before the sampler reports
    /// out-of-range. `None` keeps sampling forever.
    pub max_samples: Option<usize>,

    /// Upper bound on samples a single worker may have in flight. For remote
    /// workers this is also the number of samples requested per stream
    /// write.
    pub max_in_flight_samples_per_worker: usize,

    /// Number of worker threads. `None` selects a default.
    pub num_workers: Option<usize>,

    /// Upper bound on the quota a worker takes per stream. `None` selects a
    /// default.
    pub max_samples_per_stream: Option<usize>,

    /// Upper bound on how long a single sample may wait on the table's rate
    /// limiter before the table reports deadline-exceeded.
    pub rate_limiter_timeout: Duration,

    /// Upper limit on items the table returns per acquisition of its
    /// internal lock. `None` lets the table pick.
    pub flexible_batch_size: Option<usize>,
}

impl SamplerConfig {
    /// Constructs [`SamplerConfig`] from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let config = serde_yaml::from_reader(rdr)?;
        Ok(config)
    }

    /// Saves [`SamplerConfig`] as YAML.
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }

    /// Checks the field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.max_samples == Some(0) {
            return Err(SamplerError::invalid_argument(
                "max_samples must be at least 1 when limited",
            ));
        }
        if self.max_in_flight_samples_per_worker == 0 {
            return Err(SamplerError::invalid_argument(
                "max_in_flight_samples_per_worker must be at least 1",
            ));
        }
        if self.num_workers == Some(0) {
            return Err(SamplerError::invalid_argument(
                "num_workers must be at least 1 when not auto",
            ));
        }
        if self.max_samples_per_stream == Some(0) {
            return Err(SamplerError::invalid_argument(
                "max_samples_per_stream must be at least 1 when not auto",
            ));
        }
        if self.flexible_batch_size == Some(0) {
            return Err(SamplerError::invalid_argument(
                "flexible_batch_size must be at least 1 when not auto",
            ));
        }
        Ok(())
    }

    /// Total sample budget with "unlimited" mapped to `usize::MAX`.
    pub(crate) fn resolved_max_samples(&self) -> usize {
        self.max_samples.unwrap_or(usize::MAX)
    }

    pub(crate) fn resolved_max_samples_per_stream(&self) -> usize {
        self.max_samples_per_stream
            .unwrap_or(DEFAULT_MAX_SAMPLES_PER_STREAM)
    }

    /// Worker count actually spawned: workers that could never receive any
    /// quota are not created.
    pub(crate) fn effective_num_workers(&self) -> usize {
        let configured = self.num_workers.unwrap_or(DEFAULT_NUM_WORKERS);
        let useful = (self.resolved_max_samples() / self.max_in_flight_samples_per_worker).max(1);
        configured.min(useful)
    }

    /// Queue capacity: one slot per configured worker, at least one.
    pub(crate) fn queue_capacity(&self) -> usize {
        self.num_workers.unwrap_or(1).max(1)
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            max_samples: None,
            max_in_flight_samples_per_worker: 100,
            num_workers: None,
            max_samples_per_stream: None,
            rate_limiter_timeout: Duration::ZERO,
            flexible_batch_size: None,
        }
    }
}
