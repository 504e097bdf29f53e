//! Errors in the library.
use thiserror::Error;

/// Result type used throughout the sampling engine.
pub type Result<T, E = SamplerError> = std::result::Result<T, E>;

/// Errors produced while sampling from a replay table.
///
/// The variants mirror the status kinds that cross the consumer API. The type
/// is `Clone` because the first fatal worker error is held by the sampler and
/// handed back to every subsequent consumer call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SamplerError {
    /// The sampler has been closed.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// All requested samples have already been returned.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// Invalid configuration or a signature mismatch.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested view is not defined for the trajectory at hand.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// A batch view was requested after per-timestep iteration started.
    #[error("data loss: {0}")]
    DataLoss(String),

    /// A protocol violation between the engine and the table or server.
    #[error("internal error: {0}")]
    Internal(String),

    /// Transient transport failure. Workers retry on a fresh stream.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The rate limiter did not release a sample within the timeout.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
}

impl SamplerError {
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn out_of_range(msg: impl Into<String>) -> Self {
        Self::OutOfRange(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn failed_precondition(msg: impl Into<String>) -> Self {
        Self::FailedPrecondition(msg.into())
    }

    pub fn data_loss(msg: impl Into<String>) -> Self {
        Self::DataLoss(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn deadline_exceeded(msg: impl Into<String>) -> Self {
        Self::DeadlineExceeded(msg.into())
    }

    /// True for transient transport failures that must not poison the sampler.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// True when a table or rate limiter reported a timeout.
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded(_))
    }

    /// True when the error is the result of `close` being called.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// True when all requested samples have been returned.
    pub fn is_out_of_range(&self) -> bool {
        matches!(self, Self::OutOfRange(_))
    }
}
