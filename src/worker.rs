//! Producer-side workers feeding the sample queue.
mod base;
mod local;
mod remote;
pub use base::SamplerWorker;
pub use local::LocalWorker;
pub use remote::RemoteWorker;
