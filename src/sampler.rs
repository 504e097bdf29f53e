//! The sampling engine and its configuration.
mod base;
mod config;
pub use base::Sampler;
pub use config::SamplerConfig;
