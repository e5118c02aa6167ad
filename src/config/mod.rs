//! Configuration models for the engine and declared jobs.

pub mod engine;

pub use engine::{EngineConfig, JobConfig, SharedConfig};
