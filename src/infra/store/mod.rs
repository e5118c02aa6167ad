//! Execution store backends.

pub mod memory;

pub use memory::InMemoryExecutionStore;
