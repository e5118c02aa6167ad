//! Infrastructure adapters for execution storage backends.

pub mod store;

pub use store::InMemoryExecutionStore;
