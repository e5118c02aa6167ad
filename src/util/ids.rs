//! Identifier types shared across the engine.

use uuid::Uuid;

/// Identifier of a registered job.
pub type JobId = u64;

/// Identifier of an execution, assigned by the execution store.
pub type ExecutionId = u64;

/// Identifier of a worker loop occupying one concurrency slot.
pub type WorkerId = u64;

/// Groups executions of one batch.
pub type BatchId = Uuid;

/// Groups the ordered links of one chain.
pub type ChainId = Uuid;

/// Fresh random batch identifier.
#[must_use]
pub fn new_batch_id() -> BatchId {
    Uuid::new_v4()
}

/// Fresh random chain identifier.
#[must_use]
pub fn new_chain_id() -> ChainId {
    Uuid::new_v4()
}
