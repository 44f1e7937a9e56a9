use async_trait::async_trait;

use crate::checkpoint::CheckpointTracker;
use crate::types::{Cursor, FetchedBatch, ShardId};

/// What a processor wants the engine to do after handling a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Keep consuming from the batch's natural next cursor.
    Continue,
    /// Rewind: discard any prefetched data and resume fetching from this
    /// cursor, re-delivering data the processor failed to handle.
    RollbackTo(Cursor),
}

/// User-supplied per-shard processing logic.
///
/// One processor instance is constructed per held shard and driven from the
/// worker pool: `initialize` once, `process` per fetched batch, `shutdown`
/// once. Delivery is at-least-once; checkpoint cadence is under the
/// processor's control through the tracker it is handed.
#[async_trait]
pub trait ShardProcessor: Send {
    async fn initialize(&mut self, shard: ShardId) -> anyhow::Result<()>;

    /// Handle one batch. Returning `RollbackTo` demands re-delivery from the
    /// given cursor; errors stall the shard (the same batch class is retried)
    /// without crashing the coordinator.
    async fn process(
        &mut self,
        batch: FetchedBatch,
        tracker: &CheckpointTracker,
    ) -> anyhow::Result<ProcessOutcome>;

    async fn shutdown(&mut self, tracker: &CheckpointTracker) -> anyhow::Result<()>;
}

/// Builds one processor per newly held shard.
///
/// A construction failure is fatal to the whole coordinator: it cannot run
/// without a processor.
pub trait ProcessorFactory: Send + Sync {
    fn build(&self) -> anyhow::Result<Box<dyn ShardProcessor>>;
}

impl<F> ProcessorFactory for F
where
    F: Fn() -> anyhow::Result<Box<dyn ShardProcessor>> + Send + Sync,
{
    fn build(&self) -> anyhow::Result<Box<dyn ShardProcessor>> {
        self()
    }
}
