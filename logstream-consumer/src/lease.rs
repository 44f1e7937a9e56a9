use async_trait::async_trait;

use crate::types::ShardId;

/// Heartbeat-maintained ownership claim over a set of shards.
///
/// The coordinator only ever asks "which shards do I currently hold"; the
/// assignment protocol (heartbeating, shard splitting, parent-before-child
/// sequencing when in-order consumption is configured) lives behind this
/// trait.
#[async_trait]
pub trait LeaseManager: Send + Sync {
    /// Start heartbeating. Called once before the coordinator loop runs.
    async fn start(&self) -> anyhow::Result<()>;

    /// The shards this consumer currently holds.
    async fn held_shards(&self) -> Vec<ShardId>;

    /// Drop `shard` from the heartbeat set after its state machine has fully
    /// shut down.
    async fn release(&self, shard: ShardId);

    /// Stop heartbeating. Shards are reassigned by the service once the lease
    /// times out.
    async fn shutdown(&self);
}
