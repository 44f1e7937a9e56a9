use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{Cursor, LogGroup, ShardId, StartPosition};

/// Errors surfaced by the stream-service client.
///
/// Only `InvalidCursor` is retryable inside a fetch task (one retry against a
/// freshly resolved end cursor); everything else is surfaced to the caller.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid cursor {cursor} for shard {shard}")]
    InvalidCursor { shard: ShardId, cursor: Cursor },

    #[error("service error {code}: {message}")]
    Service { code: String, message: String },

    #[error("transport failure: {0}")]
    Transport(String),
}

impl ClientError {
    pub fn is_invalid_cursor(&self) -> bool {
        matches!(self, Self::InvalidCursor { .. })
    }
}

/// Result of one pull against the service.
#[derive(Debug, Clone)]
pub struct PulledBatch {
    pub groups: Vec<LogGroup>,
    /// Cursor to resume from; equal to the request cursor when the shard tail
    /// has been reached.
    pub next_cursor: Cursor,
    /// Raw (pre-decode) byte size reported by the service.
    pub raw_size: usize,
}

/// Wire-level client for the partitioned log stream service.
///
/// Implementations are constructed already bound to an endpoint, a consumer
/// group, and a consumer name; request signing, transport retries, and
/// response parsing live behind this trait and are out of scope for the
/// consumer engine.
#[async_trait]
pub trait StreamClient: Send + Sync {
    /// Pull up to `limit` log groups starting at `cursor`, optionally bounded
    /// by `end_cursor`.
    async fn pull(
        &self,
        shard: ShardId,
        cursor: &Cursor,
        limit: usize,
        end_cursor: Option<&Cursor>,
    ) -> Result<PulledBatch, ClientError>;

    /// Resolve a start position (begin / end / timestamp) to a cursor.
    async fn resolve_cursor(
        &self,
        shard: ShardId,
        position: &StartPosition,
    ) -> Result<Cursor, ClientError>;

    /// Durably bind the consumer group's position for `shard` to `cursor`.
    /// Returns the server-reported wall-clock time the cursor corresponds to.
    async fn persist_checkpoint(
        &self,
        shard: ShardId,
        cursor: &Cursor,
    ) -> Result<DateTime<Utc>, ClientError>;

    /// Read the consumer group's persisted position for `shard`, if any.
    async fn read_checkpoint(&self, shard: ShardId) -> Result<Option<Cursor>, ClientError>;
}
