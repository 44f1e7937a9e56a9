//! Pull-based consumer-group engine for a partitioned, append-only log
//! stream service.
//!
//! A [`ConsumerCoordinator`] asks its lease collaborator which shards it
//! holds, runs one [`shard::ShardConsumer`] state machine per held shard, and
//! drives each through non-blocking ticks: fetch tasks prefetch one batch
//! ahead of processing, a byte-budget barrier bounds buffered data, and each
//! shard's [`CheckpointTracker`] reconciles in-memory progress with the
//! durable checkpoint store. Delivery is at-least-once; checkpoint cadence is
//! under the processor's control.
//!
//! Transport, lease protocol, and admission internals stay behind the
//! [`StreamClient`], [`LeaseManager`], and [`ResourceBarrier`] traits.

pub mod barrier;
pub mod checkpoint;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod lease;
pub mod metrics_consts;
pub mod pool;
pub mod processor;
pub mod shard;
pub mod tasks;
pub mod test_utils;
pub mod types;

pub use barrier::{FixedResourceBarrier, ResourceBarrier, UnlimitedResourceBarrier};
pub use checkpoint::{CheckpointError, CheckpointTracker, ProgressCounters};
pub use client::{ClientError, PulledBatch, StreamClient};
pub use config::ConsumerConfig;
pub use coordinator::ConsumerCoordinator;
pub use lease::LeaseManager;
pub use pool::WorkerPool;
pub use processor::{ProcessOutcome, ProcessorFactory, ShardProcessor};
pub use shard::{ShardConsumer, ShardState};
pub use types::{Cursor, FetchedBatch, LogGroup, LogRecord, ShardId, StartPosition};
