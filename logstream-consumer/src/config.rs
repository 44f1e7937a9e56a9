use std::time::Duration;

use chrono::{DateTime, Utc};
use envconfig::Envconfig;

use crate::types::StartPosition;

/// Consumer-group engine configuration.
///
/// Sourced from the environment via `Envconfig` the way services configure
/// themselves, or constructed programmatically (all fields are public and
/// `Default` mirrors the environment defaults). Endpoint and credentials are
/// opaque to the engine; they are carried for whatever constructs the
/// `StreamClient` and `LeaseManager` implementations.
#[derive(Envconfig, Debug, Clone)]
pub struct ConsumerConfig {
    #[envconfig(from = "STREAM_ENDPOINT", default = "")]
    pub endpoint: String,

    #[envconfig(from = "STREAM_ACCESS_KEY_ID", default = "")]
    pub access_key_id: String,

    #[envconfig(from = "STREAM_ACCESS_KEY_SECRET", default = "")]
    pub access_key_secret: String,

    #[envconfig(from = "CONSUMER_GROUP", default = "default-group")]
    pub consumer_group: String,

    #[envconfig(from = "CONSUMER_NAME", default = "consumer-1")]
    pub consumer_name: String,

    /// Where to start when no persisted checkpoint exists: `begin`, `end`,
    /// or an RFC 3339 timestamp.
    #[envconfig(from = "START_POSITION", default = "begin")]
    pub start_position: StartPosition,

    /// Bounded consumption: stop once every held shard has caught up to this
    /// time. Unset means open-ended tailing.
    #[envconfig(from = "CONSUMER_END_TIME")]
    pub end_time: Option<DateTime<Utc>>,

    #[envconfig(from = "HEARTBEAT_INTERVAL_SECS", default = "20")]
    pub heartbeat_interval_secs: u64,

    #[envconfig(from = "DATA_FETCH_INTERVAL_MS", default = "2000")]
    pub data_fetch_interval_ms: u64,

    /// How long the service holds a lease without heartbeats before
    /// reassigning its shards.
    #[envconfig(from = "LEASE_TIMEOUT_SECS", default = "60")]
    pub lease_timeout_secs: u64,

    /// Maximum log groups per pull.
    #[envconfig(from = "MAX_FETCH_GROUPS", default = "1000")]
    pub max_fetch_groups: usize,

    /// Workers in an owned pool. Ignored when a shared pool is supplied.
    #[envconfig(from = "WORKER_POOL_SIZE", default = "4")]
    pub worker_pool_size: usize,

    /// Coalesce pulls until a fetch aggregates at least this many raw bytes.
    /// Zero disables coalescing.
    #[envconfig(from = "MIN_FETCH_BYTES", default = "0")]
    pub min_fetch_bytes: usize,

    /// Byte budget for fetched-but-unprocessed data across all shards.
    /// Zero means unlimited.
    #[envconfig(from = "MAX_IN_FLIGHT_BYTES", default = "0")]
    pub max_in_flight_bytes: usize,

    /// Bytes reserved against the budget before a fetch's real size is known.
    #[envconfig(from = "FETCH_PREALLOC_BYTES", default = "2097152")]
    pub fetch_prealloc_bytes: usize,

    #[envconfig(from = "CHECKPOINT_FLUSH_INTERVAL_SECS", default = "60")]
    pub checkpoint_flush_interval_secs: u64,

    #[envconfig(from = "METRIC_FLUSH_INTERVAL_SECS", default = "300")]
    pub metric_flush_interval_secs: u64,

    /// Ask the lease layer to finish a parent shard before consuming its
    /// children after a split.
    #[envconfig(from = "IN_ORDER_SHARD_SPLITS", default = "false")]
    pub in_order: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            access_key_id: String::new(),
            access_key_secret: String::new(),
            consumer_group: "default-group".to_string(),
            consumer_name: "consumer-1".to_string(),
            start_position: StartPosition::Begin,
            end_time: None,
            heartbeat_interval_secs: 20,
            data_fetch_interval_ms: 2000,
            lease_timeout_secs: 60,
            max_fetch_groups: 1000,
            worker_pool_size: 4,
            min_fetch_bytes: 0,
            max_in_flight_bytes: 0,
            fetch_prealloc_bytes: 2 * 1024 * 1024,
            checkpoint_flush_interval_secs: 60,
            metric_flush_interval_secs: 300,
            in_order: false,
        }
    }
}

impl ConsumerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn data_fetch_interval(&self) -> Duration {
        Duration::from_millis(self.data_fetch_interval_ms)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    pub fn checkpoint_flush_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_flush_interval_secs)
    }

    pub fn metric_flush_interval(&self) -> Duration {
        Duration::from_secs(self.metric_flush_interval_secs)
    }
}
