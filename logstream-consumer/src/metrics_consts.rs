// ==== Fetch pipeline metrics ====
/// Counter for fetches denied by the admission-control barrier
pub const FETCH_THROTTLED_TOTAL: &str = "logstream_consumer_fetch_throttled_total";

/// Counter for successfully fetched batches
pub const FETCH_BATCHES_TOTAL: &str = "logstream_consumer_fetch_batches_total";

/// Counter for fetch task failures (after in-task retries)
pub const FETCH_FAILURES_TOTAL: &str = "logstream_consumer_fetch_failures_total";

/// Gauge for bytes currently reserved against the admission budget
pub const IN_FLIGHT_BYTES: &str = "logstream_consumer_in_flight_bytes";

// ==== Checkpoint metrics ====
/// Counter for checkpoint write-throughs
pub const CHECKPOINT_FLUSHES_TOTAL: &str = "logstream_consumer_checkpoint_flushes_total";

/// Counter for checkpoint persist failures
pub const CHECKPOINT_FLUSH_FAILURES_TOTAL: &str =
    "logstream_consumer_checkpoint_flush_failures_total";

/// Gauge for estimated consumption latency per shard (seconds)
pub const CHECKPOINT_LATENCY_SECONDS: &str = "logstream_consumer_checkpoint_latency_seconds";

// ==== Coordinator metrics ====
/// Gauge for shard state machines currently tracked by the coordinator
pub const SHARDS_TRACKED: &str = "logstream_consumer_shards_tracked";

/// Counter for framework task failures, labelled by task kind
pub const TASK_FAILURES_TOTAL: &str = "logstream_consumer_task_failures_total";
