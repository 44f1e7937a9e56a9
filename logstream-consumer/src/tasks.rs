//! The four unit-of-work implementations the shard state machine dispatches
//! onto the worker pool. Every task catches its own errors and folds them
//! into a `TaskResult`; nothing escapes the pool boundary unhandled.

use std::sync::Arc;

use anyhow::Error;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::barrier::ResourceBarrier;
use crate::checkpoint::CheckpointTracker;
use crate::client::StreamClient;
use crate::processor::{ProcessOutcome, ShardProcessor};
use crate::types::{Cursor, FetchedBatch, ShardId, StartPosition};

/// A processor shared between the tasks of one shard. At most one framework
/// task runs per shard at a time, so the lock is uncontended.
pub type SharedProcessor = Arc<Mutex<Box<dyn ShardProcessor>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Init,
    Fetch,
    Process,
    Shutdown,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Fetch => "fetch",
            Self::Process => "process",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Starting state resolved by the init task.
#[derive(Debug, Clone)]
pub struct InitOutcome {
    pub cursor: Cursor,
    /// True when the cursor came from a persisted checkpoint rather than the
    /// configured start position.
    pub persistent: bool,
    /// Resolved once here when a bounded end time is configured.
    pub end_cursor: Option<Cursor>,
}

/// Result of one dispatched task, consumed exactly once by the state machine
/// that submitted it.
#[derive(Debug)]
pub enum TaskResult {
    Init(Result<InitOutcome, Error>),
    Fetch(Result<FetchedBatch, Error>),
    Process(Result<ProcessOutcome, Error>),
    Shutdown(Result<(), Error>),
}

impl TaskResult {
    pub fn failed(kind: TaskKind, err: Error) -> Self {
        match kind {
            TaskKind::Init => Self::Init(Err(err)),
            TaskKind::Fetch => Self::Fetch(Err(err)),
            TaskKind::Process => Self::Process(Err(err)),
            TaskKind::Shutdown => Self::Shutdown(Err(err)),
        }
    }

    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Init(_) => TaskKind::Init,
            Self::Fetch(_) => TaskKind::Fetch,
            Self::Process(_) => TaskKind::Process,
            Self::Shutdown(_) => TaskKind::Shutdown,
        }
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            Self::Init(Err(e))
            | Self::Fetch(Err(e))
            | Self::Process(Err(e))
            | Self::Shutdown(Err(e)) => Some(e),
            _ => None,
        }
    }
}

/// Init: run the user's initialization hook, then resolve the starting
/// cursor (persisted checkpoint wins over the configured start position) and,
/// for bounded consumption, the end cursor.
pub(crate) async fn initialize_task(
    processor: SharedProcessor,
    client: Arc<dyn StreamClient>,
    shard: ShardId,
    start_position: StartPosition,
    end_time: Option<DateTime<Utc>>,
) -> TaskResult {
    TaskResult::Init(run_initialize(processor, client, shard, start_position, end_time).await)
}

async fn run_initialize(
    processor: SharedProcessor,
    client: Arc<dyn StreamClient>,
    shard: ShardId,
    start_position: StartPosition,
    end_time: Option<DateTime<Utc>>,
) -> Result<InitOutcome, Error> {
    processor.lock().await.initialize(shard).await?;

    let (cursor, persistent) = match client.read_checkpoint(shard).await? {
        Some(checkpoint) if !checkpoint.is_empty() => (checkpoint, true),
        _ => (client.resolve_cursor(shard, &start_position).await?, false),
    };

    let end_cursor = match end_time {
        Some(end) => Some(
            client
                .resolve_cursor(shard, &StartPosition::Timestamp(end))
                .await?,
        ),
        None => None,
    };

    debug!(%shard, cursor = %cursor, persistent, "resolved starting cursor");
    Ok(InitOutcome {
        cursor,
        persistent,
        end_cursor,
    })
}

/// Fetch: pull one batch, retrying at most once (and only for an
/// invalid-cursor failure on the first attempt, against a freshly resolved
/// end cursor), then coalesce further pulls until the configured minimum byte
/// threshold is met. Converts the admission pre-allocation into the real
/// reservation on success and releases it fully on failure.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn fetch_task(
    client: Arc<dyn StreamClient>,
    barrier: Arc<dyn ResourceBarrier>,
    shard: ShardId,
    cursor: Cursor,
    limit: usize,
    end_cursor: Option<Cursor>,
    min_fetch_bytes: usize,
    preallocated: usize,
) -> TaskResult {
    match run_fetch(client, shard, cursor, limit, end_cursor, min_fetch_bytes).await {
        Ok(batch) => {
            barrier.acquire(shard, batch.raw_size as i64 - preallocated as i64);
            TaskResult::Fetch(Ok(batch))
        }
        Err(e) => {
            barrier.release(shard, preallocated);
            TaskResult::Fetch(Err(e))
        }
    }
}

async fn run_fetch(
    client: Arc<dyn StreamClient>,
    shard: ShardId,
    cursor: Cursor,
    limit: usize,
    end_cursor: Option<Cursor>,
    min_fetch_bytes: usize,
) -> Result<FetchedBatch, Error> {
    let mut pull_cursor = cursor;
    let first = client
        .pull(shard, &pull_cursor, limit, end_cursor.as_ref())
        .await;

    let pulled = match first {
        Ok(pulled) => pulled,
        Err(e) if e.is_invalid_cursor() => {
            warn!(%shard, cursor = %pull_cursor, "invalid cursor, re-resolving to shard end for one retry");
            pull_cursor = client.resolve_cursor(shard, &StartPosition::End).await?;
            client
                .pull(shard, &pull_cursor, limit, end_cursor.as_ref())
                .await?
        }
        Err(e) => return Err(e.into()),
    };

    let mut groups = pulled.groups;
    let mut raw_size = pulled.raw_size;
    let mut next_cursor = pulled.next_cursor;

    // Batch coalescing: keep pulling until the aggregate meets the byte
    // threshold or the cursor stops advancing. An intermediate failure
    // returns the partial aggregate instead of discarding progress.
    if min_fetch_bytes > 0 {
        while raw_size < min_fetch_bytes && next_cursor != pull_cursor {
            pull_cursor = next_cursor.clone();
            match client
                .pull(shard, &pull_cursor, limit, end_cursor.as_ref())
                .await
            {
                Ok(more) => {
                    groups.extend(more.groups);
                    raw_size += more.raw_size;
                    next_cursor = more.next_cursor;
                }
                Err(e) => {
                    warn!(%shard, error = ?e, "coalescing pull failed, returning partial aggregate");
                    break;
                }
            }
        }
    }

    Ok(FetchedBatch {
        shard,
        groups,
        end_cursor: next_cursor,
        raw_size,
    })
}

/// Process: hand the batch to the user processor, then release the batch's
/// byte reservation unconditionally before returning, success or not.
pub(crate) async fn process_task(
    processor: SharedProcessor,
    barrier: Arc<dyn ResourceBarrier>,
    tracker: Arc<CheckpointTracker>,
    batch: FetchedBatch,
) -> TaskResult {
    let shard = batch.shard;
    let raw_size = batch.raw_size;
    let groups = batch.group_count() as u64;

    let outcome = processor.lock().await.process(batch, &tracker).await;
    barrier.release(shard, raw_size);

    match outcome {
        Ok(outcome) => {
            tracker.record_delivered(groups, raw_size as u64).await;
            tracker.flush_check().await;
            TaskResult::Process(Ok(outcome))
        }
        Err(e) => {
            tracker.record_failed(groups).await;
            TaskResult::Process(Err(e))
        }
    }
}

/// Shutdown: run the user shutdown hook (errors logged, never propagated),
/// then read back the persisted checkpoint for the shutdown log line.
pub(crate) async fn shutdown_task(
    processor: SharedProcessor,
    client: Arc<dyn StreamClient>,
    tracker: Arc<CheckpointTracker>,
    shard: ShardId,
) -> TaskResult {
    if let Err(e) = processor.lock().await.shutdown(&tracker).await {
        warn!(%shard, error = ?e, "processor shutdown hook failed");
    }

    match client.read_checkpoint(shard).await {
        Ok(checkpoint) => info!(
            %shard,
            checkpoint = %checkpoint.unwrap_or_default(),
            "shard shut down"
        ),
        Err(e) => warn!(%shard, error = ?e, "failed to read checkpoint during shutdown"),
    }

    TaskResult::Shutdown(Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::{FixedResourceBarrier, ResourceBarrier};
    use crate::client::ClientError;
    use crate::test_utils::{log_group, MemoryStreamClient, TestProcessor};

    const SHARD: ShardId = ShardId(3);

    fn shared(processor: TestProcessor) -> SharedProcessor {
        let boxed: Box<dyn ShardProcessor> = Box::new(processor);
        Arc::new(Mutex::new(boxed))
    }

    #[tokio::test]
    async fn init_prefers_persisted_checkpoint() {
        let client = Arc::new(MemoryStreamClient::new());
        client.seed_groups(SHARD, vec![log_group("a", 2, Utc::now())]);
        client.set_checkpoint(SHARD, Cursor::new("1"));
        let (processor, state) = TestProcessor::create();

        let result = initialize_task(
            shared(processor),
            client,
            SHARD,
            StartPosition::Begin,
            None,
        )
        .await;
        let TaskResult::Init(Ok(init)) = result else {
            panic!("init failed");
        };
        assert_eq!(init.cursor, Cursor::new("1"));
        assert!(init.persistent);
        assert!(init.end_cursor.is_none());
        assert!(state.initialized.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn init_resolves_start_position_and_end_cursor() {
        let client = Arc::new(MemoryStreamClient::new());
        let now = Utc::now();
        client.seed_groups(
            SHARD,
            vec![log_group("a", 1, now), log_group("b", 1, now)],
        );
        let (processor, _state) = TestProcessor::create();

        let result = initialize_task(
            shared(processor),
            client,
            SHARD,
            StartPosition::Begin,
            Some(now + chrono::TimeDelta::hours(1)),
        )
        .await;
        let TaskResult::Init(Ok(init)) = result else {
            panic!("init failed");
        };
        assert_eq!(init.cursor, Cursor::new("0"));
        assert!(!init.persistent);
        assert_eq!(init.end_cursor, Some(Cursor::new("2")));
    }

    #[tokio::test]
    async fn invalid_cursor_retries_exactly_once_against_end() {
        let client = Arc::new(MemoryStreamClient::new());
        client.seed_groups(SHARD, vec![log_group("a", 1, Utc::now())]);
        let barrier = Arc::new(FixedResourceBarrier::new(1 << 20));
        assert!(barrier.try_acquire(SHARD, 128));

        // An unparseable cursor triggers the invalid-cursor path once.
        let result = fetch_task(
            client.clone(),
            barrier.clone(),
            SHARD,
            Cursor::new("bogus"),
            10,
            None,
            0,
            128,
        )
        .await;
        let TaskResult::Fetch(Ok(batch)) = result else {
            panic!("expected retried fetch to succeed");
        };
        assert_eq!(client.pull_calls(), 2);
        assert_eq!(client.end_resolutions(), 1);
        // Retried from the end cursor: nothing left to read, and the
        // conversion shrank the reservation down to the empty batch.
        assert_eq!(batch.group_count(), 0);
        assert_eq!(barrier.available(), 1 << 20);
    }

    #[tokio::test]
    async fn non_cursor_errors_are_not_retried() {
        let client = Arc::new(MemoryStreamClient::new());
        client.seed_groups(SHARD, vec![log_group("a", 1, Utc::now())]);
        client.fail_next_pull(ClientError::Transport("broken pipe".into()));
        let barrier = Arc::new(FixedResourceBarrier::new(1 << 20));
        assert!(barrier.try_acquire(SHARD, 128));

        let result = fetch_task(
            client.clone(),
            barrier.clone(),
            SHARD,
            Cursor::new("0"),
            10,
            None,
            0,
            128,
        )
        .await;
        assert!(matches!(result, TaskResult::Fetch(Err(_))));
        assert_eq!(client.pull_calls(), 1);
        // The failure path released the pre-allocation.
        assert_eq!(barrier.available(), 1 << 20);
    }

    #[tokio::test]
    async fn second_invalid_cursor_failure_is_surfaced() {
        let client = Arc::new(MemoryStreamClient::new());
        client.fail_next_pull(ClientError::InvalidCursor {
            shard: SHARD,
            cursor: Cursor::new("x"),
        });
        client.fail_next_pull(ClientError::InvalidCursor {
            shard: SHARD,
            cursor: Cursor::new("y"),
        });
        let barrier = Arc::new(FixedResourceBarrier::new(1 << 20));
        assert!(barrier.try_acquire(SHARD, 128));

        let result = fetch_task(
            client.clone(),
            barrier.clone(),
            SHARD,
            Cursor::new("0"),
            10,
            None,
            0,
            128,
        )
        .await;
        assert!(matches!(result, TaskResult::Fetch(Err(_))));
        assert_eq!(client.pull_calls(), 2);
        assert_eq!(barrier.available(), 1 << 20);
    }

    #[tokio::test]
    async fn coalescing_accumulates_until_threshold() {
        let client = Arc::new(MemoryStreamClient::new());
        let now = Utc::now();
        client.seed_groups(
            SHARD,
            vec![
                log_group("a", 1, now),
                log_group("b", 1, now),
                log_group("c", 1, now),
            ],
        );
        let barrier = Arc::new(FixedResourceBarrier::new(1 << 20));
        assert!(barrier.try_acquire(SHARD, 128));

        // Limit one group per pull; threshold large enough to need them all.
        let result = fetch_task(
            client.clone(),
            barrier.clone(),
            SHARD,
            Cursor::new("0"),
            1,
            None,
            1 << 16,
            128,
        )
        .await;
        let TaskResult::Fetch(Ok(batch)) = result else {
            panic!("expected coalesced fetch to succeed");
        };
        // Cursor stopped advancing at the tail, so coalescing ended there.
        assert_eq!(batch.group_count(), 3);
        assert_eq!(batch.end_cursor, Cursor::new("3"));
        // Pre-allocation was converted to the real batch size.
        assert_eq!(barrier.available(), (1 << 20) - batch.raw_size as i64);
    }

    #[tokio::test]
    async fn coalescing_failure_returns_partial_aggregate() {
        let client = Arc::new(MemoryStreamClient::new());
        let now = Utc::now();
        client.seed_groups(
            SHARD,
            vec![log_group("a", 1, now), log_group("b", 1, now)],
        );
        // First pull succeeds, the coalescing pull fails.
        client.pass_next_pull();
        client.fail_next_pull(ClientError::Transport("timeout".into()));
        let barrier = Arc::new(FixedResourceBarrier::new(1 << 20));
        assert!(barrier.try_acquire(SHARD, 128));

        let result = fetch_task(
            client.clone(),
            barrier.clone(),
            SHARD,
            Cursor::new("0"),
            1,
            None,
            1 << 16,
            128,
        )
        .await;
        let TaskResult::Fetch(Ok(batch)) = result else {
            panic!("expected partial aggregate, not a failure");
        };
        assert_eq!(batch.group_count(), 1);
        assert_eq!(batch.end_cursor, Cursor::new("1"));
        assert_eq!(client.pull_calls(), 2);
        // The partial aggregate still converted the pre-allocation.
        assert_eq!(barrier.available(), (1 << 20) - batch.raw_size as i64);
    }
}
