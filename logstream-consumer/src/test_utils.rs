//! In-memory collaborators for tests: a scriptable stream service, a static
//! lease manager, and a recording processor.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::checkpoint::CheckpointTracker;
use crate::client::{ClientError, PulledBatch, StreamClient};
use crate::lease::LeaseManager;
use crate::processor::{ProcessOutcome, ShardProcessor};
use crate::types::{Cursor, FetchedBatch, LogGroup, LogRecord, ShardId, StartPosition};

/// Build a log group with `lines` single-field records stamped `at`.
pub fn log_group(source: &str, lines: usize, at: DateTime<Utc>) -> LogGroup {
    LogGroup {
        source: source.to_string(),
        records: (0..lines)
            .map(|i| LogRecord {
                timestamp: at,
                fields: vec![("line".to_string(), format!("{source}-{i}"))],
            })
            .collect(),
    }
}

#[derive(Default)]
struct MemoryShard {
    groups: Vec<LogGroup>,
    checkpoint: Option<Cursor>,
}

#[derive(Default)]
struct MemoryState {
    shards: HashMap<ShardId, MemoryShard>,
    /// Outcome script for upcoming pulls: `Some(err)` fails that pull, `None`
    /// lets it through. Pulls beyond the script succeed.
    pull_script: VecDeque<Option<ClientError>>,
    persist_failures: VecDeque<ClientError>,
    cursor_time: Option<DateTime<Utc>>,
}

/// In-memory stream service. Cursors are group indices rendered as strings;
/// a cursor that does not parse is reported as invalid, which is how tests
/// exercise the invalid-cursor retry path.
#[derive(Default)]
pub struct MemoryStreamClient {
    state: Mutex<MemoryState>,
    pull_calls: AtomicUsize,
    persist_count: AtomicUsize,
    end_resolutions: AtomicUsize,
}

impl MemoryStreamClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_groups(&self, shard: ShardId, groups: Vec<LogGroup>) {
        let mut state = self.state.lock().unwrap();
        state.shards.entry(shard).or_default().groups.extend(groups);
    }

    pub fn set_checkpoint(&self, shard: ShardId, cursor: Cursor) {
        let mut state = self.state.lock().unwrap();
        state.shards.entry(shard).or_default().checkpoint = Some(cursor);
    }

    pub fn stored_checkpoint(&self, shard: ShardId) -> Option<Cursor> {
        let state = self.state.lock().unwrap();
        state.shards.get(&shard).and_then(|s| s.checkpoint.clone())
    }

    pub fn fail_next_pull(&self, error: ClientError) {
        self.state.lock().unwrap().pull_script.push_back(Some(error));
    }

    /// Let the next pull through; used to script a failure for a later pull.
    pub fn pass_next_pull(&self) {
        self.state.lock().unwrap().pull_script.push_back(None);
    }

    pub fn fail_next_persist(&self, error: ClientError) {
        self.state.lock().unwrap().persist_failures.push_back(error);
    }

    /// Fix the server-reported cursor time returned by persist calls.
    pub fn set_cursor_time(&self, time: DateTime<Utc>) {
        self.state.lock().unwrap().cursor_time = Some(time);
    }

    pub fn pull_calls(&self) -> usize {
        self.pull_calls.load(Ordering::SeqCst)
    }

    pub fn persist_calls(&self) -> usize {
        self.persist_count.load(Ordering::SeqCst)
    }

    /// How many times a shard's end cursor was resolved.
    pub fn end_resolutions(&self) -> usize {
        self.end_resolutions.load(Ordering::SeqCst)
    }

    fn parse_cursor(shard: ShardId, cursor: &Cursor) -> Result<usize, ClientError> {
        cursor
            .as_str()
            .parse::<usize>()
            .map_err(|_| ClientError::InvalidCursor {
                shard,
                cursor: cursor.clone(),
            })
    }
}

#[async_trait]
impl StreamClient for MemoryStreamClient {
    async fn pull(
        &self,
        shard: ShardId,
        cursor: &Cursor,
        limit: usize,
        end_cursor: Option<&Cursor>,
    ) -> Result<PulledBatch, ClientError> {
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if let Some(Some(error)) = state.pull_script.pop_front() {
            return Err(error);
        }

        let start = Self::parse_cursor(shard, cursor)?;
        let groups = state
            .shards
            .get(&shard)
            .map(|s| s.groups.clone())
            .unwrap_or_default();

        let mut bound = groups.len();
        if let Some(end) = end_cursor {
            bound = bound.min(Self::parse_cursor(shard, end)?);
        }
        let start = start.min(bound);
        let taken: Vec<LogGroup> = groups[start..bound.min(start + limit)].to_vec();
        let raw_size = taken.iter().map(LogGroup::byte_size).sum();
        let next = start + taken.len();

        Ok(PulledBatch {
            groups: taken,
            next_cursor: Cursor::new(next.to_string()),
            raw_size,
        })
    }

    async fn resolve_cursor(
        &self,
        shard: ShardId,
        position: &StartPosition,
    ) -> Result<Cursor, ClientError> {
        let state = self.state.lock().unwrap();
        let groups = state
            .shards
            .get(&shard)
            .map(|s| s.groups.as_slice())
            .unwrap_or_default();
        let index = match position {
            StartPosition::Begin => 0,
            StartPosition::End => {
                self.end_resolutions.fetch_add(1, Ordering::SeqCst);
                groups.len()
            }
            StartPosition::Timestamp(t) => groups
                .iter()
                .position(|g| g.records.iter().any(|r| r.timestamp >= *t))
                .unwrap_or(groups.len()),
        };
        Ok(Cursor::new(index.to_string()))
    }

    async fn persist_checkpoint(
        &self,
        shard: ShardId,
        cursor: &Cursor,
    ) -> Result<DateTime<Utc>, ClientError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.persist_failures.pop_front() {
            return Err(error);
        }
        state.shards.entry(shard).or_default().checkpoint = Some(cursor.clone());
        self.persist_count.fetch_add(1, Ordering::SeqCst);
        Ok(state.cursor_time.unwrap_or_else(Utc::now))
    }

    async fn read_checkpoint(&self, shard: ShardId) -> Result<Option<Cursor>, ClientError> {
        let state = self.state.lock().unwrap();
        Ok(state.shards.get(&shard).and_then(|s| s.checkpoint.clone()))
    }
}

/// Lease manager whose held set is fixed by the test.
#[derive(Default)]
pub struct StaticLeaseManager {
    held: Mutex<Vec<ShardId>>,
    released: Mutex<Vec<ShardId>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl StaticLeaseManager {
    pub fn holding(shards: Vec<ShardId>) -> Self {
        Self {
            held: Mutex::new(shards),
            ..Self::default()
        }
    }

    pub fn set_held(&self, shards: Vec<ShardId>) {
        *self.held.lock().unwrap() = shards;
    }

    pub fn released(&self) -> Vec<ShardId> {
        self.released.lock().unwrap().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LeaseManager for StaticLeaseManager {
    async fn start(&self) -> anyhow::Result<()> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn held_shards(&self) -> Vec<ShardId> {
        self.held.lock().unwrap().clone()
    }

    async fn release(&self, shard: ShardId) {
        self.released.lock().unwrap().push(shard);
    }

    async fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Shared observable state of a [`TestProcessor`].
#[derive(Default)]
pub struct TestProcessorState {
    pub initialized: AtomicBool,
    pub shut_down: AtomicBool,
    /// Group counts of the batches processed, in order.
    pub batches: Mutex<Vec<usize>>,
    /// Scripted outcomes, popped per batch; `Continue` once exhausted.
    pub outcomes: Mutex<VecDeque<ProcessOutcome>>,
    /// Scripted failures, popped before outcomes.
    pub failures: Mutex<VecDeque<String>>,
    /// Artificial processing time per batch, for tests that need a process
    /// task to still be running while other work completes.
    pub process_delay: Mutex<Option<std::time::Duration>>,
}

/// Processor that records what it sees and follows a scripted outcome queue,
/// checkpointing (non-persistently) after every successful batch.
pub struct TestProcessor {
    state: Arc<TestProcessorState>,
}

impl TestProcessor {
    pub fn create() -> (Self, Arc<TestProcessorState>) {
        let state = Arc::new(TestProcessorState::default());
        (
            Self {
                state: state.clone(),
            },
            state,
        )
    }
}

#[async_trait]
impl ShardProcessor for TestProcessor {
    async fn initialize(&mut self, _shard: ShardId) -> anyhow::Result<()> {
        self.state.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn process(
        &mut self,
        batch: FetchedBatch,
        tracker: &CheckpointTracker,
    ) -> anyhow::Result<ProcessOutcome> {
        let delay = *self.state.process_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.state.failures.lock().unwrap().pop_front() {
            bail!("{message}");
        }
        self.state.batches.lock().unwrap().push(batch.group_count());
        tracker.save_checkpoint(false).await?;
        let outcome = self
            .state
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ProcessOutcome::Continue);
        Ok(outcome)
    }

    async fn shutdown(&mut self, _tracker: &CheckpointTracker) -> anyhow::Result<()> {
        self.state.shut_down.store(true, Ordering::SeqCst);
        Ok(())
    }
}
