//! Per-shard state machine. Each tick is a non-blocking `consume()` call from
//! the coordinator: interpret the previous task's result, advance the state,
//! dispatch at most one new framework task, and independently keep one fetch
//! prefetching ahead of processing.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::barrier::ResourceBarrier;
use crate::checkpoint::CheckpointTracker;
use crate::client::StreamClient;
use crate::config::ConsumerConfig;
use crate::metrics_consts::{
    FETCH_BATCHES_TOTAL, FETCH_FAILURES_TOTAL, FETCH_THROTTLED_TOTAL, TASK_FAILURES_TOTAL,
};
use crate::pool::{TaskHandle, WorkerPool};
use crate::processor::{ProcessOutcome, ShardProcessor};
use crate::tasks::{self, SharedProcessor, TaskKind, TaskResult};
use crate::types::{Cursor, FetchedBatch, ShardId, StartPosition};

/// Lifecycle states. The walk is strictly forward; a global shutdown request
/// forces any state except `ShutdownComplete` into `ShuttingDown` on the next
/// evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    Initializing,
    Processing,
    ShuttingDown,
    ShutdownComplete,
}

/// Task failures are sampled to the log at most this often per shard.
const ERROR_LOG_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Warn once per this many consecutive admission denials.
const THROTTLE_WARN_EVERY: u32 = 200;

/// Escalate the throttle warning once denials have been continuous this long.
const THROTTLE_ESCALATE_AFTER: Duration = Duration::from_secs(15 * 60);

/// Minimum wait between fetches, keyed by the previous batch's group count.
fn min_fetch_wait(last_fetch_count: usize) -> Option<Duration> {
    if last_fetch_count < 100 {
        Some(Duration::from_millis(500))
    } else if last_fetch_count < 500 {
        Some(Duration::from_millis(200))
    } else if last_fetch_count < 1000 {
        Some(Duration::from_millis(50))
    } else {
        None
    }
}

pub struct ShardConsumer {
    shard: ShardId,
    client: Arc<dyn StreamClient>,
    barrier: Arc<dyn ResourceBarrier>,
    pool: Arc<WorkerPool>,
    processor: SharedProcessor,
    tracker: Arc<CheckpointTracker>,

    start_position: StartPosition,
    end_time: Option<DateTime<Utc>>,
    max_fetch_groups: usize,
    min_fetch_bytes: usize,
    prealloc_bytes: usize,

    state: ShardState,
    shutdown_requested: bool,
    /// The single in-flight framework task (init / process / shutdown).
    task: Option<TaskHandle>,
    task_ever_dispatched: bool,
    /// The decoupled prefetch, never more than one batch ahead.
    fetch: Option<TaskHandle>,
    buffered: Option<FetchedBatch>,
    next_fetch_cursor: Cursor,
    end_cursor: Option<Cursor>,

    last_fetch_time: Option<Instant>,
    last_fetch_count: usize,
    last_success_fetch: Option<Instant>,
    throttled_count: u32,
    throttled_since: Option<Instant>,
    last_error_log: Option<Instant>,
}

impl ShardConsumer {
    pub fn new(
        shard: ShardId,
        processor: Box<dyn ShardProcessor>,
        client: Arc<dyn StreamClient>,
        barrier: Arc<dyn ResourceBarrier>,
        pool: Arc<WorkerPool>,
        config: &ConsumerConfig,
    ) -> Self {
        let tracker = Arc::new(CheckpointTracker::new(
            client.clone(),
            shard,
            config.end_time,
            config.checkpoint_flush_interval(),
            config.metric_flush_interval(),
        ));
        tracker.start_refresher();

        Self {
            shard,
            client,
            barrier,
            pool,
            processor: Arc::new(Mutex::new(processor)),
            tracker,
            start_position: config.start_position,
            end_time: config.end_time,
            max_fetch_groups: config.max_fetch_groups,
            min_fetch_bytes: config.min_fetch_bytes,
            prealloc_bytes: config.fetch_prealloc_bytes,
            state: ShardState::Initializing,
            shutdown_requested: false,
            task: None,
            task_ever_dispatched: false,
            fetch: None,
            buffered: None,
            next_fetch_cursor: Cursor::default(),
            end_cursor: None,
            last_fetch_time: None,
            last_fetch_count: 0,
            last_success_fetch: None,
            throttled_count: 0,
            throttled_since: None,
            last_error_log: None,
        }
    }

    /// One cooperative tick. Never blocks: task completion is observed with
    /// non-blocking polls and new work goes to the pool.
    pub async fn consume(&mut self) {
        self.advance().await;
        if self.state == ShardState::Processing && self.buffered.is_none() {
            self.poll_fetch().await;
        }
        self.tracker.set_idle(self.is_idle());
    }

    /// Request shutdown and give the machine one tick to react.
    pub async fn shut_down(&mut self) {
        if !self.shutdown_requested {
            info!(shard = %self.shard, "shard shutdown requested");
        }
        self.shutdown_requested = true;
        if self.state != ShardState::ShutdownComplete {
            self.advance().await;
        }
    }

    pub fn state(&self) -> ShardState {
        self.state
    }

    pub fn is_shutdown_complete(&self) -> bool {
        self.state == ShardState::ShutdownComplete
    }

    /// Whether this shard has ever completed a fetch. Distinct from an empty
    /// last batch: a shard that has not fetched yet may simply still be
    /// starting up.
    pub fn has_fetched(&self) -> bool {
        self.last_success_fetch.is_some()
    }

    /// Group count of the most recent fetched batch. Zero after a successful
    /// fetch means the shard is caught up to the tail (or the end cursor).
    pub fn last_fetch_count(&self) -> usize {
        self.last_fetch_count
    }

    pub fn tracker(&self) -> &Arc<CheckpointTracker> {
        &self.tracker
    }

    fn is_idle(&self) -> bool {
        self.buffered.is_none() && self.task.is_none() && self.fetch.is_none()
    }

    /// Interpret a completed task, advance the state, dispatch the next task.
    /// Returns without doing anything while a task is still running.
    async fn advance(&mut self) {
        if self.task.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let mut task_success = false;
        if let Some(result) = TaskHandle::poll_slot(&mut self.task) {
            match result {
                TaskResult::Init(Ok(init)) => {
                    if self.state != ShardState::Initializing {
                        warn!(
                            shard = %self.shard,
                            state = ?self.state,
                            "dropping init result received in unexpected state"
                        );
                    } else {
                        self.next_fetch_cursor = init.cursor.clone();
                        self.end_cursor = init.end_cursor;
                        self.tracker.set_memory_checkpoint(init.cursor.clone()).await;
                        if init.persistent {
                            self.tracker.set_persisted_checkpoint(init.cursor).await;
                        }
                        task_success = true;
                    }
                }
                TaskResult::Process(Ok(outcome)) => {
                    task_success = true;
                    if let ProcessOutcome::RollbackTo(cursor) = outcome {
                        info!(
                            shard = %self.shard,
                            cursor = %cursor,
                            "processor rolled back, discarding prefetched data"
                        );
                        self.discard_buffered().await;
                        self.cancel_fetch("rollback");
                        self.next_fetch_cursor = cursor;
                    }
                }
                TaskResult::Shutdown(Ok(())) => {
                    task_success = true;
                }
                failed => {
                    metrics::counter!(TASK_FAILURES_TOTAL, "kind" => failed.kind().as_str())
                        .increment(1);
                    self.sample_log_error(failed.error());
                }
            }
        }

        self.update_state(task_success);
        self.dispatch_next().await;
    }

    fn update_state(&mut self, task_success: bool) {
        let previous = self.state;
        match self.state {
            ShardState::ShutdownComplete => {}
            ShardState::ShuttingDown => {
                if !self.task_ever_dispatched || task_success {
                    self.state = ShardState::ShutdownComplete;
                }
            }
            _ if self.shutdown_requested => {
                self.state = ShardState::ShuttingDown;
            }
            ShardState::Initializing => {
                if task_success {
                    self.state = ShardState::Processing;
                }
            }
            ShardState::Processing => {}
        }
        if self.state != previous {
            debug!(shard = %self.shard, from = ?previous, to = ?self.state, "shard state advanced");
        }
    }

    /// Dispatch the task appropriate to the current state. Only called with
    /// the task slot empty.
    async fn dispatch_next(&mut self) {
        match self.state {
            ShardState::Initializing => {
                self.task = Some(self.pool.submit(
                    TaskKind::Init,
                    tasks::initialize_task(
                        self.processor.clone(),
                        self.client.clone(),
                        self.shard,
                        self.start_position,
                        self.end_time,
                    ),
                ));
                self.task_ever_dispatched = true;
            }
            ShardState::Processing => {
                if let Some(batch) = self.buffered.take() {
                    self.tracker.set_cursor(batch.end_cursor.clone()).await;
                    if batch.group_count() > 0 {
                        self.task = Some(self.pool.submit(
                            TaskKind::Process,
                            tasks::process_task(
                                self.processor.clone(),
                                self.barrier.clone(),
                                self.tracker.clone(),
                                batch,
                            ),
                        ));
                        self.task_ever_dispatched = true;
                    } else {
                        // Empty batch: the cursor still advances, there is
                        // nothing to hand to the processor.
                        self.barrier.release(self.shard, batch.raw_size);
                    }
                }
            }
            ShardState::ShuttingDown => {
                self.discard_buffered().await;
                self.cancel_fetch("shutting down");
                self.task = Some(self.pool.submit(
                    TaskKind::Shutdown,
                    tasks::shutdown_task(
                        self.processor.clone(),
                        self.client.clone(),
                        self.tracker.clone(),
                        self.shard,
                    ),
                ));
                self.task_ever_dispatched = true;
            }
            ShardState::ShutdownComplete => {}
        }
    }

    /// Handle fetch completion and decide whether to issue the next fetch.
    /// Only called in `Processing` with no batch buffered.
    async fn poll_fetch(&mut self) {
        if self.fetch.is_some() {
            let Some(result) = TaskHandle::poll_slot(&mut self.fetch) else {
                return;
            };
            match result {
                TaskResult::Fetch(Ok(batch)) => {
                    metrics::counter!(FETCH_BATCHES_TOTAL).increment(1);
                    self.last_fetch_count = batch.group_count();
                    self.last_success_fetch = Some(Instant::now());
                    self.next_fetch_cursor = batch.end_cursor.clone();
                    self.tracker
                        .record_fetched(
                            batch.group_count() as u64,
                            batch.raw_size as u64,
                            batch.line_count() as u64,
                        )
                        .await;
                    self.buffered = Some(batch);
                }
                failed => {
                    metrics::counter!(FETCH_FAILURES_TOTAL).increment(1);
                    self.sample_log_error(failed.error());
                    // No new fetch on the tick that observed an error.
                }
            }
            return;
        }

        if !self
            .barrier
            .try_acquire(self.shard, self.prealloc_bytes)
        {
            self.note_throttled();
            return;
        }
        self.clear_throttle();

        if let (Some(last), Some(min_wait)) =
            (self.last_fetch_time, min_fetch_wait(self.last_fetch_count))
        {
            if last.elapsed() < min_wait {
                self.barrier.release(self.shard, self.prealloc_bytes);
                return;
            }
        }

        self.last_fetch_time = Some(Instant::now());
        self.fetch = Some(self.pool.submit(
            TaskKind::Fetch,
            tasks::fetch_task(
                self.client.clone(),
                self.barrier.clone(),
                self.shard,
                self.next_fetch_cursor.clone(),
                self.max_fetch_groups,
                self.end_cursor.clone(),
                self.min_fetch_bytes,
                self.prealloc_bytes,
            ),
        ));
    }

    async fn discard_buffered(&mut self) {
        if let Some(batch) = self.buffered.take() {
            self.barrier.release(self.shard, batch.raw_size);
            self.tracker.record_dropped(batch.group_count() as u64).await;
        }
    }

    /// Cooperative fetch cancellation: the in-flight pull is never aborted; a
    /// detached reaper awaits it, discards the batch, and returns whatever
    /// reservation the task converted. A failed task already released its
    /// pre-allocation itself.
    fn cancel_fetch(&mut self, reason: &'static str) {
        if let Some(handle) = self.fetch.take() {
            info!(shard = %self.shard, reason, "cancelling in-flight fetch");
            let barrier = self.barrier.clone();
            let shard = self.shard;
            tokio::spawn(async move {
                if let TaskResult::Fetch(Ok(batch)) = handle.join().await {
                    barrier.release(shard, batch.raw_size);
                }
            });
        }
    }

    fn note_throttled(&mut self) {
        metrics::counter!(FETCH_THROTTLED_TOTAL).increment(1);
        let now = Instant::now();
        let since = *self.throttled_since.get_or_insert(now);
        self.throttled_count += 1;
        if self.throttled_count >= THROTTLE_WARN_EVERY {
            self.throttled_count = 0;
            let throttled_for = now.duration_since(since);
            if throttled_for > THROTTLE_ESCALATE_AFTER {
                warn!(
                    shard = %self.shard,
                    throttled_for_secs = throttled_for.as_secs(),
                    "fetch admission continuously throttled; processing is not keeping up with the byte budget"
                );
            } else {
                warn!(
                    shard = %self.shard,
                    consecutive = THROTTLE_WARN_EVERY,
                    "fetch admission throttled"
                );
            }
        }
    }

    fn clear_throttle(&mut self) {
        self.throttled_count = 0;
        self.throttled_since = None;
    }

    fn sample_log_error(&mut self, error: Option<&anyhow::Error>) {
        let Some(error) = error else { return };
        let now = Instant::now();
        let due = self
            .last_error_log
            .is_none_or(|at| now.duration_since(at) > ERROR_LOG_SAMPLE_INTERVAL);
        if due {
            warn!(
                shard = %self.shard,
                error = ?error,
                "shard task failed; state will not advance until it succeeds"
            );
            self.last_error_log = Some(now);
        }
    }

    #[cfg(test)]
    pub(crate) fn throttle_debt(&self) -> u32 {
        self.throttled_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::FixedResourceBarrier;
    use crate::test_utils::{log_group, MemoryStreamClient, TestProcessor, TestProcessorState};
    use std::sync::atomic::Ordering;

    const SHARD: ShardId = ShardId(11);
    const CAPACITY: usize = 1 << 20;

    fn test_config() -> ConsumerConfig {
        ConsumerConfig {
            fetch_prealloc_bytes: 1024,
            ..ConsumerConfig::default()
        }
    }

    fn machine(
        client: Arc<MemoryStreamClient>,
        barrier: Arc<FixedResourceBarrier>,
        config: &ConsumerConfig,
    ) -> (ShardConsumer, Arc<TestProcessorState>) {
        let (processor, state) = TestProcessor::create();
        let pool = Arc::new(WorkerPool::new(4));
        let consumer = ShardConsumer::new(
            SHARD,
            Box::new(processor),
            client,
            barrier,
            pool,
            config,
        );
        (consumer, state)
    }

    /// Tick the machine, giving spawned tasks time to run.
    async fn tick(consumer: &mut ShardConsumer) {
        consumer.consume().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn walks_forward_through_lifecycle() {
        let client = Arc::new(MemoryStreamClient::new());
        client.seed_groups(SHARD, vec![log_group("a", 3, Utc::now())]);
        let barrier = Arc::new(FixedResourceBarrier::new(CAPACITY));
        let config = test_config();
        let (mut consumer, state) = machine(client.clone(), barrier.clone(), &config);

        let mut observed = vec![consumer.state()];
        for _ in 0..12 {
            tick(&mut consumer).await;
            if *observed.last().expect("nonempty") != consumer.state() {
                observed.push(consumer.state());
            }
        }
        assert_eq!(observed, vec![ShardState::Initializing, ShardState::Processing]);
        assert!(state.initialized.load(Ordering::SeqCst));
        assert_eq!(state.batches.lock().unwrap().as_slice(), &[1]);

        consumer.shut_down().await;
        for _ in 0..12 {
            tick(&mut consumer).await;
            if *observed.last().expect("nonempty") != consumer.state() {
                observed.push(consumer.state());
            }
            if consumer.is_shutdown_complete() {
                break;
            }
        }
        assert_eq!(
            observed,
            vec![
                ShardState::Initializing,
                ShardState::Processing,
                ShardState::ShuttingDown,
                ShardState::ShutdownComplete,
            ]
        );
        assert!(state.shut_down.load(Ordering::SeqCst));
        // Every reservation was paired with a release.
        assert_eq!(barrier.available(), CAPACITY as i64);

        consumer.tracker().stop().await;
        assert_eq!(client.stored_checkpoint(SHARD), Some(Cursor::new("1")));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_fetch_advances_without_process_task() {
        let client = Arc::new(MemoryStreamClient::new());
        let barrier = Arc::new(FixedResourceBarrier::new(CAPACITY));
        let config = test_config();
        let (mut consumer, state) = machine(client.clone(), barrier.clone(), &config);

        for _ in 0..8 {
            tick(&mut consumer).await;
        }
        assert_eq!(consumer.state(), ShardState::Processing);
        assert!(consumer.has_fetched());
        assert_eq!(consumer.last_fetch_count(), 0);
        assert!(state.batches.lock().unwrap().is_empty());
        assert_eq!(barrier.available(), CAPACITY as i64);
    }

    #[tokio::test(start_paused = true)]
    async fn rollback_discards_prefetch_and_rewinds_cursor() {
        let client = Arc::new(MemoryStreamClient::new());
        let now = Utc::now();
        // A full-size batch keeps the pacing ladder out of the way, so a
        // prefetch is already in flight when the rollback lands.
        client.seed_groups(
            SHARD,
            (0..1000).map(|i| log_group(&format!("g{i}"), 1, now)).collect(),
        );
        let barrier = Arc::new(FixedResourceBarrier::new(CAPACITY));
        let config = test_config();
        let (mut consumer, state) = machine(client.clone(), barrier.clone(), &config);
        state
            .outcomes
            .lock()
            .unwrap()
            .push_back(ProcessOutcome::RollbackTo(Cursor::new("0")));

        for _ in 0..40 {
            tick(&mut consumer).await;
        }

        // The first batch was processed, demanded a rollback to cursor 0,
        // and the whole batch was re-delivered from there instead of from
        // its natural next cursor.
        let batches = state.batches.lock().unwrap().clone();
        assert!(batches.len() >= 2, "expected redelivery, saw {batches:?}");
        assert!(batches.iter().all(|&count| count == 1000));

        consumer.shut_down().await;
        for _ in 0..12 {
            tick(&mut consumer).await;
            if consumer.is_shutdown_complete() {
                break;
            }
        }
        assert!(consumer.is_shutdown_complete());
        assert_eq!(barrier.available(), CAPACITY as i64);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_counter_resets_after_warning_threshold() {
        let client = Arc::new(MemoryStreamClient::new());
        // Zero budget: every try_acquire is denied.
        let barrier = Arc::new(FixedResourceBarrier::new(0));
        let config = test_config();
        let (mut consumer, _state) = machine(client.clone(), barrier.clone(), &config);

        // Let init complete so the machine reaches Processing; the warm-up
        // ticks already record a few denials.
        for _ in 0..6 {
            tick(&mut consumer).await;
        }
        assert_eq!(consumer.state(), ShardState::Processing);
        let warmed_up = consumer.throttle_debt();
        assert!(warmed_up > 0 && warmed_up < THROTTLE_WARN_EVERY);

        for expected in warmed_up + 1..THROTTLE_WARN_EVERY {
            consumer.consume().await;
            assert_eq!(consumer.throttle_debt(), expected);
        }
        // The 200th consecutive denial emits the warning and resets to zero.
        consumer.consume().await;
        assert_eq!(consumer.throttle_debt(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_releases_buffered_batch_reservation() {
        let client = Arc::new(MemoryStreamClient::new());
        let now = Utc::now();
        // 1100 groups: the first full-size batch goes to a slow process
        // task while the 100-group remainder is prefetched and buffered.
        client.seed_groups(
            SHARD,
            (0..1100).map(|i| log_group(&format!("g{i}"), 1, now)).collect(),
        );
        let barrier = Arc::new(FixedResourceBarrier::new(CAPACITY));
        let config = test_config();
        let (mut consumer, state) = machine(client.clone(), barrier.clone(), &config);
        *state.process_delay.lock().unwrap() = Some(Duration::from_millis(200));

        // Run until the first batch is being processed and the remainder is
        // buffered behind it.
        for _ in 0..8 {
            tick(&mut consumer).await;
        }
        assert_eq!(consumer.state(), ShardState::Processing);

        consumer.shut_down().await;
        for _ in 0..40 {
            tick(&mut consumer).await;
            if consumer.is_shutdown_complete() {
                break;
            }
        }
        assert!(consumer.is_shutdown_complete());
        // The buffered batch's reservation was released during shutdown;
        // everything nets back to the full budget.
        assert_eq!(barrier.available(), CAPACITY as i64);
        assert_eq!(state.batches.lock().unwrap().as_slice(), &[1000]);
    }
}
