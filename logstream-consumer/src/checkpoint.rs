//! Checkpoint reconciliation for one shard: an in-memory cursor, the last
//! persisted cursor, and the periodic flush that reconciles the two, plus the
//! latency estimate and throughput counters derived along the way.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::client::{ClientError, StreamClient};
use crate::metrics_consts::{
    CHECKPOINT_FLUSHES_TOTAL, CHECKPOINT_FLUSH_FAILURES_TOTAL, CHECKPOINT_LATENCY_SECONDS,
};
use crate::types::{Cursor, ShardId};

/// Raised when the external persist call fails. Callers decide whether this
/// is fatal; the engine itself treats it as transient and retries on the next
/// flush cycle.
#[derive(Debug, Error)]
#[error("failed to persist checkpoint for shard {shard} at cursor {cursor}")]
pub struct CheckpointError {
    pub shard: ShardId,
    pub cursor: Cursor,
    #[source]
    pub source: ClientError,
}

/// Per-shard delivery counters, reset on every checkpoint write-through.
/// Telemetry only, never correctness-bearing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressCounters {
    pub accepted: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub failed: u64,
}

/// Byte/line throughput accumulated over one metric window `[start, now)`.
#[derive(Debug, Clone, Copy)]
struct ThroughputWindow {
    start: DateTime<Utc>,
    read_bytes: u64,
    write_bytes: u64,
    lines: u64,
}

impl ThroughputWindow {
    fn new(start: DateTime<Utc>) -> Self {
        Self {
            start,
            read_bytes: 0,
            write_bytes: 0,
            lines: 0,
        }
    }
}

struct TrackerState {
    /// Natural next cursor of the latest batch handed to processing.
    cursor: Cursor,
    /// In-memory checkpoint awaiting persistence.
    pending: Cursor,
    /// Last value the service acknowledged.
    persisted: Cursor,
    /// Server-reported wall-clock time of the persisted cursor.
    cursor_time: Option<DateTime<Utc>>,
    /// Baseline for the "no new data" latency cap.
    no_data_since: Option<DateTime<Utc>>,
    /// Whether a checkpoint-changing flush has happened since activation.
    seen_first_change: bool,
    last_latency: TimeDelta,
    last_flush_check: Instant,
    progress: ProgressCounters,
    window: ThroughputWindow,
}

/// Tracks one shard's checkpoint and persists it through the stream client.
///
/// Created together with the shard's state machine and torn down with it; the
/// background refresher is the last thing stopped and always performs one
/// final flush before the tracker is discarded.
pub struct CheckpointTracker {
    client: Arc<dyn StreamClient>,
    shard: ShardId,
    end_time: Option<DateTime<Utc>>,
    flush_interval: Duration,
    metric_interval: Duration,
    /// Set by the state machine: no buffered batch and no in-flight work.
    idle: AtomicBool,
    state: Mutex<TrackerState>,
    refresher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl CheckpointTracker {
    pub fn new(
        client: Arc<dyn StreamClient>,
        shard: ShardId,
        end_time: Option<DateTime<Utc>>,
        flush_interval: Duration,
        metric_interval: Duration,
    ) -> Self {
        Self {
            client,
            shard,
            end_time,
            flush_interval,
            metric_interval,
            idle: AtomicBool::new(false),
            state: Mutex::new(TrackerState {
                cursor: Cursor::default(),
                pending: Cursor::default(),
                persisted: Cursor::default(),
                cursor_time: None,
                no_data_since: None,
                seen_first_change: false,
                last_latency: TimeDelta::zero(),
                last_flush_check: Instant::now(),
                progress: ProgressCounters::default(),
                window: ThroughputWindow::new(Utc::now()),
            }),
            refresher: std::sync::Mutex::new(None),
        }
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// Spawn the periodic flush loop. Runs until `stop` is called.
    pub fn start_refresher(self: &Arc<Self>) {
        let tracker = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut last_metric_flush = Instant::now();
            loop {
                tokio::time::sleep(tracker.flush_interval).await;
                if let Err(e) = tracker.flush().await {
                    warn!(shard = %tracker.shard, error = ?e, "periodic checkpoint flush failed");
                }
                if last_metric_flush.elapsed() >= tracker.metric_interval {
                    last_metric_flush = Instant::now();
                    tracker.flush_metrics().await;
                }
            }
        });
        *self
            .refresher
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Stop the refresher and perform the final flush. Always the last step
    /// of a shard's teardown.
    pub async fn stop(&self) {
        let handle = self
            .refresher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        if let Err(e) = self.flush().await {
            warn!(shard = %self.shard, error = ?e, "final checkpoint flush failed");
        }
        self.flush_metrics().await;
    }

    /// Record the natural next cursor of the batch being handed to
    /// processing. This is what a parameterless `save_checkpoint` will bind.
    pub async fn set_cursor(&self, cursor: Cursor) {
        self.state.lock().await.cursor = cursor;
    }

    pub async fn current_cursor(&self) -> Cursor {
        self.state.lock().await.cursor.clone()
    }

    /// Seed the in-memory checkpoint from init, without forcing a flush.
    pub(crate) async fn set_memory_checkpoint(&self, cursor: Cursor) {
        self.state.lock().await.pending = cursor;
    }

    /// Seed the persisted checkpoint from init, when the starting cursor came
    /// from the external store and is already durable.
    pub(crate) async fn set_persisted_checkpoint(&self, cursor: Cursor) {
        self.state.lock().await.persisted = cursor;
    }

    /// Bind the current cursor as the in-memory checkpoint. With
    /// `persistent`, write it through immediately; otherwise it rides the
    /// next periodic or opportunistic flush.
    pub async fn save_checkpoint(&self, persistent: bool) -> Result<(), CheckpointError> {
        {
            let mut state = self.state.lock().await;
            state.pending = state.cursor.clone();
        }
        if persistent {
            self.flush().await
        } else {
            Ok(())
        }
    }

    /// Like `save_checkpoint`, but binding a caller-supplied cursor (used to
    /// checkpoint mid-batch positions or rollback targets).
    pub async fn save_checkpoint_at(
        &self,
        cursor: Cursor,
        persistent: bool,
    ) -> Result<(), CheckpointError> {
        self.state.lock().await.pending = cursor;
        if persistent {
            self.flush().await
        } else {
            Ok(())
        }
    }

    pub async fn pending_checkpoint(&self) -> Cursor {
        self.state.lock().await.pending.clone()
    }

    pub async fn persisted_checkpoint(&self) -> Cursor {
        self.state.lock().await.persisted.clone()
    }

    /// Latency estimated at the most recent flush. Observability only.
    pub async fn last_latency(&self) -> TimeDelta {
        self.state.lock().await.last_latency
    }

    pub fn set_idle(&self, idle: bool) {
        self.idle.store(idle, Ordering::Relaxed);
    }

    /// Write the in-memory checkpoint through if it differs from what is
    /// already persisted. Recomputes the latency estimate either way.
    pub async fn flush(&self) -> Result<(), CheckpointError> {
        let flush_start = Utc::now();
        let (pending, persisted) = {
            let state = self.state.lock().await;
            (state.pending.clone(), state.persisted.clone())
        };

        let changed = !pending.is_empty() && pending != persisted;
        let mut acknowledged_time = None;
        if changed {
            match self.client.persist_checkpoint(self.shard, &pending).await {
                Ok(server_time) => {
                    metrics::counter!(CHECKPOINT_FLUSHES_TOTAL).increment(1);
                    acknowledged_time = Some(server_time);
                }
                Err(source) => {
                    metrics::counter!(CHECKPOINT_FLUSH_FAILURES_TOTAL).increment(1);
                    error!(
                        shard = %self.shard,
                        cursor = %pending,
                        error = ?source,
                        "failed to persist checkpoint"
                    );
                    return Err(CheckpointError {
                        shard: self.shard,
                        cursor: pending,
                        source,
                    });
                }
            }
        }

        let mut state = self.state.lock().await;
        if let Some(server_time) = acknowledged_time {
            state.persisted = pending.clone();
            state.cursor_time = Some(server_time);
            let progress = std::mem::take(&mut state.progress);
            debug!(
                shard = %self.shard,
                cursor = %pending,
                accepted = progress.accepted,
                delivered = progress.delivered,
                dropped = progress.dropped,
                failed = progress.failed,
                "checkpoint persisted"
            );
        }

        let latency = self.estimate_latency(&mut state, flush_start, changed);
        state.last_latency = latency;
        metrics::gauge!(CHECKPOINT_LATENCY_SECONDS)
            .set(latency.num_milliseconds() as f64 / 1000.0);
        Ok(())
    }

    /// Opportunistic flush: writes through at most once per flush interval,
    /// swallowing (but logging) persist failures.
    pub async fn flush_check(&self) {
        let due = {
            let mut state = self.state.lock().await;
            if state.last_flush_check.elapsed() >= self.flush_interval {
                state.last_flush_check = Instant::now();
                true
            } else {
                false
            }
        };
        if due {
            if let Err(e) = self.flush().await {
                warn!(shard = %self.shard, error = ?e, "opportunistic checkpoint flush failed");
            }
        }
    }

    /// Latency of the consumer behind the stream, computed at every flush.
    ///
    /// Bounded consumption measures distance to the configured end time.
    /// Open-ended consumption measures distance from the flush wall-clock,
    /// with two corrections: a shard with no outstanding work and no
    /// checkpoint change is provably caught up (latency zero), and latency
    /// can never exceed the time since data was last actually seen.
    fn estimate_latency(
        &self,
        state: &mut TrackerState,
        now: DateTime<Utc>,
        changed: bool,
    ) -> TimeDelta {
        let Some(cursor_time) = state.cursor_time else {
            return TimeDelta::zero();
        };

        if let Some(end_time) = self.end_time {
            let latency = end_time.signed_duration_since(cursor_time);
            if latency < TimeDelta::milliseconds(1) {
                return TimeDelta::zero();
            }
            return latency;
        }

        let mut latency = cursor_time.signed_duration_since(now).abs();

        if changed && !state.seen_first_change {
            // First checkpoint movement since this shard became active: the
            // shard may have just been reassigned with no latency history.
            state.seen_first_change = true;
            state.no_data_since = Some(cursor_time);
        }

        if !changed {
            if self.idle.load(Ordering::Relaxed) {
                state.no_data_since = Some(now);
                latency = TimeDelta::zero();
            } else if let Some(baseline) = state.no_data_since {
                let cap = now.signed_duration_since(baseline).max(TimeDelta::zero());
                latency = latency.min(cap);
            }
        }

        latency
    }

    /// Emit the accumulated throughput window as one log record, if anything
    /// was recorded, then reset it.
    pub async fn flush_metrics(&self) {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        if state.window.lines > 0 {
            info!(
                shard = %self.shard,
                window_start = %state.window.start,
                window_end = %now,
                read_bytes = state.window.read_bytes,
                write_bytes = state.window.write_bytes,
                lines = state.window.lines,
                "shard throughput"
            );
        }
        state.window = ThroughputWindow::new(now);
    }

    pub async fn progress(&self) -> ProgressCounters {
        self.state.lock().await.progress
    }

    pub async fn record_fetched(&self, groups: u64, bytes: u64, lines: u64) {
        let mut state = self.state.lock().await;
        state.progress.accepted += groups;
        state.window.read_bytes += bytes;
        state.window.lines += lines;
    }

    pub async fn record_delivered(&self, groups: u64, bytes: u64) {
        let mut state = self.state.lock().await;
        state.progress.delivered += groups;
        state.window.write_bytes += bytes;
    }

    pub async fn record_failed(&self, groups: u64) {
        self.state.lock().await.progress.failed += groups;
    }

    pub async fn record_dropped(&self, groups: u64) {
        self.state.lock().await.progress.dropped += groups;
    }
}
