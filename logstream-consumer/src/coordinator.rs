//! Group coordinator: maps held shards to state machines, drives one
//! `consume()` tick per shard per fetch interval, and manages shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::barrier::{FixedResourceBarrier, ResourceBarrier, UnlimitedResourceBarrier};
use crate::client::StreamClient;
use crate::config::ConsumerConfig;
use crate::lease::LeaseManager;
use crate::metrics_consts::SHARDS_TRACKED;
use crate::pool::WorkerPool;
use crate::processor::ProcessorFactory;
use crate::shard::ShardConsumer;
use crate::types::ShardId;

pub struct ConsumerCoordinator {
    config: ConsumerConfig,
    client: Arc<dyn StreamClient>,
    lease: Arc<dyn LeaseManager>,
    factory: Arc<dyn ProcessorFactory>,
    barrier: Arc<dyn ResourceBarrier>,
    pool: Arc<WorkerPool>,
    owns_pool: bool,
    shards: HashMap<ShardId, ShardConsumer>,
    shutdown: CancellationToken,
    /// Set when every tracked shard looked finished under a bounded end
    /// time; cleared the moment any shard shows progress again.
    quiescent_since: Option<Instant>,
    fatal: Option<anyhow::Error>,
}

impl ConsumerCoordinator {
    /// Coordinator with its own worker pool sized from the configuration.
    pub fn new(
        config: ConsumerConfig,
        client: Arc<dyn StreamClient>,
        lease: Arc<dyn LeaseManager>,
        factory: Arc<dyn ProcessorFactory>,
    ) -> Self {
        let pool = Arc::new(WorkerPool::new(config.worker_pool_size));
        Self::build(config, client, lease, factory, pool, true)
    }

    /// Coordinator borrowing a pool shared with other coordinators. The pool
    /// is left running at shutdown.
    pub fn with_shared_pool(
        config: ConsumerConfig,
        client: Arc<dyn StreamClient>,
        lease: Arc<dyn LeaseManager>,
        factory: Arc<dyn ProcessorFactory>,
        pool: Arc<WorkerPool>,
    ) -> Self {
        Self::build(config, client, lease, factory, pool, false)
    }

    fn build(
        config: ConsumerConfig,
        client: Arc<dyn StreamClient>,
        lease: Arc<dyn LeaseManager>,
        factory: Arc<dyn ProcessorFactory>,
        pool: Arc<WorkerPool>,
        owns_pool: bool,
    ) -> Self {
        let barrier: Arc<dyn ResourceBarrier> = if config.max_in_flight_bytes > 0 {
            Arc::new(FixedResourceBarrier::new(config.max_in_flight_bytes))
        } else {
            Arc::new(UnlimitedResourceBarrier)
        };
        Self {
            config,
            client,
            lease,
            factory,
            barrier,
            pool,
            owns_pool,
            shards: HashMap::new(),
            shutdown: CancellationToken::new(),
            quiescent_since: None,
            fatal: None,
        }
    }

    /// Token that stops the coordinator when cancelled. Clone it before
    /// calling `run` to trigger shutdown from elsewhere.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Main loop: one pass over the held shards per fetch interval, until
    /// shutdown is requested or bounded consumption completes.
    pub async fn run(mut self) -> anyhow::Result<()> {
        self.lease.start().await?;
        info!(
            group = %self.config.consumer_group,
            consumer = %self.config.consumer_name,
            "consumer coordinator started"
        );

        while !self.shutdown.is_cancelled() {
            let tick_start = Instant::now();
            let held = self.lease.held_shards().await;

            for shard in &held {
                if self.shutdown.is_cancelled() {
                    break;
                }
                if !self.shards.contains_key(shard) && !self.install_consumer(*shard) {
                    break;
                }
                if let Some(consumer) = self.shards.get_mut(shard) {
                    consumer.consume().await;
                }
            }

            self.sweep_consumers(&held).await;
            metrics::gauge!(SHARDS_TRACKED).set(self.shards.len() as f64);

            if self.bounded_consumption_finished() {
                info!(
                    shards = ?self.shards.keys().collect::<Vec<_>>(),
                    "bounded consumption complete on every held shard, stopping"
                );
                self.shutdown.cancel();
                continue;
            }

            self.sleep_remainder(tick_start).await;
        }

        self.drain().await;

        match self.fatal.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Construct the processor and state machine for a newly held shard.
    /// Processor construction failure is fatal to the whole coordinator.
    fn install_consumer(&mut self, shard: ShardId) -> bool {
        match self.factory.build() {
            Ok(processor) => {
                info!(%shard, "shard newly assigned, starting shard consumer");
                let consumer = ShardConsumer::new(
                    shard,
                    processor,
                    self.client.clone(),
                    self.barrier.clone(),
                    self.pool.clone(),
                    &self.config,
                );
                self.shards.insert(shard, consumer);
                true
            }
            Err(err) => {
                error!(
                    %shard,
                    error = ?err,
                    "failed to construct processor, coordinator cannot run without one; shutting down"
                );
                self.fatal = Some(err);
                self.shutdown.cancel();
                false
            }
        }
    }

    /// Shut down machines for shards no longer held and drop machines that
    /// reached their terminal state, releasing their lease slots.
    async fn sweep_consumers(&mut self, held: &[ShardId]) {
        let mut finished = Vec::new();
        for (shard, consumer) in self.shards.iter_mut() {
            if consumer.is_shutdown_complete() {
                finished.push(*shard);
            } else if !held.contains(shard) {
                debug!(%shard, "shard no longer held, requesting shutdown");
                consumer.shut_down().await;
            }
        }

        for shard in finished {
            if let Some(consumer) = self.shards.remove(&shard) {
                // The tracker refresher is the last thing stopped; it flushes
                // once more before the machine is discarded.
                consumer.tracker().stop().await;
                self.lease.release(shard).await;
                info!(%shard, "shard consumer stopped and lease slot released");
            }
        }
    }

    /// Bounded end-time stop condition: once every tracked shard is terminal
    /// or has nothing more to do, wait out a grace period and stop.
    fn bounded_consumption_finished(&mut self) -> bool {
        if self.config.end_time.is_none() {
            return false;
        }

        for consumer in self.shards.values() {
            if consumer.is_shutdown_complete() {
                continue;
            }
            // Two distinct signals, deliberately kept apart: a shard that
            // has never fetched may still be starting up, while a shard
            // whose last batch was empty has drained to its end cursor.
            // Both count as "nothing more to do" for the grace timer.
            let never_fetched = !consumer.has_fetched();
            let drained = consumer.has_fetched() && consumer.last_fetch_count() == 0;
            if !never_fetched && !drained {
                self.quiescent_since = None;
                return false;
            }
        }

        let since = *self.quiescent_since.get_or_insert_with(Instant::now);
        let mut grace = self.config.lease_timeout() + self.config.heartbeat_interval();
        if self.shards.is_empty() {
            // No machines yet: allow for delayed server-side assignment.
            grace += self.config.heartbeat_interval().min(Duration::from_secs(5));
        }
        since.elapsed() >= grace
    }

    async fn sleep_remainder(&self, tick_start: Instant) {
        let interval = self.config.data_fetch_interval();
        loop {
            let elapsed = tick_start.elapsed();
            if elapsed >= interval || self.shutdown.is_cancelled() {
                return;
            }
            // Bounded naps so shutdown stays responsive even if the token is
            // cancelled from a non-async context.
            let nap = (interval - elapsed).min(Duration::from_secs(1));
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    /// Stop heartbeating, then poll every machine to its terminal state, one
    /// shutdown request per sweep, before tearing down an owned pool.
    async fn drain(&mut self) {
        info!("coordinator shutting down, stopping lease heartbeat");
        self.lease.shutdown().await;

        loop {
            let pending = self
                .shards
                .iter_mut()
                .find(|(_, consumer)| !consumer.is_shutdown_complete());
            match pending {
                Some((shard, consumer)) => {
                    debug!(shard = %shard, "waiting for shard consumer to finish");
                    consumer.shut_down().await;
                }
                None => break,
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        for (shard, consumer) in self.shards.drain() {
            consumer.tracker().stop().await;
            self.lease.release(shard).await;
        }

        if self.owns_pool {
            debug!("closing owned worker pool");
            self.pool.close();
        } else {
            debug!("worker pool is shared, leaving it running");
        }
        info!("coordinator shutdown complete");
    }
}
