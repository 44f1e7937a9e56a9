use std::sync::Mutex;

use tracing::debug;

use crate::metrics_consts::IN_FLIGHT_BYTES;
use crate::types::ShardId;

/// Byte-budget gate bounding buffered-but-unprocessed data across all shards
/// of one coordinator.
///
/// Every successful `try_acquire` (and every positive `acquire` delta) must be
/// paired with exactly one matching `release`, on every failure and
/// cancellation path included. A leak causes permanent throttling; a double
/// release causes unbounded overcommit.
pub trait ResourceBarrier: Send + Sync {
    /// Reserve `bytes` if the budget allows it. Never blocks.
    fn try_acquire(&self, shard: ShardId, bytes: usize) -> bool;

    /// Adjust an existing reservation by `delta` bytes. Used to convert a
    /// fetch pre-allocation into the batch's real size once it is known, so
    /// the delta may be negative.
    fn acquire(&self, shard: ShardId, delta: i64);

    /// Return `bytes` to the budget.
    fn release(&self, shard: ShardId, bytes: usize);
}

/// Fixed byte budget shared by all shards of a coordinator.
pub struct FixedResourceBarrier {
    capacity: i64,
    left: Mutex<i64>,
}

impl FixedResourceBarrier {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity as i64,
            left: Mutex::new(capacity as i64),
        }
    }

    /// Bytes currently available. Exposed for tests and diagnostics.
    pub fn available(&self) -> i64 {
        *self.left.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, left: i64) {
        metrics::gauge!(IN_FLIGHT_BYTES).set((self.capacity - left) as f64);
    }
}

impl ResourceBarrier for FixedResourceBarrier {
    fn try_acquire(&self, shard: ShardId, bytes: usize) -> bool {
        let mut left = self.left.lock().unwrap_or_else(|e| e.into_inner());
        if *left < bytes as i64 {
            debug!(%shard, bytes, left = *left, "resource try_acquire denied");
            return false;
        }
        *left -= bytes as i64;
        let now_left = *left;
        drop(left);
        self.publish(now_left);
        true
    }

    fn acquire(&self, shard: ShardId, delta: i64) {
        let mut left = self.left.lock().unwrap_or_else(|e| e.into_inner());
        *left -= delta;
        let now_left = *left;
        drop(left);
        debug!(%shard, delta, left = now_left, "resource acquire");
        self.publish(now_left);
    }

    fn release(&self, shard: ShardId, bytes: usize) {
        let mut left = self.left.lock().unwrap_or_else(|e| e.into_inner());
        *left += bytes as i64;
        let now_left = *left;
        drop(left);
        debug!(%shard, bytes, left = now_left, "resource release");
        self.publish(now_left);
    }
}

/// No-op barrier used when no in-flight byte budget is configured.
pub struct UnlimitedResourceBarrier;

impl ResourceBarrier for UnlimitedResourceBarrier {
    fn try_acquire(&self, _shard: ShardId, _bytes: usize) -> bool {
        true
    }

    fn acquire(&self, _shard: ShardId, _delta: i64) {}

    fn release(&self, _shard: ShardId, _bytes: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHARD: ShardId = ShardId(0);

    #[test]
    fn try_acquire_denies_past_capacity() {
        let barrier = FixedResourceBarrier::new(100);
        assert!(barrier.try_acquire(SHARD, 60));
        assert!(!barrier.try_acquire(SHARD, 60));
        assert!(barrier.try_acquire(SHARD, 40));
        assert_eq!(barrier.available(), 0);
    }

    #[test]
    fn prealloc_conversion_then_release_returns_to_capacity() {
        let barrier = FixedResourceBarrier::new(1000);
        // Pre-allocate, then convert to the real batch size once known.
        assert!(barrier.try_acquire(SHARD, 200));
        barrier.acquire(SHARD, 350 - 200);
        assert_eq!(barrier.available(), 650);
        barrier.release(SHARD, 350);
        assert_eq!(barrier.available(), 1000);
    }

    #[test]
    fn downward_conversion_frees_budget() {
        let barrier = FixedResourceBarrier::new(1000);
        assert!(barrier.try_acquire(SHARD, 500));
        barrier.acquire(SHARD, 120 - 500);
        assert_eq!(barrier.available(), 880);
        barrier.release(SHARD, 120);
        assert_eq!(barrier.available(), 1000);
    }

    #[test]
    fn unlimited_always_admits() {
        let barrier = UnlimitedResourceBarrier;
        assert!(barrier.try_acquire(SHARD, usize::MAX / 2));
        barrier.release(SHARD, 123);
    }
}
