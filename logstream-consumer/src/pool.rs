use std::future::Future;
use std::sync::Arc;

use anyhow::anyhow;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::tasks::{TaskKind, TaskResult};

/// Bounded worker pool the shard state machines dispatch their tasks onto.
///
/// Submission never blocks the coordinator thread: the concurrency permit is
/// acquired inside the spawned task, so excess submissions queue in the
/// runtime rather than at the call site. One pool is typically owned by one
/// coordinator, but a pool can be shared across coordinators by handing the
/// same `Arc<WorkerPool>` to each of them.
pub struct WorkerPool {
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Run `work` on the pool, returning a handle the submitter polls.
    pub fn submit<F>(&self, kind: TaskKind, work: F) -> TaskHandle
    where
        F: Future<Output = TaskResult> + Send + 'static,
    {
        let permits = self.permits.clone();
        let handle = tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return TaskResult::failed(kind, anyhow!("worker pool closed")),
            };
            work.await
        });
        TaskHandle { kind, handle }
    }

    /// Stop admitting new work. Only called on pools the coordinator owns.
    pub fn close(&self) {
        self.permits.close();
    }
}

/// Handle to one in-flight task. The state machine checks completion with a
/// non-blocking poll on every tick; it never awaits an unfinished task.
pub struct TaskHandle {
    kind: TaskKind,
    handle: JoinHandle<TaskResult>,
}

impl TaskHandle {
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Take the result out of `slot` if its task has finished, leaving the
    /// slot empty; `None` while still running (or when the slot is empty).
    ///
    /// A panicked or aborted task is converted into a failure `TaskResult`,
    /// so task errors never escape the pool boundary unhandled.
    pub fn poll_slot(slot: &mut Option<TaskHandle>) -> Option<TaskResult> {
        if !slot.as_ref().is_some_and(|h| h.is_finished()) {
            return None;
        }
        let mut taken = slot.take()?;
        match (&mut taken.handle).now_or_never() {
            Some(Ok(result)) => Some(result),
            Some(Err(join_err)) => Some(TaskResult::failed(taken.kind, anyhow!(join_err))),
            // Finished but not yet observable; put it back for the next tick.
            None => {
                *slot = Some(taken);
                None
            }
        }
    }

    /// Await the task to completion. Used by the fetch-cancellation reaper,
    /// never by the coordinator tick path.
    pub async fn join(self) -> TaskResult {
        match self.handle.await {
            Ok(result) => result,
            Err(join_err) => TaskResult::failed(self.kind, anyhow!(join_err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn poll_slot_is_non_blocking_until_completion() {
        let pool = WorkerPool::new(2);
        let mut slot = Some(pool.submit(TaskKind::Fetch, async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            TaskResult::Shutdown(Ok(()))
        }));

        assert!(TaskHandle::poll_slot(&mut slot).is_none());
        assert!(slot.is_some());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let result = TaskHandle::poll_slot(&mut slot).expect("task finished");
        assert!(matches!(result, TaskResult::Shutdown(Ok(()))));
        assert!(slot.is_none());
    }

    #[tokio::test]
    async fn panicked_task_becomes_failure_result() {
        let pool = WorkerPool::new(1);
        let handle = pool.submit(TaskKind::Process, async { panic!("processor blew up") });
        let result = handle.join().await;
        assert_eq!(result.kind(), TaskKind::Process);
        assert!(result.error().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn pool_bounds_concurrency() {
        let pool = WorkerPool::new(1);
        let first = pool.submit(TaskKind::Init, async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            TaskResult::Shutdown(Ok(()))
        });
        let second = pool.submit(TaskKind::Init, async { TaskResult::Shutdown(Ok(())) });

        // The second task cannot start until the first releases its permit.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!second.is_finished());
        first.join().await;
        second.join().await;
    }
}
