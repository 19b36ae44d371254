//! Single-concurrency task queue with per-task timeout.
//!
//! The queue is the only mutual exclusion around the inference engine: at
//! most one task runs at a time, in submission order.

use facegraph_core::CancelFlag;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Error, Debug)]
pub enum QueueError<E> {
    #[error("task timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Task(E),
    #[error("queue closed")]
    Closed,
}

/// Clone-safe handle; clones share the same single slot.
#[derive(Clone)]
pub struct TaskQueue {
    slot: Arc<Semaphore>,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Semaphore::new(1)),
        }
    }

    /// Run `task` once every earlier task has settled.
    ///
    /// The task receives a fresh [`CancelFlag`]. On timeout the flag is set,
    /// the task's future is dropped and the slot is released, so the next
    /// task can start while any blocking work the task handed off notices
    /// the flag and winds down.
    pub async fn run<T, E, F, Fut>(&self, timeout: Option<Duration>, task: F) -> Result<T, QueueError<E>>
    where
        F: FnOnce(CancelFlag) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let _permit = self.slot.acquire().await.map_err(|_| QueueError::Closed)?;

        let cancel = CancelFlag::new();
        let fut = task(cancel.clone());

        match timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result.map_err(QueueError::Task),
                Err(_) => {
                    cancel.cancel();
                    tracing::warn!(timeout = ?limit, "task timed out");
                    Err(QueueError::Timeout(limit))
                }
            },
            None => fut.await.map_err(QueueError::Task),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_result_passthrough() {
        let queue = TaskQueue::new();
        let ok: Result<u32, QueueError<String>> = queue.run(None, |_| async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err: Result<u32, QueueError<String>> =
            queue.run(None, |_| async { Err("boom".to_string()) }).await;
        assert!(matches!(err, Err(QueueError::Task(e)) if e == "boom"));
    }

    #[tokio::test]
    async fn test_tasks_never_overlap() {
        let queue = TaskQueue::new();
        let running = Arc::new(AtomicUsize::new(0));
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..4u32 {
            let queue = queue.clone();
            let running = running.clone();
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .run(None, move |_| async move {
                        assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0);
                        log.lock().unwrap().push(format!("start {i}"));
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        log.lock().unwrap().push(format!("end {i}"));
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, String>(i)
                    })
                    .await
            }));
            // submit in a known order
            tokio::task::yield_now().await;
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 8);
        for pair in log.chunks(2) {
            assert!(pair[0].starts_with("start") && pair[1].starts_with("end"));
            assert_eq!(pair[0][6..], pair[1][4..]);
        }
    }

    #[tokio::test]
    async fn test_timeout_sets_flag_and_frees_slot() {
        let queue = TaskQueue::new();
        let seen = Arc::new(Mutex::new(None::<CancelFlag>));

        let seen_clone = seen.clone();
        let result: Result<(), QueueError<String>> = queue
            .run(Some(Duration::from_millis(20)), move |cancel| async move {
                *seen_clone.lock().unwrap() = Some(cancel);
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(QueueError::Timeout(_))));
        let flag = seen.lock().unwrap().clone().unwrap();
        assert!(flag.is_cancelled());

        // next task runs normally
        let next: Result<u32, QueueError<String>> =
            queue.run(Some(Duration::from_secs(5)), |c| async move {
                assert!(!c.is_cancelled());
                Ok(1)
            })
            .await;
        assert_eq!(next.unwrap(), 1);
    }
}
