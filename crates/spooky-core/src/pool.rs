//! Bounded worker pool shared by the dispatcher and fact gathering

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// How a pooled job ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome<T> {
    /// Job ran to completion
    Completed(T),
    /// Pool was cancelled before the job got a worker
    Cancelled,
    /// Job panicked
    Panicked(String),
}

impl<T> WorkerOutcome<T> {
    /// The completed value, if any
    pub fn completed(self) -> Option<T> {
        match self {
            WorkerOutcome::Completed(value) => Some(value),
            WorkerOutcome::Cancelled | WorkerOutcome::Panicked(_) => None,
        }
    }
}

/// Runs one task per item with an optional concurrency bound
///
/// Every job receives a child cancellation token. Cancelling the pool token
/// stops jobs that are still waiting for a worker; running jobs decide for
/// themselves how to react to their token.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    max_workers: Option<usize>,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Create a pool; `max_workers == 0` means one worker per item
    #[must_use]
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: (max_workers > 0).then_some(max_workers),
            cancel: CancellationToken::new(),
        }
    }

    /// Use an externally owned cancellation token
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token cancelling this pool
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run `job` on every item and wait for all of them.
    ///
    /// Results are returned in input order regardless of completion order.
    pub async fn run<I, T, F, Fut>(&self, items: Vec<I>, job: F) -> Vec<WorkerOutcome<T>>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(I, CancellationToken) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let total = items.len();
        let semaphore = self.max_workers.map(|n| Arc::new(Semaphore::new(n)));

        debug!(total, max_workers = ?self.max_workers, "starting worker pool");

        let mut set = JoinSet::new();
        let mut index_of = HashMap::with_capacity(total);

        for (index, item) in items.into_iter().enumerate() {
            let token = self.cancel.child_token();
            let fut = job(item, token.clone());
            let semaphore = semaphore.clone();

            let handle = set.spawn(async move {
                let _permit = match semaphore {
                    Some(semaphore) => {
                        tokio::select! {
                            permit = semaphore.acquire_owned() => match permit {
                                Ok(permit) => Some(permit),
                                Err(_) => return None,
                            },
                            () = token.cancelled() => return None,
                        }
                    }
                    None => None,
                };

                if token.is_cancelled() {
                    return None;
                }

                Some(fut.await)
            });
            index_of.insert(handle.id(), index);
        }

        let mut results: Vec<Option<WorkerOutcome<T>>> = (0..total).map(|_| None).collect();

        while let Some(joined) = set.join_next_with_id().await {
            match joined {
                Ok((id, value)) => {
                    if let Some(&index) = index_of.get(&id) {
                        results[index] = Some(match value {
                            Some(value) => WorkerOutcome::Completed(value),
                            None => WorkerOutcome::Cancelled,
                        });
                    }
                }
                Err(e) => {
                    error!(error = %e, "worker task panicked");
                    if let Some(&index) = index_of.get(&e.id()) {
                        results[index] = Some(WorkerOutcome::Panicked(e.to_string()));
                    }
                }
            }
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or(WorkerOutcome::Cancelled))
            .collect()
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_results_keep_input_order() {
        let pool = WorkerPool::new(0);
        let results = pool
            .run(vec![30u64, 10, 20], |delay, _| async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                delay
            })
            .await;

        let values: Vec<u64> = results.into_iter().filter_map(WorkerOutcome::completed).collect();
        assert_eq!(values, vec![30, 10, 20]);
    }

    #[tokio::test]
    async fn test_bound_is_respected() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let pool = WorkerPool::new(2);
        let results = pool
            .run((0..6).collect::<Vec<u32>>(), |_, _| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                }
            })
            .await;

        assert_eq!(results.len(), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_cancelled_pool_skips_jobs() {
        let pool = WorkerPool::new(1);
        pool.cancellation_token().cancel();

        let results = pool.run(vec![1, 2, 3], |n, _| async move { n }).await;
        assert!(results.iter().all(|r| *r == WorkerOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_panic_is_isolated() {
        let pool = WorkerPool::new(0);
        let results = pool
            .run(vec![1, 2], |n, _| async move {
                assert_ne!(n, 2, "boom");
                n
            })
            .await;

        assert_eq!(results[0], WorkerOutcome::Completed(1));
        assert!(matches!(results[1], WorkerOutcome::Panicked(_)));
    }

    #[tokio::test]
    async fn test_empty_input() {
        let pool = WorkerPool::default();
        let results: Vec<WorkerOutcome<()>> = pool.run(Vec::<u8>::new(), |_, _| async {}).await;
        assert!(results.is_empty());
    }
}
