use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, instrument};

#[derive(thiserror::Error, Debug)]
pub enum ExecutorError {
    #[error("Semaphore error: {0}")]
    Closed(String),

    #[error("Worker task failed: {0}")]
    Join(String),

    #[error("Worker panicked: {0}")]
    Panicked(String),
}

/// Runs batches of independent jobs on tokio tasks, at most
/// `concurrency_limit` at a time.
pub struct BatchExecutor {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl BatchExecutor {
    pub fn new(concurrency_limit: usize) -> Self {
        let limit = concurrency_limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Runs `work` over every job and waits for all of them. Results come
    /// back in job order; a panicking job yields [`ExecutorError::Panicked`]
    /// in its own slot without affecting the others.
    #[instrument(skip(self, jobs, work), fields(jobs = jobs.len(), limit = self.limit))]
    pub async fn run_batch<T, R, F, Fut>(
        &self,
        jobs: Vec<T>,
        work: Arc<F>,
    ) -> Vec<Result<R, ExecutorError>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let total = jobs.len();
        let mut set = JoinSet::new();
        let mut index_of = HashMap::with_capacity(total);

        for (index, job) in jobs.into_iter().enumerate() {
            let semaphore = Arc::clone(&self.semaphore);
            let work = Arc::clone(&work);
            let handle = set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| ExecutorError::Closed(e.to_string()))?;
                Ok::<_, ExecutorError>((*work)(job).await)
            });
            index_of.insert(handle.id(), index);
        }

        let mut slots: Vec<Option<Result<R, ExecutorError>>> = (0..total).map(|_| None).collect();
        let mut failed = 0usize;
        while let Some(joined) = set.join_next_with_id().await {
            let (id, result) = match joined {
                Ok((id, result)) => (id, result),
                Err(e) => (e.id(), Err(join_failure(e))),
            };
            if result.is_err() {
                failed += 1;
            }
            if let Some(&index) = index_of.get(&id) {
                slots[index] = Some(result);
            }
        }

        debug!(total, failed, "Batch joined");

        slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| Err(ExecutorError::Join("missing result".to_string()))))
            .collect()
    }
}

fn join_failure(e: JoinError) -> ExecutorError {
    if !e.is_panic() {
        return ExecutorError::Join(e.to_string());
    }
    let payload = e.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    ExecutorError::Panicked(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_results_keep_job_order() {
        let executor = BatchExecutor::new(3);
        let results = executor
            .run_batch(vec![30u64, 10, 20], Arc::new(|ms: u64| async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                ms * 2
            }))
            .await;

        let values: Vec<u64> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![60, 20, 40]);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let executor = BatchExecutor::new(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
        let results = executor
            .run_batch((0..8).collect::<Vec<_>>(), Arc::new(move |_: i32| {
                let (a, p) = (Arc::clone(&a), Arc::clone(&p));
                async move {
                    let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                    p.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    a.fetch_sub(1, Ordering::SeqCst);
                }
            }))
            .await;

        assert_eq!(results.len(), 8);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_panicking_jobs_keep_their_slots() {
        let executor = BatchExecutor::new(2);
        let results = executor
            .run_batch(vec![0u32, 1, 2, 3, 4], Arc::new(|n: u32| async move {
                if n % 3 == 0 {
                    panic!("job {}", n);
                }
                n
            }))
            .await;

        assert!(matches!(&results[0], Err(ExecutorError::Panicked(m)) if m == "job 0"));
        assert!(matches!(&results[3], Err(ExecutorError::Panicked(m)) if m == "job 3"));
        assert_eq!(results[1].as_ref().ok(), Some(&1));
        assert_eq!(results[2].as_ref().ok(), Some(&2));
        assert_eq!(results[4].as_ref().ok(), Some(&4));
    }
}
