use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::ApiError;

/// Bounded pool for blocking work (disk, XML parsing, SQLite, downloads).
///
/// At most `size` closures run on the blocking threads at once; the rest wait
/// asynchronously for a permit, so the request-accepting path never blocks.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    #[must_use]
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self { permits: Arc::new(Semaphore::new(size)), size }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `task` on a blocking thread once a permit is free.
    ///
    /// The permit moves into the blocking closure, so it stays held until the
    /// work finishes even if the awaiting future is dropped.
    ///
    /// # Errors
    /// Returns [`ApiError::Internal`] if the pool is closed or the task panics.
    pub async fn run<F, T>(&self, task: F) -> Result<T, ApiError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| ApiError::Internal("worker pool is closed".to_string()))?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            task()
        })
        .await
        .map_err(|err| ApiError::Internal(format!("blocking task failed: {err}")))
    }

    /// Stop handing out permits; queued and future calls fail.
    pub fn close(&self) {
        self.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn concurrency_never_exceeds_pool_size() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                pool.run(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            }));
        }
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => panic!("worker failed: {err}"),
                Err(err) => panic!("join failed: {err}"),
            }
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn closed_pool_rejects_work() {
        let pool = WorkerPool::new(1);
        pool.close();
        assert!(matches!(pool.run(|| 1).await, Err(ApiError::Internal(_))));
    }

    #[tokio::test]
    async fn panicking_task_surfaces_internal_error() {
        let pool = WorkerPool::new(1);
        let result = pool.run(|| panic!("boom")).await;
        assert!(matches!(result, Err(ApiError::Internal(_))));
        assert_eq!(pool.available(), 1);
    }
}
