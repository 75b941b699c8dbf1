//! Bounded worker pool for blocking storage calls
//!
//! Every storage operation runs on tokio's blocking threads behind a
//! semaphore permit, so at most `size` operations touch the store at once.
//! Callers wait for a permit and then for the result, both inside one
//! deadline. A job that misses the deadline is reported as
//! [`TsError::Timeout`] and is never retried here.

use crate::{Result, TsError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::warn;

#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    timeout: Duration,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize, timeout: Duration) -> Result<Self> {
        if size == 0 {
            return Err(TsError::Config("worker pool size must be positive".into()));
        }
        Ok(Self {
            permits: Arc::new(Semaphore::new(size)),
            timeout,
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Permits currently free
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `job` on a worker thread.
    ///
    /// The permit is held by the job itself, so a job that outlives its
    /// deadline keeps its slot until it actually finishes.
    pub async fn run<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let permits = self.permits.clone();
        let work = async move {
            let permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return Err(TsError::WorkerPool("worker pool is closed".into())),
            };
            let joined = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                job()
            })
            .await;
            match joined {
                Ok(result) => result,
                Err(e) => Err(TsError::WorkerPool(format!("worker task failed: {}", e))),
            }
        };

        match tokio::time::timeout(self.timeout, work).await {
            Ok(result) => result,
            Err(_) => {
                let millis = self.timeout.as_millis() as u64;
                warn!("Storage operation timed out after {} ms", millis);
                Err(TsError::Timeout(millis))
            }
        }
    }

    /// Stop handing out permits; queued and future jobs fail
    pub fn close(&self) {
        self.permits.close();
    }
}
