//! Bounded pool for blocking command production

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Worker pool '{0}' is closed")]
    Closed(&'static str),

    #[error("Worker job failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Runs blocking jobs on the runtime's blocking threads, at most `size` at once
#[derive(Clone)]
pub struct WorkerPool {
    name: &'static str,
    size: usize,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(name: &'static str, size: usize) -> Self {
        let size = size.max(1);
        Self {
            name,
            size,
            permits: Arc::new(Semaphore::new(size)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `job` on a worker, waiting for a free slot first
    pub async fn execute<F, R>(&self, job: F) -> Result<R, PoolError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed(self.name))?;

        let result = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await?;

        Ok(result)
    }

    /// Refuse further jobs; jobs already running finish normally
    pub fn close(&self) {
        self.permits.close();
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}
