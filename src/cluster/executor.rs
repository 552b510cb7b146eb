use crate::core::{DbError, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Bounded worker pool for per-replica tasks.
///
/// Every task runs on the tokio runtime but only `size` of them make progress
/// at once; the rest wait for a permit.
#[derive(Debug, Clone)]
pub struct Executor {
    name: &'static str,
    size: usize,
    permits: Arc<Semaphore>,
}

impl Executor {
    pub fn new(name: &'static str, size: usize) -> Self {
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

    /// Number of idle workers
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn spawn<F, T>(&self, task: F) -> JoinHandle<Result<T>>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let permits = self.permits.clone();
        let name = self.name;
        tokio::spawn(async move {
            let _permit = permits.acquire_owned().await.map_err(|_| {
                DbError::ExecutionError(format!("executor '{}' is shut down", name))
            })?;
            task.await
        })
    }

    /// Stop handing out workers; queued and future tasks fail.
    pub fn shutdown(&self) {
        self.permits.close();
    }

    pub fn is_shutdown(&self) -> bool {
        self.permits.is_closed()
    }
}
