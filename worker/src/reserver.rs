use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::backend::Backend;
use crate::error::BackendError;
use crate::job::Job;

/// Chooses which queue to poll and returns the next job, if any.
///
/// Transient backend errors on one queue are logged and treated as an empty
/// queue for that call; fatal errors propagate.
#[async_trait]
pub trait JobReserver: Send + Sync {
    async fn reserve(&self, worker_id: &str) -> Result<Option<Job>, BackendError>;

    fn queues(&self) -> &[String];

    fn description(&self) -> String;

    /// The backend jobs are reserved from, which reports go back to.
    fn backend(&self) -> Arc<dyn Backend>;
}

async fn pop_from(
    backend: &dyn Backend,
    queue: &str,
    worker_id: &str,
) -> Result<Option<Job>, BackendError> {
    match backend.pop(queue, worker_id).await {
        Ok(job) => Ok(job),
        Err(err) if err.is_transient() => {
            tracing::warn!(queue = %queue, error = %err, "pop failed; skipping queue this cycle");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

/// Visits every queue once per call, starting just after the queue that
/// last produced a job.
pub struct RoundRobin {
    backend: Arc<dyn Backend>,
    queues: Vec<String>,
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new(backend: Arc<dyn Backend>, queues: Vec<String>) -> Self {
        Self {
            backend,
            queues,
            cursor: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl JobReserver for RoundRobin {
    async fn reserve(&self, worker_id: &str) -> Result<Option<Job>, BackendError> {
        let total = self.queues.len();
        if total == 0 {
            return Ok(None);
        }
        let start = self.cursor.load(Ordering::SeqCst) % total;
        for offset in 0..total {
            let index = (start + offset) % total;
            let queue = &self.queues[index];
            if let Some(job) = pop_from(self.backend.as_ref(), queue, worker_id).await? {
                self.cursor.store((index + 1) % total, Ordering::SeqCst);
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    fn queues(&self) -> &[String] {
        &self.queues
    }

    fn description(&self) -> String {
        format!("{} (round robin)", self.queues.join(", "))
    }

    fn backend(&self) -> Arc<dyn Backend> {
        self.backend.clone()
    }
}

/// Always polls queues in configured order, so earlier queues starve later
/// ones while they have work.
pub struct Ordered {
    backend: Arc<dyn Backend>,
    queues: Vec<String>,
}

impl Ordered {
    pub fn new(backend: Arc<dyn Backend>, queues: Vec<String>) -> Self {
        Self { backend, queues }
    }
}

#[async_trait]
impl JobReserver for Ordered {
    async fn reserve(&self, worker_id: &str) -> Result<Option<Job>, BackendError> {
        for queue in &self.queues {
            if let Some(job) = pop_from(self.backend.as_ref(), queue, worker_id).await? {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    fn queues(&self) -> &[String] {
        &self.queues
    }

    fn description(&self) -> String {
        format!("{} (ordered)", self.queues.join(", "))
    }

    fn backend(&self) -> Arc<dyn Backend> {
        self.backend.clone()
    }
}
