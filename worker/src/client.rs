use std::sync::Arc;

use leaseq_config::{DEFAULT_PRIORITY, DEFAULT_RETRIES, LeaseqSettings};
use tracing::Instrument;

use crate::backend::Backend;
use crate::error::BackendError;
use crate::job::{Job, NewJob, Payload, PutOptions};

/// Entry point for producers and admin tooling.
#[derive(Clone)]
pub struct Client {
    backend: Arc<dyn Backend>,
    worker_id: String,
    default_priority: i64,
    default_retries: i64,
}

impl Client {
    pub fn new(backend: Arc<dyn Backend>, worker_id: impl Into<String>) -> Self {
        Self {
            backend,
            worker_id: worker_id.into(),
            default_priority: DEFAULT_PRIORITY,
            default_retries: DEFAULT_RETRIES,
        }
    }

    pub fn from_settings(
        backend: Arc<dyn Backend>,
        worker_id: impl Into<String>,
        settings: &LeaseqSettings,
    ) -> Self {
        Self {
            default_priority: settings.default_priority,
            default_retries: settings.default_retries,
            ..Self::new(backend, worker_id)
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn queue(&self, name: impl Into<String>) -> Queue {
        Queue {
            client: self.clone(),
            name: name.into(),
        }
    }

    pub async fn job(&self, jid: &str) -> Result<Option<Job>, BackendError> {
        self.backend.get_job(jid).await
    }

    pub async fn timeout(&self, jid: &str) -> Result<(), BackendError> {
        tracing::info!(jid = %jid, "forcing lease expiry");
        self.backend.timeout(jid).await
    }

    pub async fn config_get(&self, key: &str) -> Result<Option<String>, BackendError> {
        self.backend.config_get(key).await
    }

    pub async fn config_set(&self, key: &str, value: &str) -> Result<(), BackendError> {
        self.backend.config_set(key, value).await
    }
}

/// A named queue bound to a client.
#[derive(Clone)]
pub struct Queue {
    client: Client,
    name: String,
}

impl Queue {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Leases the next job to this client's worker id.
    pub async fn pop(&self) -> Result<Option<Job>, BackendError> {
        self.client
            .backend
            .pop(&self.name, &self.client.worker_id)
            .await
    }

    /// Enqueues a job and returns its jid. Putting an existing jid replaces
    /// the job and invalidates any lease held on it.
    pub async fn put(
        &self,
        class: &str,
        payload: Payload,
        options: PutOptions,
    ) -> Result<String, BackendError> {
        let jid = options.jid.unwrap_or_else(Job::new_id);
        let span = tracing::debug_span!(
            "leaseq.put",
            jid = %jid,
            class = %class,
            queue = %self.name
        );
        let job = NewJob {
            jid,
            class: class.to_string(),
            payload,
            priority: options.priority.unwrap_or(self.client.default_priority),
            retries: options
                .retries
                .unwrap_or(self.client.default_retries)
                .max(0),
            delay_seconds: options.delay.unwrap_or(0.0).max(0.0),
        };
        async {
            let jid = self.client.backend.put(&self.name, job).await?;
            tracing::debug!("job put");
            Ok::<_, BackendError>(jid)
        }
        .instrument(span)
        .await
    }

    pub async fn length(&self) -> Result<usize, BackendError> {
        self.client.backend.queue_length(&self.name).await
    }
}
