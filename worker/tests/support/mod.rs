#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

use leaseq_worker::backend::{Backend, LeaseStatus, MemoryBackend, RetryOutcome};
use leaseq_worker::job::{Job, NewJob, Payload};
use leaseq_worker::middleware::{Middleware, Next};
use leaseq_worker::{
    BackendError, HandlerRegistry, JobContext, JobError, RoundRobin, SerialWorker, WorkerOptions,
};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn options() -> WorkerOptions {
    WorkerOptions::default()
        .worker_id("test-worker")
        .interval(Duration::from_millis(10))
        .max_startup_interval(Duration::ZERO)
        .watchdog_interval(Duration::from_millis(10))
}

pub fn worker_for(
    backend: Arc<dyn Backend>,
    queues: &[&str],
    registry: HandlerRegistry,
    options: WorkerOptions,
) -> SerialWorker {
    let queues = queues.iter().map(|queue| queue.to_string()).collect();
    SerialWorker::new(Arc::new(RoundRobin::new(backend, queues)), registry, options)
}

pub fn new_job(jid: &str, class: &str, priority: i64, retries: i64) -> NewJob {
    NewJob {
        jid: jid.to_string(),
        class: class.to_string(),
        payload: Payload::new(),
        priority,
        retries,
        delay_seconds: 0.0,
    }
}

pub fn with_word(mut job: NewJob, word: &str) -> NewJob {
    job.payload.insert("word".to_string(), json!(word));
    job
}

pub async fn put(backend: &MemoryBackend, queue: &str, job: NewJob) {
    backend.put(queue, job).await.unwrap();
}

/// Shared, ordered record of what hooks and handlers saw.
#[derive(Clone, Default)]
pub struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

pub struct Recorder {
    pub name: &'static str,
    pub log: Log,
}

#[async_trait]
impl Middleware for Recorder {
    fn name(&self) -> &str {
        self.name
    }

    async fn before(&self, ctx: &JobContext) -> Result<(), JobError> {
        self.log.push(format!("{}:before:{}", self.name, ctx.jid()));
        Ok(())
    }

    async fn around(&self, ctx: &JobContext, next: Next<'_>) -> Result<(), JobError> {
        self.log.push(format!("{}:around:{}", self.name, ctx.jid()));
        next.run(ctx).await
    }

    async fn after(&self, ctx: &JobContext, error: Option<&JobError>) -> Result<(), JobError> {
        let status = error.map_or("ok", |err| err.group());
        self.log
            .push(format!("{}:after:{}:{status}", self.name, ctx.jid()));
        Ok(())
    }
}

/// Which report a [`Flaky`] backend rejects.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum FlakyReport {
    Complete,
    Retry,
}

/// Delegates to a [`MemoryBackend`] but rejects the first `n` reports of
/// one kind with a transient error.
pub struct Flaky {
    pub inner: Arc<MemoryBackend>,
    pub report: FlakyReport,
    pub remaining_failures: AtomicUsize,
}

impl Flaky {
    pub fn new(inner: Arc<MemoryBackend>, report: FlakyReport, failures: usize) -> Self {
        Self {
            inner,
            report,
            remaining_failures: AtomicUsize::new(failures),
        }
    }

    fn should_fail(&self, report: FlakyReport) -> bool {
        report == self.report
            && self
                .remaining_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok()
    }
}

fn connection_reset() -> BackendError {
    BackendError::Transient("connection reset".to_string())
}

#[async_trait]
impl Backend for Flaky {
    async fn pop(&self, queue: &str, worker: &str) -> Result<Option<Job>, BackendError> {
        self.inner.pop(queue, worker).await
    }

    async fn put(&self, queue: &str, job: NewJob) -> Result<String, BackendError> {
        self.inner.put(queue, job).await
    }

    async fn heartbeat(&self, jid: &str, token: &str) -> Result<DateTime<Utc>, BackendError> {
        self.inner.heartbeat(jid, token).await
    }

    async fn complete(&self, jid: &str, token: &str) -> Result<(), BackendError> {
        if self.should_fail(FlakyReport::Complete) {
            return Err(connection_reset());
        }
        self.inner.complete(jid, token).await
    }

    async fn fail(
        &self,
        jid: &str,
        token: &str,
        group: &str,
        message: &str,
    ) -> Result<(), BackendError> {
        self.inner.fail(jid, token, group, message).await
    }

    async fn retry(
        &self,
        jid: &str,
        token: &str,
        delay_seconds: f64,
        group: &str,
        message: &str,
    ) -> Result<RetryOutcome, BackendError> {
        if self.should_fail(FlakyReport::Retry) {
            return Err(connection_reset());
        }
        self.inner
            .retry(jid, token, delay_seconds, group, message)
            .await
    }

    async fn timeout(&self, jid: &str) -> Result<(), BackendError> {
        self.inner.timeout(jid).await
    }

    async fn get_job(&self, jid: &str) -> Result<Option<Job>, BackendError> {
        self.inner.get_job(jid).await
    }

    async fn lease_status(&self, jid: &str, token: &str) -> Result<LeaseStatus, BackendError> {
        self.inner.lease_status(jid, token).await
    }

    async fn queue_length(&self, queue: &str) -> Result<usize, BackendError> {
        self.inner.queue_length(queue).await
    }

    async fn config_get(&self, key: &str) -> Result<Option<String>, BackendError> {
        self.inner.config_get(key).await
    }

    async fn config_set(&self, key: &str, value: &str) -> Result<(), BackendError> {
        self.inner.config_set(key, value).await
    }
}
