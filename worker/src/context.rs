use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::watch;

use crate::backend::{Backend, RetryOutcome};
use crate::error::BackendError;
use crate::job::{Job, Payload};

/// What the engine recorded for one attempt of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed,
    Retried { retries_left: i64 },
    /// The backend rejected a report because the lease was gone.
    LeaseLost,
    /// The report failed with a transient backend error and was dropped.
    Unreported,
    /// An immediate shutdown cancelled the handler.
    Interrupted,
}

#[derive(Debug, Clone, Copy)]
struct LeaseView {
    expires_at: Option<DateTime<Utc>>,
    lost: bool,
}

struct Inner {
    job: Job,
    token: String,
    worker_id: String,
    backend: Arc<dyn Backend>,
    lease: watch::Sender<LeaseView>,
    outcome: Mutex<Option<JobOutcome>>,
    fatal: Mutex<Option<BackendError>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle a handler uses to inspect its job and report on it.
///
/// Every report goes through the lease token minted by the pop that
/// produced this attempt. Once the attempt has been reported, or its lease
/// is known to be lost, further reports fail with
/// [`BackendError::LostLock`] without reaching the backend. A report that
/// fails transiently also closes the attempt: the engine records it as
/// [`JobOutcome::Unreported`] and the job is reclaimed once its lease lapses.
#[derive(Clone)]
pub struct JobContext {
    inner: Arc<Inner>,
}

impl JobContext {
    pub fn new(
        job: Job,
        backend: Arc<dyn Backend>,
        worker_id: impl Into<String>,
    ) -> Result<Self, BackendError> {
        let token = job
            .lease_token
            .clone()
            .ok_or_else(|| BackendError::lost_lock(job.jid.clone()))?;
        let (lease, _) = watch::channel(LeaseView {
            expires_at: job.lease_expires_at,
            lost: false,
        });
        Ok(Self {
            inner: Arc::new(Inner {
                job,
                token,
                worker_id: worker_id.into(),
                backend,
                lease,
                outcome: Mutex::new(None),
                fatal: Mutex::new(None),
            }),
        })
    }

    pub fn job(&self) -> &Job {
        &self.inner.job
    }

    pub fn jid(&self) -> &str {
        &self.inner.job.jid
    }

    pub fn class(&self) -> &str {
        &self.inner.job.class
    }

    pub fn queue(&self) -> &str {
        &self.inner.job.queue
    }

    pub fn payload(&self) -> &Payload {
        &self.inner.job.payload
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.inner.job.get(key)
    }

    /// Retries remaining as of the pop that started this attempt.
    pub fn retries_left(&self) -> i64 {
        self.inner.job.retries_left
    }

    pub fn attempt(&self) -> i64 {
        self.inner.job.attempt()
    }

    pub fn lease_token(&self) -> &str {
        &self.inner.token
    }

    pub fn worker_id(&self) -> &str {
        &self.inner.worker_id
    }

    pub fn lease_expires_at(&self) -> Option<DateTime<Utc>> {
        self.inner.lease.borrow().expires_at
    }

    pub fn is_lease_lost(&self) -> bool {
        self.inner.lease.borrow().lost
    }

    /// Resolves once the lease is known to be lost.
    pub async fn lease_lost(&self) {
        let mut lease = self.inner.lease.subscribe();
        let observed = lease.wait_for(|view| view.lost).await.is_ok();
        if !observed {
            std::future::pending::<()>().await;
        }
    }

    pub fn is_reported(&self) -> bool {
        lock(&self.inner.outcome).is_some()
    }

    /// Extends the lease and returns the new expiry.
    pub async fn heartbeat(&self) -> Result<DateTime<Utc>, BackendError> {
        self.ensure_reportable()?;
        let result = self
            .inner
            .backend
            .heartbeat(self.jid(), self.lease_token())
            .await;
        match result {
            Ok(expires_at) => {
                self.inner
                    .lease
                    .send_modify(|view| view.expires_at = Some(expires_at));
                Ok(expires_at)
            }
            Err(err) => Err(self.observe(err)),
        }
    }

    pub async fn complete(&self) -> Result<(), BackendError> {
        self.ensure_reportable()?;
        let result = self
            .inner
            .backend
            .complete(self.jid(), self.lease_token())
            .await;
        self.settle(result, |()| JobOutcome::Completed)
    }

    pub async fn fail(&self, group: &str, message: &str) -> Result<(), BackendError> {
        self.ensure_reportable()?;
        let result = self
            .inner
            .backend
            .fail(self.jid(), self.lease_token(), group, message)
            .await;
        self.settle(result, |()| JobOutcome::Failed)
    }

    /// Requeues the job after `delay_seconds`, spending one retry. If none
    /// remain the backend fails the job instead.
    pub async fn retry(
        &self,
        delay_seconds: f64,
        group: &str,
        message: &str,
    ) -> Result<RetryOutcome, BackendError> {
        self.ensure_reportable()?;
        let result = self
            .inner
            .backend
            .retry(self.jid(), self.lease_token(), delay_seconds, group, message)
            .await;
        self.settle(result, |outcome| match outcome {
            RetryOutcome::Requeued { retries_left } => JobOutcome::Retried { retries_left },
            RetryOutcome::Failed => JobOutcome::Failed,
        })
    }

    pub(crate) fn mark_lease_lost(&self) {
        self.inner.lease.send_if_modified(|view| {
            let changed = !view.lost;
            view.lost = true;
            changed
        });
    }

    pub(crate) fn outcome(&self) -> Option<JobOutcome> {
        lock(&self.inner.outcome).clone()
    }

    pub(crate) fn take_fatal(&self) -> Option<BackendError> {
        lock(&self.inner.fatal).take()
    }

    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    fn ensure_reportable(&self) -> Result<(), BackendError> {
        if self.is_reported() || self.is_lease_lost() {
            return Err(BackendError::lost_lock(self.jid()));
        }
        Ok(())
    }

    fn settle<T: Copy>(
        &self,
        result: Result<T, BackendError>,
        outcome: impl FnOnce(T) -> JobOutcome,
    ) -> Result<T, BackendError> {
        match result {
            Ok(value) => {
                *lock(&self.inner.outcome) = Some(outcome(value));
                Ok(value)
            }
            Err(err) => {
                let err = self.observe(err);
                if err.is_transient() && !err.is_lost_lock() {
                    // The backend may or may not have applied the report, so
                    // the attempt is closed and left for the lease to lapse.
                    lock(&self.inner.outcome).get_or_insert(JobOutcome::Unreported);
                }
                Err(err)
            }
        }
    }

    fn observe(&self, err: BackendError) -> BackendError {
        if err.is_lost_lock() {
            self.mark_lease_lost();
        } else if !err.is_transient() {
            lock(&self.inner.fatal).get_or_insert_with(|| err.clone());
        }
        err
    }
}
