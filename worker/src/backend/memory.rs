//! In-process backend with the same lease semantics as the Redis one.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::Duration;

use crate::backend::{Backend, LeaseStatus, LeaseTiming, RetryOutcome, seconds_to_duration};
use crate::constants::FAILED_RETRIES_GROUP_PREFIX;
use crate::error::BackendError;
use crate::job::{Failure, Job, JobState, NewJob};

/// What happened to a job, in order, as recorded by [`MemoryBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Put,
    Popped { worker: String },
    Heartbeat,
    Completed,
    Failed { group: String },
    Retried { retries_left: i64 },
    TimedOut,
    Reclaimed,
    Rejected { operation: &'static str },
}

struct Entry {
    job: Job,
    seq: u64,
    events: Vec<JobEvent>,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    next_seq: u64,
    config: HashMap<String, String>,
    pop_faults: HashMap<String, VecDeque<BackendError>>,
}

impl State {
    fn timing(&self) -> LeaseTiming {
        LeaseTiming::from_lookup(|key| self.config.get(key).map(String::as_str))
    }

    fn entry_mut(&mut self, jid: &str) -> Result<&mut Entry, BackendError> {
        self.entries
            .get_mut(jid)
            .ok_or_else(|| BackendError::NotFound(jid.to_string()))
    }

    fn reclaim_lapsed(&mut self, queue: &str, now: DateTime<Utc>) {
        let grace = self.timing().grace_period();
        for entry in self.entries.values_mut() {
            let job = &mut entry.job;
            if job.queue != queue || job.state != JobState::Running {
                continue;
            }
            let lapsed = job
                .lease_expires_at
                .is_none_or(|expires| expires + grace <= now);
            if !lapsed {
                continue;
            }
            release_lease(job);
            entry.events.push(JobEvent::Reclaimed);
            if job.retries_left <= 0 {
                job.state = JobState::Failed;
                job.failure = Some(Failure {
                    group: format!("{FAILED_RETRIES_GROUP_PREFIX}{queue}"),
                    message: format!("job exhausted its retries in queue {queue} after its lease lapsed"),
                    when: now,
                    worker: job.worker.clone(),
                });
            } else {
                job.retries_left -= 1;
                job.state = JobState::Waiting;
            }
        }
    }

    fn promote_scheduled(&mut self, queue: &str, now: DateTime<Utc>) {
        for entry in self.entries.values_mut() {
            let job = &mut entry.job;
            if job.queue == queue
                && job.state == JobState::Scheduled
                && job.scheduled_for.is_none_or(|at| at <= now)
            {
                job.state = JobState::Waiting;
                job.scheduled_for = None;
            }
        }
    }

    /// Resolves the lease identified by `token`, or records a rejection.
    fn held_entry(
        &mut self,
        jid: &str,
        token: &str,
        now: DateTime<Utc>,
        operation: &'static str,
    ) -> Result<&mut Entry, BackendError> {
        let grace = self.timing().grace_period();
        let entry = self.entry_mut(jid)?;
        if lease_status(&entry.job, token, now, grace).is_held() {
            return Ok(entry);
        }
        entry.events.push(JobEvent::Rejected { operation });
        Err(BackendError::lost_lock(jid))
    }
}

fn lease_status(job: &Job, token: &str, now: DateTime<Utc>, grace: chrono::Duration) -> LeaseStatus {
    if job.state != JobState::Running || job.lease_token.as_deref() != Some(token) {
        return LeaseStatus::Lost;
    }
    match job.lease_expires_at {
        Some(expires_at) if expires_at + grace > now => LeaseStatus::Held { expires_at },
        _ => LeaseStatus::Lapsed,
    }
}

fn release_lease(job: &mut Job) {
    job.lease_token = None;
    job.lease_expires_at = None;
}

pub struct MemoryBackend {
    state: Mutex<State>,
    changes: watch::Sender<u64>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            state: Mutex::new(State::default()),
            changes,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    /// Makes the next `pop` on `queue` fail with `error`.
    pub fn fail_next_pop(&self, queue: &str, error: BackendError) {
        self.state()
            .pop_faults
            .entry(queue.to_string())
            .or_default()
            .push_back(error);
    }

    pub fn events(&self, jid: &str) -> Vec<JobEvent> {
        self.state()
            .entries
            .get(jid)
            .map(|entry| entry.events.clone())
            .unwrap_or_default()
    }

    pub fn snapshot(&self, jid: &str) -> Option<Job> {
        self.state().entries.get(jid).map(|entry| entry.job.clone())
    }

    /// Waits until `jid` exists and satisfies `predicate`, or `timeout`
    /// elapses.
    pub async fn wait_for_job<F>(&self, jid: &str, timeout: Duration, predicate: F) -> Option<Job>
    where
        F: Fn(&Job) -> bool,
    {
        let mut changes = self.changes.subscribe();
        let wait = async {
            loop {
                if let Some(job) = self.snapshot(jid)
                    && predicate(&job)
                {
                    return job;
                }
                if changes.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.ok()
    }

    pub async fn wait_for_state(&self, jid: &str, state: JobState, timeout: Duration) -> Option<Job> {
        self.wait_for_job(jid, timeout, |job| job.state == state).await
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn pop(&self, queue: &str, worker: &str) -> Result<Option<Job>, BackendError> {
        let now = Utc::now();
        let popped = {
            let mut state = self.state();
            if let Some(error) = state
                .pop_faults
                .get_mut(queue)
                .and_then(VecDeque::pop_front)
            {
                return Err(error);
            }
            state.reclaim_lapsed(queue, now);
            state.promote_scheduled(queue, now);
            let lease = state.timing().heartbeat();

            let next = state
                .entries
                .values()
                .filter(|entry| entry.job.queue == queue && entry.job.state == JobState::Waiting)
                .max_by(|a, b| {
                    a.job
                        .priority
                        .cmp(&b.job.priority)
                        .then_with(|| b.seq.cmp(&a.seq))
                })
                .map(|entry| entry.job.jid.clone());

            next.and_then(|jid| state.entries.get_mut(&jid)).map(|entry| {
                let job = &mut entry.job;
                job.state = JobState::Running;
                job.worker = Some(worker.to_string());
                job.lease_token = Some(Job::new_id());
                job.lease_expires_at = Some(now + lease);
                entry.events.push(JobEvent::Popped {
                    worker: worker.to_string(),
                });
                job.clone()
            })
        };
        self.touch();
        Ok(popped)
    }

    async fn put(&self, queue: &str, job: NewJob) -> Result<String, BackendError> {
        let now = Utc::now();
        let jid = job.jid.clone();
        {
            let mut state = self.state();
            let seq = state.next_seq;
            state.next_seq += 1;
            let (job_state, scheduled_for) = if job.delay_seconds > 0.0 {
                (
                    JobState::Scheduled,
                    Some(now + seconds_to_duration(job.delay_seconds)),
                )
            } else {
                (JobState::Waiting, None)
            };
            let mut events = state
                .entries
                .remove(&jid)
                .map(|previous| previous.events)
                .unwrap_or_default();
            events.push(JobEvent::Put);
            let record = Job {
                jid: jid.clone(),
                class: job.class,
                queue: queue.to_string(),
                payload: job.payload,
                priority: job.priority,
                retries: job.retries,
                retries_left: job.retries,
                state: job_state,
                worker: None,
                lease_token: None,
                lease_expires_at: None,
                enqueued_at: now,
                scheduled_for,
                failure: None,
            };
            state.entries.insert(
                jid.clone(),
                Entry {
                    job: record,
                    seq,
                    events,
                },
            );
        }
        self.touch();
        Ok(jid)
    }

    async fn heartbeat(&self, jid: &str, token: &str) -> Result<DateTime<Utc>, BackendError> {
        let now = Utc::now();
        let expires_at = {
            let mut state = self.state();
            let lease = state.timing().heartbeat();
            let entry = state.held_entry(jid, token, now, "heartbeat")?;
            let expires_at = now + lease;
            entry.job.lease_expires_at = Some(expires_at);
            entry.events.push(JobEvent::Heartbeat);
            expires_at
        };
        self.touch();
        Ok(expires_at)
    }

    async fn complete(&self, jid: &str, token: &str) -> Result<(), BackendError> {
        let now = Utc::now();
        let result = {
            let mut state = self.state();
            state.held_entry(jid, token, now, "complete").map(|entry| {
                release_lease(&mut entry.job);
                entry.job.state = JobState::Complete;
                entry.events.push(JobEvent::Completed);
            })
        };
        self.touch();
        result
    }

    async fn fail(
        &self,
        jid: &str,
        token: &str,
        group: &str,
        message: &str,
    ) -> Result<(), BackendError> {
        let now = Utc::now();
        let result = {
            let mut state = self.state();
            state.held_entry(jid, token, now, "fail").map(|entry| {
                fail_entry(entry, group, message, now);
            })
        };
        self.touch();
        result
    }

    async fn retry(
        &self,
        jid: &str,
        token: &str,
        delay_seconds: f64,
        group: &str,
        message: &str,
    ) -> Result<RetryOutcome, BackendError> {
        let now = Utc::now();
        let result = {
            let mut state = self.state();
            state.held_entry(jid, token, now, "retry").map(|entry| {
                if entry.job.retries_left <= 0 {
                    fail_entry(entry, group, message, now);
                    return RetryOutcome::Failed;
                }
                let job = &mut entry.job;
                release_lease(job);
                job.retries_left -= 1;
                if delay_seconds > 0.0 {
                    job.state = JobState::Scheduled;
                    job.scheduled_for = Some(now + seconds_to_duration(delay_seconds));
                } else {
                    job.state = JobState::Waiting;
                }
                let retries_left = job.retries_left;
                entry.events.push(JobEvent::Retried { retries_left });
                RetryOutcome::Requeued { retries_left }
            })
        };
        self.touch();
        result
    }

    async fn timeout(&self, jid: &str) -> Result<(), BackendError> {
        {
            let mut state = self.state();
            let entry = state.entry_mut(jid)?;
            if entry.job.state != JobState::Running {
                return Err(BackendError::InvalidState {
                    jid: jid.to_string(),
                    state: entry.job.state.to_string(),
                });
            }
            entry.job.lease_expires_at = Some(Utc::now());
            entry.events.push(JobEvent::TimedOut);
        }
        self.touch();
        Ok(())
    }

    async fn get_job(&self, jid: &str) -> Result<Option<Job>, BackendError> {
        Ok(self.snapshot(jid))
    }

    async fn lease_status(&self, jid: &str, token: &str) -> Result<LeaseStatus, BackendError> {
        let state = self.state();
        let grace = state.timing().grace_period();
        let entry = state
            .entries
            .get(jid)
            .ok_or_else(|| BackendError::NotFound(jid.to_string()))?;
        Ok(lease_status(&entry.job, token, Utc::now(), grace))
    }

    async fn queue_length(&self, queue: &str) -> Result<usize, BackendError> {
        Ok(self
            .state()
            .entries
            .values()
            .filter(|entry| {
                entry.job.queue == queue
                    && matches!(entry.job.state, JobState::Waiting | JobState::Scheduled)
            })
            .count())
    }

    async fn config_get(&self, key: &str) -> Result<Option<String>, BackendError> {
        Ok(self.state().config.get(key).cloned())
    }

    async fn config_set(&self, key: &str, value: &str) -> Result<(), BackendError> {
        self.state()
            .config
            .insert(key.to_string(), value.to_string());
        self.touch();
        Ok(())
    }
}

fn fail_entry(entry: &mut Entry, group: &str, message: &str, now: DateTime<Utc>) {
    let job = &mut entry.job;
    release_lease(job);
    job.state = JobState::Failed;
    job.failure = Some(Failure {
        group: group.to_string(),
        message: message.to_string(),
        when: now,
        worker: job.worker.clone(),
    });
    entry.events.push(JobEvent::Failed {
        group: group.to_string(),
    });
}
