//! The protocol between a worker and the job queue storage engine.
//!
//! The backend is authoritative for job state and lease ownership. Every
//! report a worker makes (`complete`, `fail`, `retry`, `heartbeat`) is
//! checked against the lease token minted by `pop` and may be rejected with
//! [`BackendError::LostLock`].

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use leaseq_config::{
    DEFAULT_GRACE_PERIOD_SECONDS, DEFAULT_HEARTBEAT_SECONDS, GRACE_PERIOD_CONFIG_KEY,
    HEARTBEAT_CONFIG_KEY,
};

use crate::error::BackendError;
use crate::job::{Job, NewJob};

pub mod memory;
pub mod redis_store;

pub use memory::{JobEvent, MemoryBackend};
pub use redis_store::RedisBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Requeued for another attempt with this many retries remaining.
    Requeued { retries_left: i64 },
    /// The retry budget was already spent; the job is now failed.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    Held { expires_at: DateTime<Utc> },
    /// Still recorded against this token, but expired past the grace period.
    /// The next `pop` on the queue reclaims it.
    Lapsed,
    /// Reclaimed, reported, or re-put: the token is stale.
    Lost,
}

impl LeaseStatus {
    pub fn is_held(&self) -> bool {
        matches!(self, LeaseStatus::Held { .. })
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Atomically reserve the next eligible job from `queue`, reclaiming
    /// lapsed leases first, and lease it to `worker`.
    async fn pop(&self, queue: &str, worker: &str) -> Result<Option<Job>, BackendError>;

    async fn put(&self, queue: &str, job: NewJob) -> Result<String, BackendError>;

    async fn heartbeat(&self, jid: &str, token: &str) -> Result<DateTime<Utc>, BackendError>;

    async fn complete(&self, jid: &str, token: &str) -> Result<(), BackendError>;

    async fn fail(
        &self,
        jid: &str,
        token: &str,
        group: &str,
        message: &str,
    ) -> Result<(), BackendError>;

    /// Spend one retry and requeue after `delay_seconds`; fails the job when
    /// no retries remain.
    async fn retry(
        &self,
        jid: &str,
        token: &str,
        delay_seconds: f64,
        group: &str,
        message: &str,
    ) -> Result<RetryOutcome, BackendError>;

    /// Force-expire the lease of a running job.
    async fn timeout(&self, jid: &str) -> Result<(), BackendError>;

    async fn get_job(&self, jid: &str) -> Result<Option<Job>, BackendError>;

    async fn lease_status(&self, jid: &str, token: &str) -> Result<LeaseStatus, BackendError>;

    /// Jobs in `queue` that are waiting or scheduled.
    async fn queue_length(&self, queue: &str) -> Result<usize, BackendError>;

    async fn config_get(&self, key: &str) -> Result<Option<String>, BackendError>;

    async fn config_set(&self, key: &str, value: &str) -> Result<(), BackendError>;
}

/// Lease timing read from backend configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeaseTiming {
    pub grace_period_seconds: f64,
    pub heartbeat_seconds: f64,
}

impl Default for LeaseTiming {
    fn default() -> Self {
        Self {
            grace_period_seconds: DEFAULT_GRACE_PERIOD_SECONDS,
            heartbeat_seconds: DEFAULT_HEARTBEAT_SECONDS,
        }
    }
}

impl LeaseTiming {
    pub fn from_lookup<'a>(lookup: impl Fn(&str) -> Option<&'a str>) -> Self {
        let defaults = Self::default();
        Self {
            grace_period_seconds: parse_seconds(lookup(GRACE_PERIOD_CONFIG_KEY))
                .unwrap_or(defaults.grace_period_seconds),
            heartbeat_seconds: parse_seconds(lookup(HEARTBEAT_CONFIG_KEY))
                .unwrap_or(defaults.heartbeat_seconds),
        }
    }

    pub fn grace_period(&self) -> Duration {
        seconds_to_duration(self.grace_period_seconds)
    }

    pub fn heartbeat(&self) -> Duration {
        seconds_to_duration(self.heartbeat_seconds)
    }
}

fn parse_seconds(raw: Option<&str>) -> Option<f64> {
    raw.and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite() && *value >= 0.0)
}

/// Longest lease or delay a backend schedules (100 years). Longer values,
/// including infinities, are clamped to it; negative and NaN values are zero.
pub const MAX_SCHEDULE_SECONDS: f64 = 100.0 * 365.0 * 24.0 * 3600.0;

pub(crate) fn seconds_to_millis(seconds: f64) -> i64 {
    (seconds.max(0.0).min(MAX_SCHEDULE_SECONDS) * 1000.0).round() as i64
}

pub(crate) fn seconds_to_duration(seconds: f64) -> Duration {
    Duration::milliseconds(seconds_to_millis(seconds))
}
