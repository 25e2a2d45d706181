use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leaseq_config::{DEFAULT_GRACE_PERIOD_SECONDS, DEFAULT_HEARTBEAT_SECONDS};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script, ScriptInvocation};

use crate::backend::{Backend, LeaseStatus, RetryOutcome, seconds_to_millis};
use crate::constants::{
    CONFIG_KEY, FAILED_RETRIES_GROUP_PREFIX, JOB_KEY_PREFIX, QUEUE_KEY_PREFIX, SCHEDULED_SUFFIX,
    SEQUENCE_KEY, WORK_SUFFIX, job_key, queue_key,
};
use crate::error::BackendError;
use crate::job::{Failure, Job, JobState, NewJob, Payload};

macro_rules! lease_script {
    ($file:literal) => {
        concat!(
            include_str!("lua/lease_common.lua"),
            include_str!(concat!("lua/", $file))
        )
    };
}

pub(crate) const POP_LUA: &str = lease_script!("pop.lua");
pub(crate) const PUT_LUA: &str = lease_script!("put.lua");
pub(crate) const HEARTBEAT_LUA: &str = lease_script!("heartbeat.lua");
pub(crate) const COMPLETE_LUA: &str = lease_script!("complete.lua");
pub(crate) const FAIL_LUA: &str = lease_script!("fail.lua");
pub(crate) const RETRY_LUA: &str = lease_script!("retry.lua");
pub(crate) const TIMEOUT_LUA: &str = lease_script!("timeout.lua");
pub(crate) const LEASE_STATUS_LUA: &str = lease_script!("lease_status.lua");

pub(crate) fn summarize_redis_dsn(dsn: &str) -> String {
    let (scheme, rest) = dsn.split_once("://").unwrap_or(("", dsn));
    let without_auth = rest.rsplit('@').next().unwrap_or(rest);
    let host = without_auth
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(without_auth);

    if scheme.is_empty() {
        host.to_string()
    } else if host.is_empty() {
        format!("{scheme}://")
    } else {
        format!("{scheme}://{host}")
    }
}

#[derive(Clone)]
struct Scripts {
    pop: Script,
    put: Script,
    heartbeat: Script,
    complete: Script,
    fail: Script,
    retry: Script,
    timeout: Script,
    lease_status: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            pop: Script::new(POP_LUA),
            put: Script::new(PUT_LUA),
            heartbeat: Script::new(HEARTBEAT_LUA),
            complete: Script::new(COMPLETE_LUA),
            fail: Script::new(FAIL_LUA),
            retry: Script::new(RETRY_LUA),
            timeout: Script::new(TIMEOUT_LUA),
            lease_status: Script::new(LEASE_STATUS_LUA),
        }
    }
}

/// Backend storing jobs in Redis. Every state transition is a single Lua
/// script so reports race safely against reclamation by other workers.
#[derive(Clone)]
pub struct RedisBackend {
    conn: MultiplexedConnection,
    scripts: Scripts,
}

impl RedisBackend {
    pub async fn connect(dsn: &str) -> Result<Self> {
        let client =
            redis::Client::open(dsn).with_context(|| "failed to create Redis client")?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| {
                let context = format!("failed to connect to Redis ({})", summarize_redis_dsn(dsn));
                anyhow::Error::new(err).context(context)
            })?;
        Ok(Self::with_connection(conn))
    }

    pub fn with_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            scripts: Scripts::load(),
        }
    }

    /// Binds the common preamble arguments every script expects.
    fn invocation<'a>(script: &'a Script) -> ScriptInvocation<'a> {
        let mut invocation = script.prepare_invoke();
        invocation
            .key(CONFIG_KEY)
            .arg(QUEUE_KEY_PREFIX)
            .arg(JOB_KEY_PREFIX)
            .arg(Utc::now().timestamp_millis())
            .arg(DEFAULT_GRACE_PERIOD_SECONDS)
            .arg(DEFAULT_HEARTBEAT_SECONDS);
        invocation
    }

    fn lease_code(jid: &str, code: i64) -> Result<(), BackendError> {
        match code {
            1 => Ok(()),
            -1 => Err(BackendError::NotFound(jid.to_string())),
            _ => Err(BackendError::lost_lock(jid)),
        }
    }

    fn parse_millis(raw: Option<&String>) -> Option<DateTime<Utc>> {
        raw.and_then(|value| value.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis)
    }

    fn non_empty(raw: Option<&String>) -> Option<String> {
        raw.filter(|value| !value.is_empty()).cloned()
    }

    pub(crate) fn parse_job_map(raw: &HashMap<String, String>) -> Result<Job, BackendError> {
        let jid = raw
            .get("jid")
            .cloned()
            .ok_or_else(|| BackendError::Transient("job hash is missing its jid".to_string()))?;
        let state = raw
            .get("state")
            .and_then(|value| JobState::parse(value))
            .ok_or_else(|| BackendError::Transient(format!("job {jid} has an invalid state")))?;
        let payload: Payload = match raw.get("payload") {
            Some(text) if !text.is_empty() => serde_json::from_str(text)?,
            _ => Payload::new(),
        };
        let int = |field: &str| {
            raw.get(field)
                .and_then(|value| value.parse::<i64>().ok())
                .unwrap_or(0)
        };
        let failure = Self::non_empty(raw.get("failure_group")).map(|group| Failure {
            group,
            message: raw.get("failure_message").cloned().unwrap_or_default(),
            when: Self::parse_millis(raw.get("failure_when")).unwrap_or_else(Utc::now),
            worker: Self::non_empty(raw.get("failure_worker")),
        });
        let enqueued_at = Self::parse_millis(raw.get("enqueued_at"))
            .ok_or_else(|| BackendError::Transient(format!("job {jid} is missing enqueued_at")))?;

        Ok(Job {
            class: raw.get("class").cloned().unwrap_or_default(),
            queue: raw.get("queue").cloned().unwrap_or_default(),
            payload,
            priority: int("priority"),
            retries: int("retries"),
            retries_left: int("retries_left"),
            state,
            worker: Self::non_empty(raw.get("worker")),
            lease_token: Self::non_empty(raw.get("lease_token")),
            lease_expires_at: Self::parse_millis(raw.get("lease_expires_at")),
            enqueued_at,
            scheduled_for: Self::parse_millis(raw.get("scheduled_for")),
            failure,
            jid,
        })
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn pop(&self, queue: &str, worker: &str) -> Result<Option<Job>, BackendError> {
        let mut conn = self.conn.clone();
        let token = Job::new_id();
        let mut invocation = Self::invocation(&self.scripts.pop);
        invocation
            .arg(queue)
            .arg(worker)
            .arg(&token)
            .arg(FAILED_RETRIES_GROUP_PREFIX);
        let raw: Option<HashMap<String, String>> = invocation.invoke_async(&mut conn).await?;
        raw.map(|map| Self::parse_job_map(&map)).transpose()
    }

    async fn put(&self, queue: &str, job: NewJob) -> Result<String, BackendError> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(&job.payload)?;
        let run_at_ms = if job.delay_seconds > 0.0 {
            Utc::now().timestamp_millis() + seconds_to_millis(job.delay_seconds)
        } else {
            0
        };
        let mut invocation = Self::invocation(&self.scripts.put);
        invocation
            .key(SEQUENCE_KEY)
            .arg(&job.jid)
            .arg(&job.class)
            .arg(queue)
            .arg(payload)
            .arg(job.priority)
            .arg(job.retries)
            .arg(run_at_ms);
        let jid: String = invocation.invoke_async(&mut conn).await?;
        Ok(jid)
    }

    async fn heartbeat(&self, jid: &str, token: &str) -> Result<DateTime<Utc>, BackendError> {
        let mut conn = self.conn.clone();
        let mut invocation = Self::invocation(&self.scripts.heartbeat);
        invocation.arg(jid).arg(token);
        let (code, expires_ms): (i64, i64) = invocation.invoke_async(&mut conn).await?;
        Self::lease_code(jid, code)?;
        DateTime::from_timestamp_millis(expires_ms)
            .ok_or_else(|| BackendError::Transient(format!("invalid lease expiry {expires_ms}")))
    }

    async fn complete(&self, jid: &str, token: &str) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let mut invocation = Self::invocation(&self.scripts.complete);
        invocation.arg(jid).arg(token);
        let code: i64 = invocation.invoke_async(&mut conn).await?;
        Self::lease_code(jid, code)
    }

    async fn fail(
        &self,
        jid: &str,
        token: &str,
        group: &str,
        message: &str,
    ) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let mut invocation = Self::invocation(&self.scripts.fail);
        invocation.arg(jid).arg(token).arg(group).arg(message);
        let code: i64 = invocation.invoke_async(&mut conn).await?;
        Self::lease_code(jid, code)
    }

    async fn retry(
        &self,
        jid: &str,
        token: &str,
        delay_seconds: f64,
        group: &str,
        message: &str,
    ) -> Result<RetryOutcome, BackendError> {
        let mut conn = self.conn.clone();
        let delay_ms = seconds_to_millis(delay_seconds);
        let mut invocation = Self::invocation(&self.scripts.retry);
        invocation
            .arg(jid)
            .arg(token)
            .arg(delay_ms)
            .arg(group)
            .arg(message);
        let (code, retries_left): (i64, i64) = invocation.invoke_async(&mut conn).await?;
        match code {
            2 => Ok(RetryOutcome::Failed),
            code => Self::lease_code(jid, code).map(|()| RetryOutcome::Requeued { retries_left }),
        }
    }

    async fn timeout(&self, jid: &str) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let mut invocation = Self::invocation(&self.scripts.timeout);
        invocation.arg(jid);
        let (code, state): (i64, String) = invocation.invoke_async(&mut conn).await?;
        match code {
            1 => Ok(()),
            -1 => Err(BackendError::NotFound(jid.to_string())),
            _ => Err(BackendError::InvalidState {
                jid: jid.to_string(),
                state,
            }),
        }
    }

    async fn get_job(&self, jid: &str) -> Result<Option<Job>, BackendError> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = conn.hgetall(job_key(jid)).await?;
        if raw.is_empty() {
            return Ok(None);
        }
        Self::parse_job_map(&raw).map(Some)
    }

    async fn lease_status(&self, jid: &str, token: &str) -> Result<LeaseStatus, BackendError> {
        let mut conn = self.conn.clone();
        let mut invocation = Self::invocation(&self.scripts.lease_status);
        invocation.arg(jid).arg(token);
        let (status, expires_ms): (String, i64) = invocation.invoke_async(&mut conn).await?;
        match status.as_str() {
            "missing" => Err(BackendError::NotFound(jid.to_string())),
            "held" => DateTime::from_timestamp_millis(expires_ms)
                .map(|expires_at| LeaseStatus::Held { expires_at })
                .ok_or_else(|| BackendError::Transient(format!("invalid lease expiry {expires_ms}"))),
            "lapsed" => Ok(LeaseStatus::Lapsed),
            _ => Ok(LeaseStatus::Lost),
        }
    }

    async fn queue_length(&self, queue: &str) -> Result<usize, BackendError> {
        let mut conn = self.conn.clone();
        let (waiting, scheduled): (usize, usize) = redis::pipe()
            .zcard(queue_key(queue, WORK_SUFFIX))
            .zcard(queue_key(queue, SCHEDULED_SUFFIX))
            .query_async(&mut conn)
            .await?;
        Ok(waiting + scheduled)
    }

    async fn config_get(&self, key: &str) -> Result<Option<String>, BackendError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.hget(CONFIG_KEY, key).await?;
        Ok(value)
    }

    async fn config_set(&self, key: &str, value: &str) -> Result<(), BackendError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.hset(CONFIG_KEY, key, value).await?;
        Ok(())
    }
}
