use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub type Payload = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Scheduled,
    Running,
    Complete,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Scheduled => "scheduled",
            JobState::Running => "running",
            JobState::Complete => "complete",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(JobState::Waiting),
            "scheduled" => Some(JobState::Scheduled),
            "running" => Some(JobState::Running),
            "complete" => Some(JobState::Complete),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub group: String,
    pub message: String,
    pub when: DateTime<Utc>,
    #[serde(default)]
    pub worker: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub jid: String,
    pub class: String,
    pub queue: String,
    #[serde(default)]
    pub payload: Payload,
    pub priority: i64,
    pub retries: i64,
    pub retries_left: i64,
    pub state: JobState,

    #[serde(default)]
    pub worker: Option<String>,
    #[serde(default)]
    pub lease_token: Option<String>,
    #[serde(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,

    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub failure: Option<Failure>,
}

impl Job {
    pub fn new_id() -> String {
        Uuid::new_v4().simple().to_string()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// 1-based attempt number derived from the spent retry budget.
    pub fn attempt(&self) -> i64 {
        self.retries - self.retries_left + 1
    }
}

/// Options accepted by `put`.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub jid: Option<String>,
    pub priority: Option<i64>,
    pub retries: Option<i64>,
    /// Seconds before the job becomes eligible for `pop`.
    pub delay: Option<f64>,
}

impl PutOptions {
    pub fn jid(mut self, jid: impl Into<String>) -> Self {
        self.jid = Some(jid.into());
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn retries(mut self, retries: i64) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn delay(mut self, seconds: f64) -> Self {
        self.delay = Some(seconds);
        self
    }
}

/// Put request as handed to a backend, with defaults already resolved.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub jid: String,
    pub class: String,
    pub payload: Payload,
    pub priority: i64,
    pub retries: i64,
    pub delay_seconds: f64,
}
