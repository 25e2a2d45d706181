use serde::{Deserialize, Serialize};

use crate::defaults::{
    DEFAULT_INTERVAL_SECONDS, DEFAULT_LOG_LEVEL, DEFAULT_MAX_STARTUP_INTERVAL_SECONDS,
    DEFAULT_PRIORITY, DEFAULT_QUEUE_NAME, DEFAULT_REDIS_DSN, DEFAULT_RETRIES,
    DEFAULT_WATCHDOG_INTERVAL_SECONDS,
};

/// Options for one serial worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default, deny_unknown_fields)]
pub struct WorkerSettings {
    /// Seconds to sleep after a reservation attempt found no job.
    pub interval_seconds: f64,
    /// Upper bound of the one-off random delay before the first reservation.
    /// Zero disables the jitter.
    pub max_startup_interval_seconds: f64,
    pub log_level: String,
    /// How often the lease watchdog re-checks the running job's lease.
    pub watchdog_interval_seconds: f64,
    /// Stop as soon as a reservation comes back empty.
    pub burst: bool,
    pub worker_id: Option<String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            interval_seconds: DEFAULT_INTERVAL_SECONDS,
            max_startup_interval_seconds: DEFAULT_MAX_STARTUP_INTERVAL_SECONDS,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            watchdog_interval_seconds: DEFAULT_WATCHDOG_INTERVAL_SECONDS,
            burst: false,
            worker_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct LeaseqSettings {
    pub redis_dsn: String,
    pub queues: Vec<String>,
    pub default_priority: i64,
    pub default_retries: i64,
    pub worker: WorkerSettings,
}

impl Default for LeaseqSettings {
    fn default() -> Self {
        Self {
            redis_dsn: DEFAULT_REDIS_DSN.to_string(),
            queues: vec![DEFAULT_QUEUE_NAME.to_string()],
            default_priority: DEFAULT_PRIORITY,
            default_retries: DEFAULT_RETRIES,
            worker: WorkerSettings::default(),
        }
    }
}
