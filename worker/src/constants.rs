pub const JOB_KEY_PREFIX: &str = "lq:job:";
pub const QUEUE_KEY_PREFIX: &str = "lq:queue:";
pub const CONFIG_KEY: &str = "lq:config";
pub const SEQUENCE_KEY: &str = "lq:seq";

pub const WORK_SUFFIX: &str = ":work";
pub const LOCKS_SUFFIX: &str = ":locks";
pub const SCHEDULED_SUFFIX: &str = ":scheduled";

/// Failure group recorded when a reclaimed job has no retries left.
pub const FAILED_RETRIES_GROUP_PREFIX: &str = "failed-retries-";

pub const DEFAULT_WORKER_ID_PREFIX: &str = "leaseq_worker_";

pub fn job_key(jid: &str) -> String {
    format!("{JOB_KEY_PREFIX}{jid}")
}

pub fn queue_key(queue: &str, suffix: &str) -> String {
    format!("{QUEUE_KEY_PREFIX}{queue}{suffix}")
}
