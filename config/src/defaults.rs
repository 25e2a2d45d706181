pub const DEFAULT_REDIS_DSN: &str = "redis://localhost:6379/0";
pub const DEFAULT_QUEUE_NAME: &str = "default";

pub const DEFAULT_PRIORITY: i64 = 0;
pub const DEFAULT_RETRIES: i64 = 5;

pub const DEFAULT_INTERVAL_SECONDS: f64 = 5.0;
pub const DEFAULT_MAX_STARTUP_INTERVAL_SECONDS: f64 = 10.0;
pub const DEFAULT_WATCHDOG_INTERVAL_SECONDS: f64 = 1.0;
pub const DEFAULT_LOG_LEVEL: &str = "info";

pub const DEFAULT_GRACE_PERIOD_SECONDS: f64 = 10.0;
pub const DEFAULT_HEARTBEAT_SECONDS: f64 = 60.0;

pub const GRACE_PERIOD_CONFIG_KEY: &str = "grace-period";
pub const HEARTBEAT_CONFIG_KEY: &str = "heartbeat";
