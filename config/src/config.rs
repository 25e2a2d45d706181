use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{Map, Value};

use crate::settings::LeaseqSettings;

pub const DEFAULT_CONFIG_FILENAME: &str = "leaseq.toml";
pub const ENV_CONFIG_KEY: &str = "LEASEQ_CONFIG";

const LOG_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

/// Picks the config file: an explicit path, then `LEASEQ_CONFIG`, then
/// `leaseq.toml` in the working directory if it exists.
pub fn config_file_path(explicit: Option<&str>) -> Option<PathBuf> {
    explicit
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os(ENV_CONFIG_KEY)
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
        })
        .or_else(|| {
            let fallback = PathBuf::from(DEFAULT_CONFIG_FILENAME);
            fallback.is_file().then_some(fallback)
        })
}

/// Loads settings from TOML, then applies `LEASEQ_*` environment overrides.
/// Without any config file the defaults plus environment are used.
pub fn load_toml_settings(config_path: Option<&str>) -> Result<LeaseqSettings> {
    dotenvy::dotenv().ok();

    let mut table = match config_file_path(config_path) {
        Some(path) => read_table(&path)?,
        None => Map::new(),
    };
    apply_env_overrides(&mut table)?;

    let settings: LeaseqSettings = serde_json::from_value(Value::Object(table))
        .map_err(|err| anyhow::anyhow!("invalid leaseq config: {err}"))?;
    validate_settings(&settings)?;
    Ok(settings)
}

/// Reads the file as a JSON object, unwrapping an optional `[leaseq]` table
/// and accepting `queue = "name"` as shorthand for a single-entry `queues`.
fn read_table(path: &Path) -> Result<Map<String, Value>> {
    let display = path.display();
    let payload =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config at {display}"))?;
    let parsed: toml::Table =
        toml::from_str(&payload).with_context(|| format!("failed to parse TOML at {display}"))?;
    let mut root = match serde_json::to_value(parsed).context("failed to convert TOML to JSON")? {
        Value::Object(map) => map,
        _ => return Err(anyhow::anyhow!("leaseq config must be a TOML table")),
    };
    if let Some(inner) = root.remove("leaseq") {
        root = match inner {
            Value::Object(map) => map,
            _ => return Err(anyhow::anyhow!("[leaseq] must be a TOML table")),
        };
    }
    if let Some(queue) = root.remove("queue") {
        root.insert("queues".to_string(), Value::Array(vec![queue]));
    }
    Ok(root)
}

#[derive(Clone, Copy)]
enum EnvValue {
    Text,
    List,
    Integer,
    Seconds,
    Flag,
}

/// `(variable, table, key, shape)`; an empty table means the top level.
const ENV_OVERRIDES: [(&str, &str, &str, EnvValue); 10] = [
    ("LEASEQ_REDIS_DSN", "", "redis_dsn", EnvValue::Text),
    ("LEASEQ_QUEUES", "", "queues", EnvValue::List),
    ("LEASEQ_DEFAULT_PRIORITY", "", "default_priority", EnvValue::Integer),
    ("LEASEQ_DEFAULT_RETRIES", "", "default_retries", EnvValue::Integer),
    ("LEASEQ_WORKER_INTERVAL_SECONDS", "worker", "interval_seconds", EnvValue::Seconds),
    (
        "LEASEQ_WORKER_MAX_STARTUP_INTERVAL_SECONDS",
        "worker",
        "max_startup_interval_seconds",
        EnvValue::Seconds,
    ),
    (
        "LEASEQ_WORKER_WATCHDOG_INTERVAL_SECONDS",
        "worker",
        "watchdog_interval_seconds",
        EnvValue::Seconds,
    ),
    ("LEASEQ_LOG_LEVEL", "worker", "log_level", EnvValue::Text),
    ("LEASEQ_WORKER_ID", "worker", "worker_id", EnvValue::Text),
    ("LEASEQ_WORKER_BURST", "worker", "burst", EnvValue::Flag),
];

fn apply_env_overrides(table: &mut Map<String, Value>) -> Result<()> {
    for (variable, section, key, shape) in ENV_OVERRIDES {
        let Ok(raw) = std::env::var(variable) else {
            continue;
        };
        let Some(value) = parse_env_value(variable, raw.trim(), shape)? else {
            continue;
        };
        let target = if section.is_empty() {
            &mut *table
        } else {
            match table
                .entry(section)
                .or_insert_with(|| Value::Object(Map::new()))
            {
                Value::Object(map) => map,
                _ => return Err(anyhow::anyhow!("{section} must be a TOML table")),
            }
        };
        target.insert(key.to_string(), value);
    }
    Ok(())
}

/// Blank variables are treated as unset.
fn parse_env_value(variable: &str, raw: &str, shape: EnvValue) -> Result<Option<Value>> {
    if raw.is_empty() {
        return Ok(None);
    }
    let invalid = || anyhow::anyhow!("Invalid {variable} value: {raw}");
    let value = match shape {
        EnvValue::Text => Value::String(raw.to_string()),
        EnvValue::List => {
            let items: Vec<Value> = raw
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(|item| Value::String(item.to_string()))
                .collect();
            if items.is_empty() {
                return Ok(None);
            }
            Value::Array(items)
        }
        EnvValue::Integer => Value::from(raw.parse::<i64>().map_err(|_| invalid())?),
        EnvValue::Seconds => {
            let seconds = raw.parse::<f64>().map_err(|_| invalid())?;
            Value::Number(serde_json::Number::from_f64(seconds).ok_or_else(invalid)?)
        }
        EnvValue::Flag => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Value::Bool(true),
            "0" | "false" | "no" | "off" => Value::Bool(false),
            _ => return Err(invalid()),
        },
    };
    Ok(Some(value))
}

fn validate_settings(settings: &LeaseqSettings) -> Result<()> {
    if settings.queues.is_empty() {
        return Err(anyhow::anyhow!("at least one queue must be configured"));
    }
    for (index, queue) in settings.queues.iter().enumerate() {
        if queue.trim().is_empty() {
            return Err(anyhow::anyhow!("queue names must not be empty"));
        }
        if settings.queues[..index].contains(queue) {
            return Err(anyhow::anyhow!("queue '{queue}' is listed more than once"));
        }
    }
    if settings.default_retries < 0 {
        return Err(anyhow::anyhow!(
            "default_retries must not be negative, got {}",
            settings.default_retries
        ));
    }

    let worker = &settings.worker;
    if !(worker.interval_seconds > 0.0) {
        return Err(anyhow::anyhow!(
            "worker.interval_seconds must be positive, got {}",
            worker.interval_seconds
        ));
    }
    if !(worker.max_startup_interval_seconds >= 0.0) {
        return Err(anyhow::anyhow!(
            "worker.max_startup_interval_seconds must not be negative, got {}",
            worker.max_startup_interval_seconds
        ));
    }
    if !(worker.watchdog_interval_seconds > 0.0) {
        return Err(anyhow::anyhow!(
            "worker.watchdog_interval_seconds must be positive, got {}",
            worker.watchdog_interval_seconds
        ));
    }
    let level = worker.log_level.to_ascii_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        return Err(anyhow::anyhow!(
            "worker.log_level '{}' is not one of {}",
            worker.log_level,
            LOG_LEVELS.join(", ")
        ));
    }
    Ok(())
}

#[cfg(test)]
#[allow(unsafe_code)] // env var manipulation in tests
mod tests {
    use super::*;
    use std::fs;
    use std::sync::{Mutex, OnceLock};
    use uuid::Uuid;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn write_config(contents: &str) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leaseq.toml");
        fs::write(&path, contents).unwrap();
        let path = path.to_str().unwrap().to_string();
        (dir, path)
    }

    #[test]
    fn load_toml_settings_merges_env_over_file() {
        let _lock = env_lock().lock().unwrap();
        unsafe {
            std::env::set_var("LEASEQ_QUEUES", "high, low");
            std::env::set_var("LEASEQ_WORKER_INTERVAL_SECONDS", "0.5");
        }

        let (_dir, path) = write_config(
            r#"
            [leaseq]
            redis_dsn = "redis://localhost:6379/9"
            queues = ["ignored"]
            default_retries = 3
            [leaseq.worker]
            max_startup_interval_seconds = 0
            log_level = "debug"
            "#,
        );
        let settings = load_toml_settings(Some(&path));
        unsafe {
            std::env::remove_var("LEASEQ_QUEUES");
            std::env::remove_var("LEASEQ_WORKER_INTERVAL_SECONDS");
        }
        let settings = settings.unwrap();

        assert_eq!(settings.redis_dsn, "redis://localhost:6379/9");
        assert_eq!(settings.queues, vec!["high".to_string(), "low".to_string()]);
        assert_eq!(settings.default_retries, 3);
        assert_eq!(settings.worker.interval_seconds, 0.5);
        assert_eq!(settings.worker.max_startup_interval_seconds, 0.0);
        assert_eq!(settings.worker.log_level, "debug");
    }

    #[test]
    fn single_queue_key_is_normalized_to_list() {
        let _lock = env_lock().lock().unwrap();
        let (_dir, path) = write_config(
            r#"
            queue = "main"
            "#,
        );
        let settings = load_toml_settings(Some(&path)).unwrap();
        assert_eq!(settings.queues, vec!["main".to_string()]);
        assert!(!settings.worker.burst);
    }

    #[test]
    fn explicit_config_path_wins_over_env() {
        let _lock = env_lock().lock().unwrap();
        unsafe {
            std::env::set_var(ENV_CONFIG_KEY, "from-env.toml");
        }
        let explicit = config_file_path(Some("custom.toml"));
        let from_env = config_file_path(None);
        unsafe {
            std::env::remove_var(ENV_CONFIG_KEY);
        }
        assert_eq!(explicit, Some(PathBuf::from("custom.toml")));
        assert_eq!(from_env, Some(PathBuf::from("from-env.toml")));
    }

    #[test]
    fn blank_env_values_are_ignored() {
        let _lock = env_lock().lock().unwrap();
        let value = format!("worker-{}", Uuid::new_v4().simple());
        unsafe {
            std::env::set_var("LEASEQ_REDIS_DSN", "  ");
            std::env::set_var("LEASEQ_QUEUES", " , ");
            std::env::set_var("LEASEQ_WORKER_ID", &value);
        }
        let (_dir, path) = write_config(
            r#"
            queues = ["main"]
            [worker]
            burst = true
            "#,
        );
        let settings = load_toml_settings(Some(&path));
        unsafe {
            std::env::remove_var("LEASEQ_REDIS_DSN");
            std::env::remove_var("LEASEQ_QUEUES");
            std::env::remove_var("LEASEQ_WORKER_ID");
        }
        let settings = settings.unwrap();
        assert_eq!(settings.redis_dsn, crate::DEFAULT_REDIS_DSN);
        assert_eq!(settings.queues, vec!["main".to_string()]);
        assert_eq!(settings.worker.worker_id, Some(value));
        assert!(settings.worker.burst);
    }

    #[test]
    fn rejects_non_positive_interval() {
        let _lock = env_lock().lock().unwrap();
        let (_dir, path) = write_config(
            r#"
            [leaseq.worker]
            interval_seconds = 0
            "#,
        );
        let err = load_toml_settings(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("interval_seconds"));
    }

    #[test]
    fn rejects_duplicate_queues() {
        let _lock = env_lock().lock().unwrap();
        let (_dir, path) = write_config(
            r#"
            queues = ["main", "main"]
            "#,
        );
        let err = load_toml_settings(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn rejects_unknown_log_level() {
        let _lock = env_lock().lock().unwrap();
        let (_dir, path) = write_config(
            r#"
            [leaseq.worker]
            log_level = "loud"
            "#,
        );
        let err = load_toml_settings(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("log_level"));
    }

    #[test]
    fn rejects_unknown_worker_field() {
        let _lock = env_lock().lock().unwrap();
        let (_dir, path) = write_config(
            r#"
            [leaseq.worker]
            intervall_seconds = 1
            "#,
        );
        let err = load_toml_settings(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn rejects_invalid_env_bool() {
        let _lock = env_lock().lock().unwrap();
        unsafe {
            std::env::set_var("LEASEQ_WORKER_BURST", "sometimes");
        }
        let (_dir, path) = write_config("");
        let result = load_toml_settings(Some(&path));
        unsafe {
            std::env::remove_var("LEASEQ_WORKER_BURST");
        }
        let err = result.unwrap_err();
        assert!(err.to_string().contains("LEASEQ_WORKER_BURST"));
    }
}
