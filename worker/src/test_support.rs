use std::sync::OnceLock;

use anyhow::Result;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::backend::RedisBackend;

static REDIS_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn redis_lock() -> &'static Mutex<()> {
    REDIS_LOCK.get_or_init(|| Mutex::new(()))
}

/// Exclusive access to a flushed Redis database and a fresh queue name.
pub struct RedisTestContext {
    _guard: MutexGuard<'static, ()>,
    pub conn: redis::aio::MultiplexedConnection,
    pub backend: RedisBackend,
    pub queue: String,
}

impl RedisTestContext {
    pub async fn new() -> Result<Self> {
        let guard = redis_lock().lock().await;
        let dsn = std::env::var("LEASEQ_TEST_REDIS_DSN")
            .unwrap_or_else(|_| "redis://localhost:6379/15".to_string());
        let client = redis::Client::open(dsn.as_str())?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await?;
        Ok(Self {
            _guard: guard,
            backend: RedisBackend::with_connection(conn.clone()),
            conn,
            queue: format!("test-queue-{}", Uuid::new_v4().simple()),
        })
    }
}
