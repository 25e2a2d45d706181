use std::sync::Arc;

use anyhow::{Context, Result};
use leaseq_config::{LeaseqSettings, load_toml_settings};
use serde_json::Value;

use leaseq_worker::job::{Job, Payload, PutOptions};
use leaseq_worker::{Client, RedisBackend};

const ADMIN_WORKER_ID: &str = "leaseq-admin";

pub(crate) struct PutArgs {
    pub queue: String,
    pub class: String,
    pub payload: Option<String>,
    pub jid: Option<String>,
    pub priority: Option<i64>,
    pub retries: Option<i64>,
    pub delay: Option<f64>,
}

async fn connect_with_settings(config: Option<String>) -> Result<(Client, LeaseqSettings)> {
    let settings = load_toml_settings(config.as_deref())?;
    let backend = RedisBackend::connect(&settings.redis_dsn).await?;
    let client = Client::from_settings(Arc::new(backend), ADMIN_WORKER_ID, &settings);
    Ok((client, settings))
}

async fn connect(config: Option<String>) -> Result<Client> {
    Ok(connect_with_settings(config).await?.0)
}

fn parse_payload(raw: Option<&str>) -> Result<Payload> {
    let Some(raw) = raw else {
        return Ok(Payload::new());
    };
    let value: Value = serde_json::from_str(raw).context("payload is not valid JSON")?;
    match value {
        Value::Object(map) => Ok(map),
        other => Err(anyhow::anyhow!(
            "payload must be a JSON object, got {}",
            type_name(&other)
        )),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

pub(crate) async fn queue_put(config: Option<String>, args: PutArgs) -> Result<()> {
    let payload = parse_payload(args.payload.as_deref())?;
    let client = connect(config).await?;
    let mut options = PutOptions::default();
    if let Some(jid) = args.jid {
        options = options.jid(jid);
    }
    if let Some(priority) = args.priority {
        options = options.priority(priority);
    }
    if let Some(retries) = args.retries {
        options = options.retries(retries);
    }
    if let Some(delay) = args.delay {
        options = options.delay(delay);
    }
    let jid = client
        .queue(&args.queue)
        .put(&args.class, payload, options)
        .await?;
    println!("{jid}");
    Ok(())
}

pub(crate) async fn queue_length(config: Option<String>, queue: Option<String>) -> Result<()> {
    let (client, settings) = connect_with_settings(config).await?;
    if let Some(queue) = queue {
        println!("{}", client.queue(&queue).length().await?);
        return Ok(());
    }
    for queue in &settings.queues {
        let length = client.queue(queue).length().await?;
        println!("{queue:<16} {length}");
    }
    Ok(())
}

fn print_job(job: &Job) {
    println!("{:<16} {}", "jid", job.jid);
    println!("{:<16} {}", "class", job.class);
    println!("{:<16} {}", "queue", job.queue);
    println!("{:<16} {}", "state", job.state);
    println!("{:<16} {}", "priority", job.priority);
    println!("{:<16} {}/{}", "retries left", job.retries_left, job.retries);
    if let Some(worker) = &job.worker {
        println!("{:<16} {}", "worker", worker);
    }
    if let Some(expires) = job.lease_expires_at {
        println!("{:<16} {}", "lease expires", expires.to_rfc3339());
    }
    if let Some(scheduled) = job.scheduled_for {
        println!("{:<16} {}", "scheduled for", scheduled.to_rfc3339());
    }
    println!("{:<16} {}", "enqueued", job.enqueued_at.to_rfc3339());
    if let Some(failure) = &job.failure {
        println!("{:<16} {}: {}", "failure", failure.group, failure.message);
    }
    println!("{:<16} {}", "payload", Value::Object(job.payload.clone()));
}

pub(crate) async fn job_show(config: Option<String>, jid: String, raw: bool) -> Result<()> {
    let client = connect(config).await?;
    let Some(job) = client.job(&jid).await? else {
        return Err(anyhow::anyhow!("job {jid} not found"));
    };
    if raw {
        println!("{}", serde_json::to_string_pretty(&job)?);
    } else {
        print_job(&job);
    }
    Ok(())
}

pub(crate) async fn job_timeout(config: Option<String>, jid: String) -> Result<()> {
    let client = connect(config).await?;
    client.timeout(&jid).await?;
    println!("lease on {jid} expired");
    Ok(())
}

pub(crate) async fn config_get(config: Option<String>, key: String) -> Result<()> {
    let client = connect(config).await?;
    match client.config_get(&key).await? {
        Some(value) => println!("{value}"),
        None => println!("{key} is not set"),
    }
    Ok(())
}

pub(crate) async fn config_set(config: Option<String>, key: String, value: String) -> Result<()> {
    let client = connect(config).await?;
    client.config_set(&key, &value).await?;
    tracing::info!(key = %key, value = %value, "config updated");
    println!("{key} = {value}");
    Ok(())
}
