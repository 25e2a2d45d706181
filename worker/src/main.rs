use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

use commands::{PutArgs, config_get, config_set, job_show, job_timeout, queue_length, queue_put};

#[derive(Parser)]
#[command(name = "leaseq")]
#[command(version)]
#[command(about = "Admin tool for leaseq job queues", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Queue {
        #[command(subcommand)]
        command: QueueCommand,
    },
    Job {
        #[command(subcommand)]
        command: JobCommand,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum QueueCommand {
    Put {
        queue: String,
        class: String,
        /// JSON object handed to the handler.
        #[arg(long)]
        payload: Option<String>,
        #[arg(long)]
        jid: Option<String>,
        #[arg(long)]
        priority: Option<i64>,
        #[arg(long)]
        retries: Option<i64>,
        /// Seconds before the job becomes eligible.
        #[arg(long)]
        delay: Option<f64>,
        #[arg(long)]
        config: Option<String>,
    },
    /// Print one queue's length, or every configured queue's when omitted.
    Length {
        queue: Option<String>,
        #[arg(long)]
        config: Option<String>,
    },
}

#[derive(Subcommand)]
enum JobCommand {
    Show {
        jid: String,
        #[arg(long)]
        config: Option<String>,
        #[arg(long, default_value_t = false)]
        raw: bool,
    },
    /// Force the job's lease to expire now.
    Timeout {
        jid: String,
        #[arg(long)]
        config: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    Get {
        key: String,
        #[arg(long)]
        config: Option<String>,
    },
    Set {
        key: String,
        value: String,
        #[arg(long)]
        config: Option<String>,
    },
}

async fn dispatch_command(command: Commands) -> Result<()> {
    match command {
        Commands::Queue { command } => match command {
            QueueCommand::Put {
                queue,
                class,
                payload,
                jid,
                priority,
                retries,
                delay,
                config,
            } => {
                queue_put(
                    config,
                    PutArgs {
                        queue,
                        class,
                        payload,
                        jid,
                        priority,
                        retries,
                        delay,
                    },
                )
                .await?;
            }
            QueueCommand::Length { queue, config } => {
                queue_length(config, queue).await?;
            }
        },
        Commands::Job { command } => match command {
            JobCommand::Show { jid, config, raw } => {
                job_show(config, jid, raw).await?;
            }
            JobCommand::Timeout { jid, config } => {
                job_timeout(config, jid).await?;
            }
        },
        Commands::Config { command } => match command {
            ConfigCommand::Get { key, config } => {
                config_get(config, key).await?;
            }
            ConfigCommand::Set { key, value, config } => {
                config_set(config, key, value).await?;
            }
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    leaseq_worker::telemetry::init_tracing("warn");
    let cli = Cli::parse();
    dispatch_command(cli.command).await
}
