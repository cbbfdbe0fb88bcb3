use clap::{Args, Parser, Subcommand};
use scanq_queue::{Priority, QueueDefinition};
use std::time::Duration;

mod commands;

use commands::{CliError, run_command};

#[derive(Parser, Debug)]
#[command(name = "scanq", version = "0.3.0")]
#[command(about = "Scanq CLI - inspect and drive scan-job queues on Redis streams")]
struct Cli {
    /// Queue descriptor
    #[arg(
        long,
        global = true,
        default_value = "queue://scans:scanners/?maxlen=10000&maxretry=3&maxttl=1h"
    )]
    queue: QueueDefinition,

    /// Redis endpoint (overrides SCANQ_REDIS_URL)
    #[arg(long, global = true)]
    redis_url: Option<String>,

    /// Use a throwaway in-process log instead of Redis
    #[arg(long, global = true)]
    memory: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check that the backend answers
    Ping,
    /// Append records to the stream
    Publish {
        /// Record field as key=value, repeatable
        #[arg(long = "field", short = 'f', value_parser = parse_field, required = true)]
        fields: Vec<(String, String)>,
        /// Priority (high|low)
        #[arg(long, default_value = "low")]
        priority: Priority,
        /// Publish the record this many times
        #[arg(long, default_value_t = 1)]
        count: usize,
        /// Reject once the stream holds this many entries
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print records as JSON lines and acknowledge them
    Consume {
        #[command(flatten)]
        worker: WorkerArgs,
        /// Number of workers named <consumer>-1..N, run until Ctrl-C
        #[arg(long)]
        workers: Option<usize>,
        /// Keep polling after an empty block window, until Ctrl-C
        #[arg(long)]
        follow: bool,
    },
    /// Hand idle pending entries to another consumer and print them
    Reclaim {
        /// Consumer receiving the entries
        #[arg(long)]
        target: String,
        #[arg(long, default_value_t = 100)]
        batch: usize,
        #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
        min_idle: Duration,
        /// Run every interval until Ctrl-C, evicting exhausted entries too
        #[arg(long, value_parser = humantime::parse_duration)]
        every: Option<Duration>,
    },
    /// Delete pending entries that exhausted their retries
    Evict {
        #[arg(long, default_value_t = 100)]
        batch: usize,
        /// Minimum idle time (defaults to the queue's maxttl)
        #[arg(long, value_parser = humantime::parse_duration)]
        min_ttl: Option<Duration>,
    },
    /// Show total, queued and stale counts of the group
    State,
    /// Answer requests by echoing their fields back
    RpcServe {
        /// Stream carrying replies
        #[arg(long)]
        reply_stream: String,
        #[arg(long, default_value = "server-1")]
        consumer: String,
        #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
        block: Duration,
    },
    /// Send one request and print its reply
    RpcCall {
        /// Stream carrying replies
        #[arg(long)]
        reply_stream: String,
        #[arg(long = "field", short = 'f', value_parser = parse_field, required = true)]
        fields: Vec<(String, String)>,
        #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
        timeout: Duration,
    },
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Consumer name (prefix when running several workers)
    #[arg(long, default_value = "scanq-cli")]
    consumer: String,
    /// Group to join (defaults to the descriptor's group)
    #[arg(long)]
    group: Option<String>,
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    block: Duration,
}

fn parse_field(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{}'", raw)),
    }
}

#[tokio::main]
async fn main() {
    // Initialize JSON logging once; stdout is reserved for records.
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();
    let env_filter = match "info".parse() {
        Ok(directive) => env_filter.add_directive(directive),
        Err(_) => env_filter,
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .json()
        .try_init();

    let cli = Cli::parse();

    if let Err(e) = run_command(cli.queue, cli.redis_url, cli.memory, cli.command).await {
        tracing::error!(error = %e, "Command failed");
        std::process::exit(exit_code(&e));
    }
}

fn exit_code(error: &CliError) -> i32 {
    match error {
        CliError::Queue(e) if e.is_fatal() => 2,
        CliError::Queue(e) if e.is_timeout() => 3,
        CliError::Rejected { .. } => 4,
        _ => 1,
    }
}
