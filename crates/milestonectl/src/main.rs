//! milestonectl - CLI client for milestoned
//!
//! Trigger checks and inspect or reset per-resource milestone state.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

mod client;
mod render;

use clap::{Parser, Subcommand};
use client::{Client, ClientError};

/// CLI client for the milestoned adapter daemon.
#[derive(Parser)]
#[command(name = "milestonectl")]
#[command(about = "Control client for the milestoned oracle adapter")]
#[command(version)]
struct Cli {
    /// Daemon address (default: http://127.0.0.1:8080)
    #[arg(long, global = true, env = "MILESTONED_ADDR")]
    addr: Option<String>,

    /// Auth token for daemon API
    #[arg(long, global = true, env = "MILESTONED_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch a metric and apply it, exactly as an oracle job would
    Check {
        /// Video id
        resource_id: String,

        /// Metric name (views, likes)
        metric: String,

        /// Job run id to send (default: timestamp-based)
        #[arg(long)]
        job_id: Option<String>,
    },

    /// Show stored counters and next triggers
    Status {
        /// Video id
        resource_id: String,
    },

    /// Delete a resource's stored state
    Forget {
        /// Video id
        resource_id: String,
    },

    /// Probe daemon health
    Health,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let addr = cli
        .addr
        .unwrap_or_else(|| "http://127.0.0.1:8080".to_string());
    let client = Client::new(&addr, cli.token.as_deref());

    // Health reports the probe result itself; everything else waits for
    // the daemon first.
    let requires_daemon = !matches!(cli.command, Command::Health);
    if requires_daemon {
        if let Err(e) = client.wait_for_ready().await {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    }

    let result = match cli.command {
        Command::Check {
            resource_id,
            metric,
            job_id,
        } => run_check(&client, &resource_id, &metric, job_id.as_deref()).await,
        Command::Status { resource_id } => run_status(&client, &resource_id).await,
        Command::Forget { resource_id } => run_forget(&client, &resource_id).await,
        Command::Health => run_health(&client).await,
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run_check(
    client: &Client,
    resource_id: &str,
    metric: &str,
    job_id: Option<&str>,
) -> Result<(), ClientError> {
    let job_id = job_id.map_or_else(
        || format!("milestonectl-{}", chrono::Utc::now().timestamp_millis()),
        str::to_string,
    );
    let response = client.check(&job_id, resource_id, metric).await?;
    render::print_check(resource_id, metric, &response);
    Ok(())
}

async fn run_status(client: &Client, resource_id: &str) -> Result<(), ClientError> {
    let status = client.status(resource_id).await?;
    render::print_status(&status);
    Ok(())
}

async fn run_forget(client: &Client, resource_id: &str) -> Result<(), ClientError> {
    if client.forget(resource_id).await? {
        println!("Deleted state for {}", resource_id);
    } else {
        println!("No stored state for {}", resource_id);
    }
    Ok(())
}

async fn run_health(client: &Client) -> Result<(), ClientError> {
    if client.check_health().await? {
        println!("milestoned at {} is healthy", client.addr());
        Ok(())
    } else {
        Err(ClientError::HttpError {
            status: 0,
            message: format!("milestoned at {} reported unhealthy", client.addr()),
        })
    }
}
