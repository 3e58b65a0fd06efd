//! milestoned - milestone oracle adapter daemon
//!
//! Main entry point for the daemon binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::PathBuf;

use clap::Parser;
use milestone_core::Config;
use milestoned::{Daemon, DaemonConfig, StoreBackend};
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "milestoned", about = "Milestone oracle adapter daemon", version)]
struct Cli {
    /// Config file (key=value)
    #[arg(short, long, env = "MILESTONED_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,

    /// Address to bind
    #[arg(long)]
    bind: Option<String>,

    /// SQLite database path
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Bearer token required on adapter and admin routes
    #[arg(long, env = "MILESTONED_AUTH_TOKEN")]
    auth_token: Option<String>,

    /// Keep state in memory only (lost on exit)
    #[arg(long)]
    in_memory: bool,

    /// Disable the in-process state cache
    #[arg(long)]
    no_cache: bool,

    /// YouTube Data API key
    #[arg(long, env = "YOUTUBE_API_KEY", hide_env_values = true)]
    youtube_api_key: Option<String>,

    /// Seed the likes counter of never-seen videos with this value
    #[arg(long, env = "INITIAL_LIKES_COUNT")]
    initial_likes_count: Option<u64>,
}

impl Cli {
    fn into_daemon_config(self) -> Result<DaemonConfig, milestone_core::config::ConfigError> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(db_path) = self.db_path {
            config.db_path = db_path;
        }
        if self.auth_token.is_some() {
            config.auth_token = self.auth_token;
        }
        if self.no_cache {
            config.state_cache = false;
        }
        if self.youtube_api_key.is_some() {
            config.youtube_api_key = self.youtube_api_key;
        }
        if let Some(initial) = self.initial_likes_count {
            config.metrics.entry("likes".to_string()).or_default().initial = Some(initial);
        }

        Ok(DaemonConfig {
            config,
            store: if self.in_memory {
                StoreBackend::Memory
            } else {
                StoreBackend::Sqlite
            },
        })
    }
}

fn main() {
    let cli = Cli::parse();

    // Initialize tracing.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match cli.into_daemon_config() {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    // Run the async main.
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    let exit_code = runtime.block_on(async {
        let daemon = match Daemon::new(config).await {
            Ok(daemon) => daemon,
            Err(e) => {
                error!("failed to initialize daemon: {}", e);
                return 1;
            }
        };

        let run = daemon.run();
        tokio::pin!(run);

        // First signal starts a graceful shutdown; the server drains in-flight
        // requests before `run` returns.
        tokio::select! {
            result = &mut run => return report(result),
            _ = shutdown_signal() => daemon.shutdown(),
        }
        report(run.await)
    });

    std::process::exit(exit_code);
}

fn report(result: Result<(), Box<dyn std::error::Error + Send + Sync>>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            error!("daemon error: {}", e);
            1
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            error!("failed to register signal handlers: {}", e);
            std::future::pending::<()>().await;
            return;
        }
    };

    tokio::select! {
        _ = sigint.recv() => tracing::info!("received SIGINT, initiating graceful shutdown"),
        _ = sigterm.recv() => tracing::info!("received SIGTERM, initiating graceful shutdown"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("received SIGINT, initiating graceful shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "milestoned",
            "--port",
            "9000",
            "--youtube-api-key",
            "key-1",
            "--initial-likes-count",
            "30",
            "--no-cache",
        ])
        .unwrap();
        let daemon = cli.into_daemon_config().unwrap();

        assert_eq!(daemon.config.port, 9000);
        assert_eq!(daemon.config.youtube_api_key.as_deref(), Some("key-1"));
        assert_eq!(daemon.config.metrics["likes"].initial, Some(30));
        assert!(!daemon.config.state_cache);
        assert!(matches!(daemon.store, StoreBackend::Sqlite));
    }

    #[test]
    fn initial_likes_count_must_be_a_number() {
        let result = Cli::try_parse_from(["milestoned", "--initial-likes-count", "lots"]);
        assert!(result.is_err());
    }
}
