//! milestoned - milestone oracle adapter daemon
//!
//! Library components for the daemon process: SQLite state store, metric
//! source and the external-adapter HTTP server.

pub mod server;
pub mod source;
pub mod storage;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use milestone_core::cache::{InMemoryCache, NoCache, StateCache};
use milestone_core::store::{InMemoryStore, StateStore};
use milestone_core::{Config, MilestoneEngine};
use server::AppState;
use source::{MetricSource, YouTubeSource};
use storage::Storage;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Where resource state is kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StoreBackend {
    /// SQLite file at `Config::db_path`.
    #[default]
    Sqlite,
    /// Process memory; state is lost on exit.
    Memory,
}

/// Daemon configuration.
#[derive(Debug, Clone, Default)]
pub struct DaemonConfig {
    pub config: Config,
    pub store: StoreBackend,
}

/// Daemon state.
pub struct Daemon {
    config: DaemonConfig,
    state: Arc<AppState>,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Create a new daemon with the given configuration.
    pub async fn new(config: DaemonConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let source: Arc<dyn MetricSource> = Arc::new(YouTubeSource::from_config(&config.config));
        Self::with_source(config, source).await
    }

    /// Create a daemon that reads metrics from `source`.
    pub async fn with_source(
        config: DaemonConfig,
        source: Arc<dyn MetricSource>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let catalog = config.config.catalog()?;

        let store: Arc<dyn StateStore> = match config.store {
            StoreBackend::Sqlite => {
                let storage = Storage::new(&config.config.db_path).await?;
                storage.migrate_embedded().await?;
                Arc::new(storage)
            }
            StoreBackend::Memory => Arc::new(InMemoryStore::new()),
        };
        let cache: Arc<dyn StateCache> = if config.config.state_cache {
            Arc::new(InMemoryCache::new())
        } else {
            Arc::new(NoCache)
        };

        let mut engine = MilestoneEngine::new(catalog, store, cache);
        if let Some(timeout) = config.config.store_timeout() {
            engine = engine.with_store_timeout(timeout);
        }

        let state = AppState::new(Arc::new(engine), source)
            .with_auth_token(config.config.auth_token.clone())
            .with_source_timeout(config.config.source_timeout());

        Ok(Self {
            config,
            state: Arc::new(state),
            shutdown: CancellationToken::new(),
        })
    }

    /// Address the HTTP server binds to.
    pub fn listen_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        let ip: IpAddr = self.config.config.bind.parse()?;
        Ok(SocketAddr::new(ip, self.config.config.port))
    }

    /// Serve requests until [`Daemon::shutdown`] is called.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let config = &self.config.config;
        let addr = self.listen_addr()?;
        info!("milestoned starting on {}", addr);
        match self.config.store {
            StoreBackend::Sqlite => info!("database: {}", config.db_path.display()),
            StoreBackend::Memory => warn!("in-memory store: state is lost on exit"),
        }
        for metric in config.metrics.keys() {
            info!(metric = %metric, "metric registered");
        }
        for (resource_id, metrics) in &config.resources {
            for metric in metrics.keys() {
                info!(resource_id = %resource_id, metric = %metric, "metric override registered");
            }
        }
        if config.auth_token.is_some() {
            info!("auth token: enabled");
        }
        if config.youtube_api_key.is_none() {
            warn!("youtube_api_key not set; adapter requests will fail");
        }

        server::start_server(Arc::clone(&self.state), addr, self.shutdown.clone()).await?;
        info!("milestoned stopped");
        Ok(())
    }

    /// Signal the daemon to shut down gracefully.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Check if shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
