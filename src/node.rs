//! Coordinator wiring: builds every subsystem from configuration and runs
//! them until shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::api::{router, AppState};
use crate::auth::keyring::KeyRingError;
use crate::auth::{KeyRing, RequestVerifier};
use crate::config::{Config, ConfigError, DatabaseEngine};
use crate::janitor::Janitor;
use crate::repo::{MemoryRepository, RepoError, Repository, SqliteRepository};
use crate::scheduler::Scheduler;
use crate::transport::{DownlinkWaiters, TransportRegistry};

#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("storage init failed: {0}")]
    Storage(#[from] RepoError),

    #[error("key ring init failed: {0}")]
    KeyRing(#[from] KeyRingError),
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("server error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// The assembled Coordinator. Construction validates config and opens
/// storage; `run` starts the transports, scheduler, janitor, and the HTTP
/// server, and blocks until the shutdown token fires.
pub struct Coordinator {
    config: Config,
    repo: Repository,
    verifier: Arc<RequestVerifier>,
    transports: Arc<TransportRegistry>,
    waiters: Arc<DownlinkWaiters>,
}

impl Coordinator {
    pub fn new(config: Config) -> Result<Self, InitError> {
        let repo = match config.database.engine {
            DatabaseEngine::Memory => Repository::Memory(MemoryRepository::new()),
            DatabaseEngine::Sqlite => Repository::Sqlite(SqliteRepository::open(
                &config.database.path,
                config.database.tables.clone(),
            )?),
        };

        let keyring = KeyRing::from_config(
            &config.auth.encryption_keys,
            config.auth.default_key_id.clone(),
        )?;
        let verifier = Arc::new(RequestVerifier::new(
            repo.clone(),
            keyring,
            config.auth.timestamp_skew_s,
            config.auth.trusted_proxies.clone(),
        ));

        let waiters = Arc::new(DownlinkWaiters::new());
        let transports = Arc::new(TransportRegistry::from_config(
            &config.transports,
            repo.clone(),
            waiters.clone(),
        ));

        Ok(Self {
            config,
            repo,
            verifier,
            transports,
            waiters,
        })
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), RunError> {
        let addr = self.config.listen_addr()?;

        self.transports.start_all(&shutdown).await;

        let scheduler = Scheduler::new(
            self.repo.clone(),
            self.transports.clone(),
            self.waiters.clone(),
            self.config.scheduler.clone(),
        );
        let scheduler_handle = scheduler.handle();
        tokio::spawn(scheduler.run(shutdown.clone()));

        let janitor = Janitor::new(
            self.repo.clone(),
            self.transports.clone(),
            self.config.janitor.clone(),
        );
        tokio::spawn(janitor.run(shutdown.clone()));

        let state = AppState {
            repo: self.repo,
            verifier: self.verifier,
            transports: self.transports.clone(),
            waiters: self.waiters,
            scheduler: scheduler_handle,
            jobs_config: Arc::new(self.config.jobs.clone()),
            api_config: Arc::new(self.config.api.clone()),
        };
        let app = router(state);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(addr = %addr, "coordinator listening");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

        self.transports.stop_all().await;
        tracing::info!("coordinator stopped");
        Ok(())
    }
}
