pub mod poller;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::archive::{Archive, ArchiveHandle, ClickHouseArchive, MemoryArchive};
use crate::clock::SystemClock;
use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::migrate::{ClickHouseMigrator, Migrator};
use crate::orchestrator::{KubectlClient, Orchestrator};

pub use poller::{CycleReport, Poller};

/// Agent wires the orchestrator, archive and health server around the
/// poller and owns their lifecycle.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    poller: Option<JoinHandle<Result<()>>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            poller: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Start all components and begin polling.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Start health metrics server (before migrations so health checks respond).
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        let ch_cfg = &self.cfg.archive.clickhouse;

        // 1. Run migrations if enabled.
        if ch_cfg.enabled && ch_cfg.migrations.enabled {
            info!("running ClickHouse migrations...");
            ClickHouseMigrator::from_config(ch_cfg)
                .up()
                .await
                .context("running migrations")?;
        }

        // 2. Orchestrator.
        let orchestrator = Arc::new(KubectlClient::new(self.cfg.orchestrator.clone()));

        // 3. Archive, then the poller on top of it.
        if ch_cfg.enabled {
            let archive = ClickHouseArchive::connect(ch_cfg)
                .await
                .context("connecting ClickHouse archive")?;
            self.spawn_poller(orchestrator, archive);
        } else {
            info!("ClickHouse archive disabled, keeping records in memory");
            self.spawn_poller(orchestrator, MemoryArchive::new());
        }

        info!("agent started");

        Ok(())
    }

    fn spawn_poller<O: Orchestrator, A: Archive>(&mut self, orchestrator: Arc<O>, archive: A) {
        let archive = ArchiveHandle::new(
            Arc::new(archive),
            self.cfg.archive.timeout,
            Some(Arc::clone(&self.health)),
        );
        info!(archive = archive.inner().name(), "archive ready");

        let poller = Poller::new(
            self.cfg.clone(),
            orchestrator,
            archive,
            Arc::new(SystemClock),
            Some(Arc::clone(&self.health)),
        );
        self.poller = Some(tokio::spawn(poller.run(self.cancel.clone())));
    }

    /// Gracefully stops all components. The cycle in progress, if any,
    /// finishes first.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(task) = self.poller.take() {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "poller exited with error"),
                Err(e) => error!(error = %e, "poller task failed"),
            }
        }

        // Stop health metrics server.
        self.health.stop().await?;

        Ok(())
    }
}
