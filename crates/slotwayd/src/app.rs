//! Daemon assembly and the serve loop.
//!
//! Wires the subsystems together:
//! - State store (redb)
//! - Slot registry + route caches
//! - Traffic router
//! - Metrics collector (periodic flush)
//! - Rollout controller + manager (HTTP health probes)
//! - Maintenance loop (rollup retention, cache purge)
//! - REST API

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use slotway_api::AppState;
use slotway_health::HttpProbe;
use slotway_metrics::MetricsCollector;
use slotway_rollout::{RolloutController, RolloutManager};
use slotway_router::{RouteCaches, SlotRegistry, TrafficRouter};
use slotway_state::StateStore;

use crate::config::SlotwayConfig;

/// File name of the state database inside the data directory.
pub const DB_FILE: &str = "slotway.redb";

/// All long-lived components of one daemon.
pub struct Daemon {
    pub config: SlotwayConfig,
    pub state: AppState,
}

impl Daemon {
    /// Open the on-disk store under `config.server.data_dir` and assemble.
    pub fn open(config: SlotwayConfig) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.server.data_dir)?;
        let db_path = config.server.data_dir.join(DB_FILE);
        let store = StateStore::open(&db_path)?;
        info!(path = ?db_path, "state store opened");
        Ok(Self::assemble(config, store))
    }

    /// Build every component on top of `store`.
    pub fn assemble(config: SlotwayConfig, store: StateStore) -> Self {
        let caches = Arc::new(RouteCaches::new(
            Duration::from_secs(config.router.slot_cache_ttl_secs),
            Duration::from_secs(config.router.sticky_ttl_secs),
        ));
        let registry = Arc::new(SlotRegistry::with_caches(store.clone(), caches));

        let collector = Arc::new(MetricsCollector::new(
            store,
            Duration::from_secs(config.metrics.flush_interval_secs),
        ));

        let controller = Arc::new(RolloutController::new(
            Arc::clone(&registry),
            Arc::new(HttpProbe),
            collector.clone(),
            config.rollout.settings(),
        ));

        let state = AppState {
            router: TrafficRouter::new(registry),
            collector,
            rollouts: Arc::new(RolloutManager::with_max_finished(
                controller,
                config.rollout.max_finished_attempts,
            )),
        };
        Self { config, state }
    }

    pub fn router(&self) -> axum::Router {
        slotway_api::build_router(self.state.clone())
    }

    /// Serve the API until `shutdown` resolves, then abort in-flight
    /// rollouts and flush buffered metrics.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        let state = self.state.clone();
        state.collector.start().await;

        let (stop_tx, stop_rx) = watch::channel(false);
        let maintenance = tokio::spawn(maintenance_loop(
            state.clone(),
            Retention::from_config(&self.config),
            stop_rx,
        ));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.server.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "API server starting");

        // Rollouts are aborted before connections drain so that event
        // streams reach their terminal event and close.
        let rollouts = Arc::clone(&state.rollouts);
        let server = axum::serve(listener, self.router()).with_graceful_shutdown(async move {
            shutdown.await;
            info!("shutdown signal received");
            rollouts.abort_all().await;
            let _ = stop_tx.send(true);
        });
        server.await?;

        let _ = maintenance.await;
        state.collector.stop().await;

        info!("slotway daemon stopped");
        Ok(())
    }
}

/// What the maintenance loop expires, and how often it runs.
#[derive(Debug, Clone, Copy)]
struct Retention {
    every: Duration,
    rollup_days: u64,
    attempts: Duration,
}

impl Retention {
    fn from_config(config: &SlotwayConfig) -> Self {
        Self {
            every: Duration::from_secs(config.metrics.cleanup_interval_secs),
            rollup_days: config.metrics.retention_days,
            attempts: Duration::from_secs(config.rollout.attempt_retention_secs),
        }
    }
}

/// Periodic housekeeping: delete expired rollups, drop old finished rollout
/// attempts and purge stale cache entries.
async fn maintenance_loop(
    state: AppState,
    retention: Retention,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(retention.every);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match state.collector.cleanup(retention.rollup_days).await {
                    Ok(removed) => debug!(removed, "rollup retention pass"),
                    Err(e) => warn!(error = %e, "rollup cleanup failed"),
                }
                state.rollouts.prune_finished(retention.attempts).await;
                let caches = state.router.registry().caches();
                let purged = caches.slots.purge_expired() + caches.sessions.purge_expired();
                if purged > 0 {
                    debug!(purged, "expired route cache entries purged");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
