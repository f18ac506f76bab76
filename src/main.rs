use std::sync::Arc;

use anyhow::{Context, Result};
use codex_sync::config::{CodexConfig, CONFIG_KEYS};
use codex_sync::database_ops::db::Db;
use codex_sync::database_ops::pg_store::PgItemStore;
use codex_sync::database_ops::store::ItemStore;
use codex_sync::database_ops::worker_manager::{OwnerSyncJob, PriceSyncJob, WorkerManager};
use codex_sync::logging::{init_tracing, DEFAULT_FILTER};
use codex_sync::util::env as env_util;
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    init_tracing(DEFAULT_FILTER)?;

    env_util::preflight_check("codex-sync service", &[], CONFIG_KEYS)?;
    let cfg = CodexConfig::from_env();
    let database_url = env_util::db_url()?;
    let db = Db::connect(&database_url, cfg.db_max_conns)
        .await
        .context("connecting to item store database")?;
    let items: Arc<dyn ItemStore> = Arc::new(PgItemStore::new(db, cfg.collection.clone()));
    let http = cfg.http_client()?;

    if cfg.owners.api_key.is_none() {
        warn!("SUBGRAPH_API_KEY not set; owner sync runs will be skipped");
    }
    if cfg.prices.base_url.is_none() {
        warn!("MARKETPLACE_BASE_URL not set; price sync runs will be skipped");
    }

    let mut manager = WorkerManager::new();
    manager
        .schedule(
            Arc::new(OwnerSyncJob {
                items: items.clone(),
                http: http.clone(),
                cfg: cfg.owners.clone(),
            }),
            cfg.owners.interval,
        )
        .schedule(
            Arc::new(PriceSyncJob {
                items,
                http,
                cfg: cfg.prices.clone(),
            }),
            cfg.prices.interval,
        );
    info!(
        owner_every_secs = cfg.owners.interval.as_secs(),
        price_every_secs = cfg.prices.interval.as_secs(),
        "codex-sync service starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = tokio::spawn(manager.run_until(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown: Ctrl+C received");
    let _ = shutdown_tx.send(true);
    scheduler.await??;
    info!("shutdown complete");
    Ok(())
}
