use std::sync::Arc;

use anyhow::Context;
use ftb_core::{
    activity::ActivityLog,
    clock::SystemClock,
    config::Config,
    domain::{JobKind, Subject},
    jobs::JobRegistry,
    maintenance::{RetentionStep, MAINTENANCE_SUBJECT},
};
use ftb_sqlite::SqliteStore;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ftb_core::logging::init("ftb")?;

    let cfg = Config::load().context("loading configuration")?;

    let store = Arc::new(
        SqliteStore::open(&cfg.database_path)
            .with_context(|| format!("opening store at {}", cfg.database_path.display()))?,
    );
    let mut log = ActivityLog::new(store.clone());
    if let Some(path) = &cfg.activity_mirror_path {
        log = log.with_mirror(path);
    }
    let registry = JobRegistry::new(log.clone());

    let retention = RetentionStep::new(store.clone(), Arc::new(SystemClock), cfg.retention);
    registry
        .start(
            Subject::new(MAINTENANCE_SUBJECT),
            JobKind::Maintenance,
            cfg.retention_interval,
            Arc::new(retention),
        )
        .await?;

    if cfg.openrouter_api_key.is_none() {
        warn!("OPENROUTER_API_KEY not set; the OpenRouter completion adapter cannot be used");
    }

    info!(
        quotas = cfg.quotas.len(),
        store = %cfg.database_path.display(),
        "ftb running; press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    info!("shutting down");
    registry.shutdown().await;
    Ok(())
}
