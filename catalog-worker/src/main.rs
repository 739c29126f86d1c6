use anyhow::Result;
use catalog_logging::{init_subscriber, LogSettings};
use catalog_orchestrator::db::{backup_database, create_pool, run_migrations};
use catalog_orchestrator::Orchestrator;
use catalog_worker::{start_janitor_task, Config};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = init_subscriber(&LogSettings::from_env())?;

    info!("Starting catalog-worker...");

    let config = Config::load()?;
    info!(
        "Configuration loaded: db_path={}, remote={}, definitions={}",
        config.db_path.display(),
        config.orchestrator.gateway.base_url,
        config.orchestrator.definitions.len()
    );

    // Backup before migrations
    let db_path = &config.db_path;
    if let Some(backup_path) = backup_database(db_path)? {
        info!("Database backed up to: {}", backup_path.display());
    }

    let pool = create_pool(db_path).await?;
    info!("Running database migrations...");
    run_migrations(&pool).await?;
    info!("Migrations complete");

    let orchestrator = Arc::new(Orchestrator::from_config(pool, &config.orchestrator)?);

    let janitor = tokio::spawn(start_janitor_task(
        orchestrator.clone(),
        config.janitor_interval_secs,
        config.deleted_retention_secs,
    ));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping janitor");
    janitor.abort();

    Ok(())
}
