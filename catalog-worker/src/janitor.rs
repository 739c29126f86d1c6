use catalog_orchestrator::Orchestrator;
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{error, info};

/// Periodically purge DELETED records older than `retention_secs`.
pub async fn start_janitor_task(
    orchestrator: Arc<Orchestrator>,
    interval_secs: u64,
    retention_secs: u64,
) {
    let mut interval = interval(Duration::from_secs(interval_secs));
    let retention = Duration::from_secs(retention_secs);

    info!(
        "Janitor task running (checks every {} seconds, retention {} seconds)",
        interval_secs, retention_secs
    );

    loop {
        interval.tick().await;

        if let Err(e) = purge_expired(&orchestrator, retention).await {
            error!("Janitor cleanup failed: {}", e);
        }
    }
}

/// One janitor pass. Returns the number of records removed.
pub async fn purge_expired(orchestrator: &Orchestrator, retention: Duration) -> anyhow::Result<u64> {
    let purged = orchestrator.purge_deleted(retention).await?;

    if purged > 0 {
        info!("Purged {} deleted service instances", purged);
    }

    Ok(purged)
}
