//! Scheduled pruning of aged Delta records.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use crate::store::DeltaStore;

/// How often the retention sweep runs. Pruning is cheap and idempotent, so
/// an hourly cadence keeps the window tight without a daily scheduler.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Runs the retention sweep until shutdown is signaled.
pub async fn run_retention_task(
    store: DeltaStore,
    retention_days: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(retention_days, "retention task started");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                match store.prune_older_than(retention_days).await {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "pruned aged delta records"),
                    Err(e) => error!(error = %e, "retention sweep failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("retention task stopping");
                    return;
                }
            }
        }
    }
}
