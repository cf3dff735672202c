//! Periodic background sync
//!
//! Spawns a task that, every interval, re-reads channels into the ability
//! index, writes committed quota to the store, releases reservations that
//! were never reported and drops idle rate-limit windows. It runs
//! independently of the request path.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::distributor::Distributor;
use crate::quota::SyncReport;

/// Spawn the sync loop. The first tick is skipped because the caller has
/// just reloaded.
pub fn spawn_sync_task(
    distributor: Arc<Distributor>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            sync_cycle(&distributor).await;
        }
    })
}

/// Run one sync cycle. Failures are logged and retried next cycle.
pub async fn sync_cycle(distributor: &Distributor) -> SyncReport {
    if let Err(e) = distributor.reload().await {
        warn!(error = %e, "channel reload failed, keeping previous index");
    }

    let report = distributor.ledger().sync().await;
    let reaped = distributor
        .ledger()
        .reap_expired(distributor.config().reservation_ttl());
    let pruned = distributor.limiter().prune_idle();

    debug!(
        persisted = report.persisted,
        evicted = report.evicted,
        reaped,
        pruned,
        "sync cycle finished"
    );
    report
}
