//! Background tasks for the Sonde server.

use std::sync::Arc;
use std::time::Duration;

use sonde_datastore::ObsDatabase;
use sonde_types::Timestamp;
use tokio::time::sleep;

/// Starts the observation retention task.
///
/// Runs indefinitely, periodically purging observations older than
/// `max_age` and pruning series left empty.
pub async fn start_retention_task(db: Arc<ObsDatabase>, max_age_secs: u64, interval_secs: u64) {
    if max_age_secs == 0 {
        tracing::warn!("observation retention task disabled (max_age=0)");
        return;
    }
    let interval = Duration::from_secs(interval_secs.max(1));
    tracing::info!(max_age_secs, interval_secs, "starting observation retention task");

    loop {
        sleep(interval).await;

        let db = Arc::clone(&db);
        let result = tokio::task::spawn_blocking(move || {
            let cutoff = Timestamp::now().saturating_sub_millis(max_age_secs as i64 * 1000);
            db.purge_observations_before(cutoff)
        })
        .await;

        match result {
            Ok(Ok(0)) => tracing::debug!("no expired observations to purge"),
            Ok(Ok(count)) => tracing::info!(count, "purged expired observations"),
            Ok(Err(e)) => tracing::error!(error = %e, "failed to purge observations"),
            Err(e) => tracing::error!(error = %e, "retention task join error"),
        }
    }
}
