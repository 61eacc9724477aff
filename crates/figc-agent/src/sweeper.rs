//! Stale staging sweeper
//!
//! Abandoned staging directories (`{key}.tmp-{random}`) are left behind by
//! crashed or killed processes. The sweeper removes them once they are old
//! enough that no live job can still own them; per-entry failures are
//! logged and skipped.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8Path;

use crate::service::Agent;

const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);
const STALE_AGE: Duration = Duration::from_secs(24 * 3600);

/// Sweep at startup and then hourly until the service shuts down.
pub(crate) async fn run_sweeper(agent: Arc<Agent>) {
    let packages = agent.config.packages_dir();
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        sweep_stale_staging(&packages, STALE_AGE);
    }
}

/// Remove staging directories older than `stale_age`.
pub(crate) fn sweep_stale_staging(packages: &Utf8Path, stale_age: Duration) {
    let entries = match std::fs::read_dir(packages) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::debug!(dir = %packages, error = %err, "sweep skipped");
            return;
        }
    };

    for entry in entries {
        let Ok(entry) = entry else { continue };
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.contains(".tmp-") {
            continue;
        }

        // Age by modification time: a live job keeps writing into its
        // staging directory, so a long download never looks stale.
        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .and_then(|t| {
                t.elapsed()
                    .map_err(|e| std::io::Error::other(e.to_string()))
            });
        match age {
            Ok(age) if age >= stale_age => {
                match std::fs::remove_dir_all(entry.path()) {
                    Ok(()) => tracing::info!(entry = %name, "removed stale staging directory"),
                    Err(err) => {
                        tracing::debug!(entry = %name, error = %err, "failed to remove stale staging directory")
                    }
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(entry = %name, error = %err, "could not determine staging age")
            }
        }
    }
}
