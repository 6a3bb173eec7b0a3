//! Startup/shutdown coordination.
//!
//! Startup restores the cache snapshot written by the previous run (best
//! effort — any corruption falls back to an empty cache) and spawns the
//! refresh loops. Shutdown cancels the loops, waits a bounded grace period
//! for each to acknowledge, and then persists the cache from the
//! coordinator's own read of it — never from inside a loop, so an abandoned
//! loop cannot corrupt the on-disk state.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::CacheSnapshot;
use crate::refresh::{spawn_microsoft_refresher, spawn_untis_refresher};
use crate::state::AppState;

/// How long a refresh loop gets to acknowledge cancellation before it is
/// abandoned.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Handles to the running background loops.
pub struct Lifecycle {
    shutdown: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Lifecycle {
    /// Restore persisted state and start one refresh loop per service.
    pub async fn start(state: &AppState) -> Self {
        restore_cache(state).await;

        let shutdown = CancellationToken::new();
        let tasks = vec![
            (
                "untis refresher",
                spawn_untis_refresher(
                    state.untis.clone(),
                    Duration::from_secs(state.config.untis.refresh_interval_secs),
                    shutdown.clone(),
                ),
            ),
            (
                "microsoft refresher",
                spawn_microsoft_refresher(
                    state.microsoft.clone(),
                    Duration::from_secs(state.config.microsoft.refresh_interval_secs),
                    shutdown.clone(),
                ),
            ),
        ];
        info!("refresh loops started");
        Self { shutdown, tasks }
    }

    /// Stop the loops and persist the cache snapshot.
    pub async fn shutdown(self, state: &AppState) {
        self.shutdown.cancel();
        for (name, handle) in self.tasks {
            match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
                Ok(_) => debug!("{name} stopped"),
                Err(_) => warn!(
                    "{name} did not acknowledge shutdown within {}s, abandoning",
                    SHUTDOWN_GRACE.as_secs()
                ),
            }
        }
        persist_cache(state).await;
    }
}

/// Load the cache snapshot from disk. Missing or corrupt snapshots are
/// normal (first boot, unclean shutdown) and fall back to empty.
async fn restore_cache(state: &AppState) {
    let path = state.config.storage.cache_snapshot_path();
    match tokio::fs::read_to_string(&path).await {
        Ok(raw) => match serde_json::from_str::<CacheSnapshot>(&raw) {
            Ok(snapshot) => {
                state.cache.restore(snapshot).await;
                info!("restored cache snapshot from {}", path.display());
            }
            Err(e) => warn!("ignoring corrupt cache snapshot {}: {e}", path.display()),
        },
        Err(_) => debug!("no cache snapshot at {}", path.display()),
    }
}

/// Write the cache snapshot. Failure is logged and otherwise ignored — a
/// clock that cannot persist still has to shut down.
async fn persist_cache(state: &AppState) {
    let path = state.config.storage.cache_snapshot_path();
    let snapshot = state.cache.snapshot().await;
    let bytes = match serde_json::to_vec_pretty(&snapshot) {
        Ok(b) => b,
        Err(e) => {
            warn!("failed to serialize cache snapshot: {e}");
            return;
        }
    };
    if let Some(parent) = path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    match tokio::fs::write(&path, bytes).await {
        Ok(()) => info!("cache snapshot written to {}", path.display()),
        Err(e) => warn!("failed to write cache snapshot {}: {e}", path.display()),
    }
}
