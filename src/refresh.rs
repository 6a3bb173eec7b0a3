//! Background refresh loops, one per external service.
//!
//! Each loop ticks at its configured interval, keeps its session fresh, and
//! mirrors the service's derived data into the cache. A failed iteration is
//! logged and swallowed — the loop itself never dies; the slower tick
//! cadence doubles as a secondary backoff once login retries are exhausted.
//! Cancellation is observed at the tick boundary, and every network call
//! inside an iteration carries its own timeout, so shutdown is never hostage
//! to a hung remote.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clients::microsoft::IdentityProvider;
use crate::clients::untis::TimetableFetch;
use crate::errors::SessionError;
use crate::services::{MicrosoftService, UntisService};

fn log_iteration(service: &str, result: Result<(), SessionError>) {
    match result {
        Ok(()) => debug!("{service} refresher: cache updated"),
        // Normal state on a factory-fresh clock; not worth warning about.
        Err(SessionError::NotConfigured) => {
            debug!("{service} refresher: waiting for credentials");
        }
        Err(e) => warn!("{service} refresher: iteration failed: {e}"),
    }
}

/// Spawn the timetable refresh loop. The first tick fires immediately so a
/// restarted clock shows data as soon as the session comes up.
pub fn spawn_untis_refresher<P: TimetableFetch>(
    service: Arc<UntisService<P>>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("untis refresher: shutting down");
                    return;
                }
                _ = ticker.tick() => {}
            }
            log_iteration("untis", service.refresh_once().await);
        }
    })
}

/// Spawn the Microsoft token refresh loop.
pub fn spawn_microsoft_refresher<P: IdentityProvider>(
    service: Arc<MicrosoftService<P>>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("microsoft refresher: shutting down");
                    return;
                }
                _ = ticker.tick() => {}
            }
            log_iteration("microsoft", service.refresh_once().await);
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::NaiveDate;

    use super::*;
    use crate::cache::{DataCache, HolidayEntry, TimetableEntry};
    use crate::clients::untis::UntisSession;
    use crate::credentials::{CredentialSlot, UntisCredentials};
    use crate::session::{SessionClient, SessionPolicy};

    struct FlakyTimetable {
        fetches: AtomicU32,
        fail: AtomicBool,
    }

    #[async_trait]
    impl SessionClient for FlakyTimetable {
        type Handle = UntisSession;

        async fn login(&self) -> Result<UntisSession, SessionError> {
            Ok(UntisSession {
                session_id: "stub".to_string(),
                person_id: Some(1),
                person_type: Some(5),
            })
        }

        async fn logout(&self, _handle: std::sync::Arc<UntisSession>) {}
    }

    #[async_trait]
    impl TimetableFetch for FlakyTimetable {
        async fn fetch_timetable(
            &self,
            _session: &UntisSession,
            start: NaiveDate,
            _end: NaiveDate,
        ) -> Result<Vec<TimetableEntry>, SessionError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(SessionError::transient("remote 500"));
            }
            let start_dt = start.and_hms_opt(8, 0, 0).unwrap();
            Ok(vec![TimetableEntry {
                subject: "AM".to_string(),
                start: start_dt,
                end: start_dt,
                room: String::new(),
                classes: Vec::new(),
            }])
        }

        async fn fetch_holidays(
            &self,
            _session: &UntisSession,
        ) -> Result<Vec<HolidayEntry>, SessionError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn loop_populates_cache_survives_failures_and_cancels_cleanly() {
        let client = std::sync::Arc::new(FlakyTimetable {
            fetches: AtomicU32::new(0),
            fail: AtomicBool::new(false),
        });
        let cache = std::sync::Arc::new(DataCache::new());
        let creds: std::sync::Arc<CredentialSlot<UntisCredentials>> = std::sync::Arc::new(
            CredentialSlot::ephemeral(std::env::temp_dir().join("clockd-refresh-test.json")),
        );
        let service = std::sync::Arc::new(UntisService::new(
            creds,
            std::sync::Arc::clone(&client),
            std::sync::Arc::clone(&cache),
            SessionPolicy::default(),
            10,
        ));

        let shutdown = CancellationToken::new();
        let handle = spawn_untis_refresher(
            std::sync::Arc::clone(&service),
            Duration::from_secs(60),
            shutdown.clone(),
        );

        // First tick fires immediately.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(client.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(cache.timetable().await.data.len(), 1);

        // A failing iteration neither kills the loop nor clears the cache.
        client.fail.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(client.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(cache.timetable().await.data.len(), 1);

        // Recovery on the next tick.
        client.fail.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(client.fetches.load(Ordering::SeqCst), 3);

        // Cancellation is acknowledged at the tick boundary.
        shutdown.cancel();
        handle.await.unwrap();
        assert_eq!(cache.timetable().await.data.len(), 1);
    }
}
