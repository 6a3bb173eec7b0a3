//! Per-service session lifecycle management.
//!
//! [`SessionManager`] is the single authority for one external service's
//! authenticated session. It owns the session handle outright — other
//! components only ever see derived data through the cache — and drives the
//! state machine:
//!
//! ```text
//! Disconnected --attempt--> Connecting --success--> Connected
//! Connecting --failure--> Error
//! Connected --expiry/revocation--> Disconnected (via invalidate)
//! Error --next ensure_session--> Connecting
//! any state --invalidate()--> Disconnected
//! ```
//!
//! ## Concurrency
//!
//! At most one login attempt is ever in flight. Callers that find the state
//! `Connecting` await the in-flight attempt's outcome through a shared
//! `watch` channel instead of starting a second login — duplicate logins
//! against a rate-limited third party can trigger lockout. `invalidate()`
//! bumps a generation counter so an attempt finishing after an invalidation
//! cannot resurrect a session the caller just tore down.

pub mod retry;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::errors::SessionError;
use retry::{retry_with_backoff, RetryPolicy};

/// A provider a [`SessionManager`] can log into.
#[async_trait]
pub trait SessionClient: Send + Sync + 'static {
    /// Authenticated handle produced by a successful login.
    type Handle: Send + Sync + 'static;

    /// Establish a fresh session. Implementations read their own credential
    /// store and must return [`SessionError::NotConfigured`] without touching
    /// the network when no credentials are present.
    async fn login(&self) -> Result<Self::Handle, SessionError>;

    /// Best-effort teardown. Failures are swallowed by implementations.
    async fn logout(&self, handle: Arc<Self::Handle>);

    /// Hard expiry of the handle, when the provider communicates one.
    fn expires_at(&self, _handle: &Self::Handle) -> Option<DateTime<Utc>> {
        None
    }
}

/// Connection state, serialized into status endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Point-in-time view of a manager, for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Seconds since the session was established. `None` unless connected.
    pub connected_secs: Option<u64>,
    /// Cause of the most recent failure. `None` unless state is `error`.
    pub last_error: Option<String>,
}

/// Tunables for one manager instance.
#[derive(Debug, Clone, Copy)]
pub struct SessionPolicy {
    pub retry: RetryPolicy,
    /// A `Connected` session older than this is stale and reconnected on the
    /// next `ensure_session()`, independent of any explicit expiry.
    pub stale_after: Duration,
    /// Upper bound on a single login call, so a hung remote cannot wedge the
    /// attempt (and with it, shutdown).
    pub login_timeout: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            stale_after: Duration::from_secs(30 * 60),
            login_timeout: Duration::from_secs(30),
        }
    }
}

type Outcome = Result<(), SessionError>;

struct Inner<H> {
    state: SessionState,
    handle: Option<Arc<H>>,
    connected_at: Option<Instant>,
    last_error: Option<SessionError>,
    /// Present while an attempt is in flight; joiners await it.
    pending: Option<watch::Receiver<Option<Outcome>>>,
    /// Bumped by `invalidate()`. An attempt that finishes under an older
    /// epoch must not install its result.
    epoch: u64,
}

/// Owns and refreshes one external service's session.
pub struct SessionManager<C: SessionClient> {
    service: &'static str,
    client: Arc<C>,
    inner: Arc<Mutex<Inner<C::Handle>>>,
    policy: SessionPolicy,
}

// Derived Clone would require C: Clone; all clones share the same state.
impl<C: SessionClient> Clone for SessionManager<C> {
    fn clone(&self) -> Self {
        Self {
            service: self.service,
            client: Arc::clone(&self.client),
            inner: Arc::clone(&self.inner),
            policy: self.policy,
        }
    }
}

enum Plan {
    /// Session is connected and fresh — nothing to do.
    Fresh,
    /// An attempt is already in flight; await its outcome.
    Join(watch::Receiver<Option<Outcome>>),
    /// This caller leads a new attempt.
    Lead(watch::Sender<Option<Outcome>>, u64),
    /// Terminal error latched until credentials change.
    Latched(SessionError),
}

impl<C: SessionClient> SessionManager<C> {
    pub fn new(service: &'static str, client: Arc<C>, policy: SessionPolicy) -> Self {
        Self {
            service,
            client,
            inner: Arc::new(Mutex::new(Inner {
                state: SessionState::Disconnected,
                handle: None,
                connected_at: None,
                last_error: None,
                pending: None,
                epoch: 0,
            })),
            policy,
        }
    }

    /// Make sure a live session exists, establishing one if necessary.
    ///
    /// Cheap no-op when connected and fresh. Joins the in-flight attempt when
    /// one exists. Otherwise runs a bounded-retry login and transitions to
    /// `Connected` or `Error`. A previously latched
    /// [`SessionError::InvalidCredentials`] is returned without contacting
    /// the remote until `invalidate()` (e.g. via new credentials) clears it.
    pub async fn ensure_session(&self) -> Result<(), SessionError> {
        let plan = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                SessionState::Connected if !self.is_stale(&inner) => Plan::Fresh,
                SessionState::Connecting => match inner.pending.clone() {
                    Some(rx) => Plan::Join(rx),
                    // Connecting without a pending handle cannot happen, but
                    // recovering by leading a new attempt is harmless.
                    None => self.lead(&mut inner),
                },
                SessionState::Error
                    if inner.last_error == Some(SessionError::InvalidCredentials) =>
                {
                    Plan::Latched(SessionError::InvalidCredentials)
                }
                _ => self.lead(&mut inner),
            }
        };

        match plan {
            Plan::Fresh => Ok(()),
            Plan::Latched(e) => Err(e),
            Plan::Join(mut rx) => loop {
                let settled = rx.borrow().clone();
                if let Some(outcome) = settled {
                    return outcome;
                }
                if rx.changed().await.is_err() {
                    return Err(SessionError::transient("login attempt abandoned"));
                }
            },
            Plan::Lead(tx, epoch) => self.run_attempt(tx, epoch).await,
        }
    }

    fn lead(&self, inner: &mut Inner<C::Handle>) -> Plan {
        let (tx, rx) = watch::channel(None);
        inner.state = SessionState::Connecting;
        inner.pending = Some(rx);
        Plan::Lead(tx, inner.epoch)
    }

    async fn run_attempt(&self, tx: watch::Sender<Option<Outcome>>, epoch: u64) -> Outcome {
        let result = retry_with_backoff(self.policy.retry, self.service, || {
            let client = Arc::clone(&self.client);
            let limit = self.policy.login_timeout;
            async move {
                match tokio::time::timeout(limit, client.login()).await {
                    Ok(res) => res,
                    Err(_) => Err(SessionError::transient("login timed out")),
                }
            }
        })
        .await;

        let outcome: Outcome = result.as_ref().map(|_| ()).map_err(Clone::clone);

        {
            let mut inner = self.inner.lock().await;
            if inner.epoch == epoch {
                inner.pending = None;
                match result {
                    Ok(handle) => {
                        inner.handle = Some(Arc::new(handle));
                        inner.connected_at = Some(Instant::now());
                        inner.state = SessionState::Connected;
                        inner.last_error = None;
                        info!("{}: session established", self.service);
                    }
                    Err(ref e) => {
                        inner.handle = None;
                        inner.connected_at = None;
                        inner.state = SessionState::Error;
                        inner.last_error = Some(e.clone());
                        warn!("{}: session attempt failed: {e}", self.service);
                    }
                }
                return self.settle(tx, outcome);
            }
        }

        // `invalidate()` ran while we were logging in; the caller tore the
        // session down on purpose, so the fresh handle must not survive.
        debug!("{}: discarding result of superseded login attempt", self.service);
        if let Ok(handle) = result {
            let client = Arc::clone(&self.client);
            tokio::spawn(async move { client.logout(Arc::new(handle)).await });
        }
        self.settle(tx, outcome)
    }

    fn settle(&self, tx: watch::Sender<Option<Outcome>>, outcome: Outcome) -> Outcome {
        let _ = tx.send(Some(outcome.clone()));
        outcome
    }

    /// Tear the session down: best-effort logout, then `Disconnected`.
    /// Idempotent. Any in-flight attempt is superseded.
    pub async fn invalidate(&self) {
        let handle = {
            let mut inner = self.inner.lock().await;
            inner.epoch += 1;
            inner.state = SessionState::Disconnected;
            inner.connected_at = None;
            inner.last_error = None;
            inner.pending = None;
            inner.handle.take()
        };
        if let Some(handle) = handle {
            self.client.logout(handle).await;
            debug!("{}: session invalidated", self.service);
        }
    }

    /// Install a handle produced out-of-band (e.g. an interactive device
    /// flow) as the current connected session.
    pub async fn adopt(&self, handle: C::Handle) {
        let mut inner = self.inner.lock().await;
        inner.epoch += 1;
        inner.pending = None;
        inner.handle = Some(Arc::new(handle));
        inner.connected_at = Some(Instant::now());
        inner.state = SessionState::Connected;
        inner.last_error = None;
        info!("{}: session adopted", self.service);
    }

    /// Current handle, if connected. Only the owning service facade calls
    /// this; handles never reach HTTP handlers.
    pub async fn session(&self) -> Option<Arc<C::Handle>> {
        let inner = self.inner.lock().await;
        match inner.state {
            SessionState::Connected => inner.handle.clone(),
            _ => None,
        }
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub async fn status(&self) -> SessionStatus {
        let inner = self.inner.lock().await;
        SessionStatus {
            state: inner.state,
            connected_secs: inner.connected_at.map(|t| t.elapsed().as_secs()),
            last_error: inner.last_error.as_ref().map(ToString::to_string),
        }
    }

    fn is_stale(&self, inner: &Inner<C::Handle>) -> bool {
        let aged_out = inner
            .connected_at
            .is_none_or(|t| t.elapsed() >= self.policy.stale_after);
        let expired = inner
            .handle
            .as_deref()
            .and_then(|h| self.client.expires_at(h))
            .is_some_and(|at| at <= Utc::now());
        aged_out || expired
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[derive(Clone, Copy)]
    enum Behavior {
        Ok,
        SlowOk(Duration),
        Transient,
        Invalid,
        NotConfigured,
    }

    struct StubClient {
        behavior: std::sync::Mutex<Behavior>,
        logins: AtomicU32,
        logouts: AtomicU32,
    }

    impl StubClient {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior: std::sync::Mutex::new(behavior),
                logins: AtomicU32::new(0),
                logouts: AtomicU32::new(0),
            })
        }

        fn set_behavior(&self, behavior: Behavior) {
            *self.behavior.lock().unwrap() = behavior;
        }

        fn login_count(&self) -> u32 {
            self.logins.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SessionClient for StubClient {
        type Handle = u32;

        async fn login(&self) -> Result<u32, SessionError> {
            let n = self.logins.fetch_add(1, Ordering::SeqCst);
            let behavior = *self.behavior.lock().unwrap();
            match behavior {
                Behavior::Ok => Ok(n),
                Behavior::SlowOk(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(n)
                }
                Behavior::Transient => Err(SessionError::transient("link down")),
                Behavior::Invalid => Err(SessionError::InvalidCredentials),
                Behavior::NotConfigured => Err(SessionError::NotConfigured),
            }
        }

        async fn logout(&self, _handle: Arc<u32>) {
            self.logouts.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn manager(client: &Arc<StubClient>) -> SessionManager<StubClient> {
        SessionManager::new("stub", Arc::clone(client), SessionPolicy::default())
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_login() {
        let client = StubClient::new(Behavior::SlowOk(Duration::from_millis(100)));
        let mgr = manager(&client);

        let a = mgr.clone();
        let b = mgr.clone();
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.ensure_session().await }),
            tokio::spawn(async move { b.ensure_session().await }),
        );

        assert_eq!(ra.unwrap(), Ok(()));
        assert_eq!(rb.unwrap(), Ok(()));
        assert_eq!(client.login_count(), 1);
        assert_eq!(mgr.state().await, SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_exhaust_three_attempts_with_backoff() {
        let client = StubClient::new(Behavior::Transient);
        let mgr = manager(&client);
        let begin = tokio::time::Instant::now();

        let result = mgr.ensure_session().await;

        assert_eq!(result, Err(SessionError::transient("link down")));
        assert_eq!(client.login_count(), 3);
        assert!(begin.elapsed() >= Duration::from_secs(3));
        assert_eq!(mgr.state().await, SessionState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_credentials_are_not_retried_and_latch() {
        let client = StubClient::new(Behavior::Invalid);
        let mgr = manager(&client);

        assert_eq!(
            mgr.ensure_session().await,
            Err(SessionError::InvalidCredentials)
        );
        assert_eq!(client.login_count(), 1);

        // Latched: further calls do not touch the client.
        assert_eq!(
            mgr.ensure_session().await,
            Err(SessionError::InvalidCredentials)
        );
        assert_eq!(client.login_count(), 1);

        // New credentials clear the latch via invalidate().
        client.set_behavior(Behavior::Ok);
        mgr.invalidate().await;
        assert_eq!(mgr.ensure_session().await, Ok(()));
        assert_eq!(client.login_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_credentials_short_circuit_without_latching() {
        let client = StubClient::new(Behavior::NotConfigured);
        let mgr = manager(&client);

        assert_eq!(mgr.ensure_session().await, Err(SessionError::NotConfigured));
        assert_eq!(mgr.state().await, SessionState::Error);

        // Once credentials appear the next call recovers on its own.
        client.set_behavior(Behavior::Ok);
        assert_eq!(mgr.ensure_session().await, Ok(()));
        assert_eq!(mgr.state().await, SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn connected_and_fresh_is_a_no_op() {
        let client = StubClient::new(Behavior::Ok);
        let mgr = manager(&client);

        assert_eq!(mgr.ensure_session().await, Ok(()));
        assert_eq!(mgr.ensure_session().await, Ok(()));
        assert_eq!(client.login_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_session_is_reconnected() {
        let client = StubClient::new(Behavior::Ok);
        let mgr = manager(&client);

        assert_eq!(mgr.ensure_session().await, Ok(()));
        tokio::time::advance(Duration::from_secs(31 * 60)).await;
        assert_eq!(mgr.ensure_session().await, Ok(()));
        assert_eq!(client.login_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_is_idempotent() {
        let client = StubClient::new(Behavior::Ok);
        let mgr = manager(&client);

        assert_eq!(mgr.ensure_session().await, Ok(()));
        mgr.invalidate().await;
        assert_eq!(mgr.state().await, SessionState::Disconnected);
        mgr.invalidate().await;
        assert_eq!(mgr.state().await, SessionState::Disconnected);
        // Only the first call had a handle to log out.
        assert_eq!(client.logouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_supersedes_in_flight_attempt() {
        let client = StubClient::new(Behavior::SlowOk(Duration::from_secs(5)));
        let mgr = manager(&client);

        let racing = mgr.clone();
        let attempt = tokio::spawn(async move { racing.ensure_session().await });
        // Let the attempt reach its in-flight sleep before tearing down.
        tokio::time::sleep(Duration::from_secs(1)).await;
        mgr.invalidate().await;

        let _ = attempt.await.unwrap();
        assert_eq!(mgr.state().await, SessionState::Disconnected);
        assert!(mgr.session().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn adopted_handle_becomes_the_session() {
        let client = StubClient::new(Behavior::Transient);
        let mgr = manager(&client);

        mgr.adopt(7).await;
        assert_eq!(mgr.state().await, SessionState::Connected);
        assert_eq!(mgr.session().await.as_deref(), Some(&7));
        assert_eq!(client.login_count(), 0);
    }
}
