//! Per-service facades wiring credential store, session manager, and cache.
//!
//! Everything that mutates a service's session or credentials goes through
//! its facade — handlers and refresh loops never touch the session handle or
//! the credential slot directly, so there is exactly one code path that logs
//! in and one that logs out.

use std::sync::Arc;

use chrono::Local;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::cache::DataCache;
use crate::clients::microsoft::{
    DeviceFlow, DevicePoll, EmailMessage, GraphIdentityClient, IdentityProvider,
};
use crate::clients::untis::{HttpUntisClient, TimetableFetch};
use crate::credentials::{CredentialSlot, MicrosoftAccount, UntisCredentials};
use crate::errors::{SessionError, ValidationError};
use crate::session::{SessionManager, SessionPolicy, SessionStatus};

/// Timetable service: WebUntis credentials, session, and cached entries.
pub struct UntisService<P: TimetableFetch = HttpUntisClient> {
    creds: Arc<CredentialSlot<UntisCredentials>>,
    client: Arc<P>,
    pub manager: SessionManager<P>,
    cache: Arc<DataCache>,
    day_range: u32,
}

impl<P: TimetableFetch> UntisService<P> {
    pub fn new(
        creds: Arc<CredentialSlot<UntisCredentials>>,
        client: Arc<P>,
        cache: Arc<DataCache>,
        policy: SessionPolicy,
        day_range: u32,
    ) -> Self {
        Self {
            creds,
            manager: SessionManager::new("untis", Arc::clone(&client), policy),
            client,
            cache,
            day_range,
        }
    }

    /// Validate, persist, and immediately try the new credentials. The outer
    /// error is a validation rejection (nothing was stored, no network was
    /// touched); the inner result is the outcome of the session attempt.
    pub async fn set_credentials(
        &self,
        raw: UntisCredentials,
    ) -> Result<Result<(), SessionError>, ValidationError> {
        let creds = raw.normalized()?;
        info!(server = %creds.server, user = %creds.username, "storing untis credentials");
        self.creds.set(creds).await;
        // Drop any session built on the old secret before trying the new one.
        self.manager.invalidate().await;
        Ok(self.manager.ensure_session().await)
    }

    /// Remove credentials from memory and disk and tear the session down.
    pub async fn clear_credentials(&self) {
        self.creds.clear().await;
        self.manager.invalidate().await;
    }

    pub async fn login_name(&self) -> Option<String> {
        self.creds.get().await.map(|c| c.username)
    }

    /// One refresh-loop iteration: make sure the session is live, then pull
    /// the timetable window and holidays into the cache.
    pub async fn refresh_once(&self) -> Result<(), SessionError> {
        self.manager.ensure_session().await?;
        let Some(session) = self.manager.session().await else {
            return Err(SessionError::transient("session lost before fetch"));
        };

        let today = Local::now().date_naive();
        let end = today + chrono::Days::new(u64::from(self.day_range));
        match self.client.fetch_timetable(&session, today, end).await {
            Ok(entries) => {
                info!("untis: cached {} timetable entries", entries.len());
                self.cache.store_timetable(entries).await;
            }
            Err(SessionError::Expired) => {
                // Remote dropped the session; reconnect on the next tick.
                warn!("untis: session rejected by remote, invalidating");
                self.manager.invalidate().await;
                return Err(SessionError::Expired);
            }
            Err(e) => return Err(e),
        }

        // Holidays change rarely; a failure here must not discard the
        // timetable we just stored.
        match self.client.fetch_holidays(&session).await {
            Ok(holidays) => self.cache.store_holidays(holidays).await,
            Err(e) => warn!("untis: holiday fetch failed: {e}"),
        }
        Ok(())
    }

    pub async fn status(&self) -> SessionStatus {
        self.manager.status().await
    }
}

/// Microsoft service: device-flow linking, silent token refresh, mail.
pub struct MicrosoftService<P: IdentityProvider = GraphIdentityClient> {
    account: Arc<CredentialSlot<MicrosoftAccount>>,
    client: Arc<P>,
    pub manager: SessionManager<P>,
    cache: Arc<DataCache>,
    /// Device flow awaiting user authorization, if any.
    flow: Mutex<Option<DeviceFlow>>,
}

impl<P: IdentityProvider> MicrosoftService<P> {
    pub fn new(
        account: Arc<CredentialSlot<MicrosoftAccount>>,
        client: Arc<P>,
        cache: Arc<DataCache>,
        policy: SessionPolicy,
    ) -> Self {
        Self {
            account,
            manager: SessionManager::new("microsoft", Arc::clone(&client), policy),
            client,
            cache,
            flow: Mutex::new(None),
        }
    }

    /// Start a device-code flow, replacing any flow already in progress.
    pub async fn begin_login(&self) -> Result<DeviceFlow, SessionError> {
        let flow = self.client.start_device_flow().await?;
        *self.flow.lock().await = Some(flow.clone());
        Ok(flow)
    }

    /// Poll the pending device flow once. Returns `NotConfigured` when no
    /// flow is in progress.
    pub async fn poll_login(&self) -> Result<DevicePoll, SessionError> {
        let pending = self.flow.lock().await.clone();
        let Some(flow) = pending else {
            return Err(SessionError::NotConfigured);
        };

        let poll = self.client.poll_device_flow(&flow).await?;
        match &poll {
            DevicePoll::Authorized(token) => {
                *self.flow.lock().await = None;
                self.cache.store_mail_token(Some(token.clone())).await;
                self.manager.adopt(token.clone()).await;
            }
            DevicePoll::Declined | DevicePoll::Expired => {
                *self.flow.lock().await = None;
            }
            DevicePoll::Pending { .. } | DevicePoll::SlowDown { .. } => {}
        }
        Ok(poll)
    }

    /// Linked accounts (zero or one — the clock shows a single mailbox).
    pub async fn accounts(&self) -> Vec<String> {
        self.account
            .get()
            .await
            .map(|a| vec![a.account])
            .unwrap_or_default()
    }

    /// One refresh-loop iteration: silently renew the token if needed and
    /// mirror it into the cache.
    pub async fn refresh_once(&self) -> Result<(), SessionError> {
        self.manager.ensure_session().await?;
        if let Some(token) = self.manager.session().await {
            self.cache.store_mail_token(Some((*token).clone())).await;
        }
        Ok(())
    }

    /// Fetch the mailbox listing with the current token.
    pub async fn messages(&self) -> Result<Vec<EmailMessage>, SessionError> {
        self.manager.ensure_session().await?;
        let Some(token) = self.manager.session().await else {
            return Err(SessionError::transient("session lost before fetch"));
        };
        match self.client.fetch_messages(&token).await {
            Err(SessionError::Expired) => {
                warn!("microsoft: token rejected by graph, invalidating");
                self.manager.invalidate().await;
                Err(SessionError::Expired)
            }
            other => other,
        }
    }

    /// Unlink the account: forget the refresh token, drop the session and
    /// the cached mail token.
    pub async fn logout(&self) {
        *self.flow.lock().await = None;
        self.account.clear().await;
        self.manager.invalidate().await;
        self.cache.store_mail_token(None).await;
    }

    pub async fn status(&self) -> SessionStatus {
        self.manager.status().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::{NaiveDate, Utc};

    use super::*;
    use crate::cache::{HolidayEntry, MailToken, TimetableEntry};
    use crate::clients::untis::UntisSession;
    use crate::session::{SessionClient, SessionState};

    // ── Untis facade ────────────────────────────────────────────────

    struct StubTimetable {
        logins: AtomicU32,
        entries: Vec<TimetableEntry>,
    }

    impl StubTimetable {
        fn new(entries: Vec<TimetableEntry>) -> Arc<Self> {
            Arc::new(Self {
                logins: AtomicU32::new(0),
                entries,
            })
        }
    }

    #[async_trait]
    impl SessionClient for StubTimetable {
        type Handle = UntisSession;

        async fn login(&self) -> Result<UntisSession, SessionError> {
            self.logins.fetch_add(1, Ordering::SeqCst);
            Ok(UntisSession {
                session_id: "stub".to_string(),
                person_id: Some(1),
                person_type: Some(5),
            })
        }

        async fn logout(&self, _handle: Arc<UntisSession>) {}
    }

    #[async_trait]
    impl TimetableFetch for StubTimetable {
        async fn fetch_timetable(
            &self,
            _session: &UntisSession,
            _start: NaiveDate,
            _end: NaiveDate,
        ) -> Result<Vec<TimetableEntry>, SessionError> {
            Ok(self.entries.clone())
        }

        async fn fetch_holidays(
            &self,
            _session: &UntisSession,
        ) -> Result<Vec<HolidayEntry>, SessionError> {
            Ok(Vec::new())
        }
    }

    fn entry(subject: &str, start: &str) -> TimetableEntry {
        TimetableEntry {
            subject: subject.to_string(),
            start: start.parse().unwrap(),
            end: start.parse().unwrap(),
            room: String::new(),
            classes: Vec::new(),
        }
    }

    fn untis_service(client: Arc<StubTimetable>) -> (UntisService<StubTimetable>, Arc<DataCache>) {
        let dir = std::env::temp_dir().join(format!("clockd-test-{}", std::process::id()));
        let cache = Arc::new(DataCache::new());
        let creds = Arc::new(CredentialSlot::ephemeral(dir.join("untis.json")));
        let service = UntisService::new(
            creds,
            client,
            Arc::clone(&cache),
            SessionPolicy::default(),
            10,
        );
        (service, cache)
    }

    fn valid_creds() -> UntisCredentials {
        UntisCredentials {
            username: "40146720210116".to_string(),
            password: "x".to_string(),
            server: "arche.webuntis.com".to_string(),
            school: "litec".to_string(),
            user_agent: "OpenClock".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn set_credentials_connects_and_refresh_populates_cache() {
        let tomorrow = Local::now().date_naive() + chrono::Days::new(1);
        let start = format!("{tomorrow}T08:00:00");
        let client = StubTimetable::new(vec![
            entry("E", &format!("{tomorrow}T09:00:00")),
            entry("AM", &start),
        ]);
        let (service, cache) = untis_service(Arc::clone(&client));

        let outcome = service.set_credentials(valid_creds()).await.unwrap();
        assert_eq!(outcome, Ok(()));
        assert_eq!(service.manager.state().await, SessionState::Connected);

        service.refresh_once().await.unwrap();
        let subjects: Vec<String> = cache
            .timetable()
            .await
            .data
            .into_iter()
            .map(|e| e.subject)
            .collect();
        // Populated and sorted by start time.
        assert_eq!(subjects, ["AM", "E"]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_server_is_rejected_before_any_login() {
        let client = StubTimetable::new(Vec::new());
        let (service, _cache) = untis_service(Arc::clone(&client));

        let mut creds = valid_creds();
        creds.server = String::new();
        assert!(service.set_credentials(creds).await.is_err());
        assert_eq!(client.logins.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_connects_when_disconnected() {
        let client = StubTimetable::new(Vec::new());
        let (service, _cache) = untis_service(Arc::clone(&client));

        assert_eq!(service.manager.state().await, SessionState::Disconnected);
        service.refresh_once().await.unwrap();
        assert_eq!(client.logins.load(Ordering::SeqCst), 1);
        assert_eq!(service.manager.state().await, SessionState::Connected);

        // A second iteration reuses the fresh session.
        service.refresh_once().await.unwrap();
        assert_eq!(client.logins.load(Ordering::SeqCst), 1);
    }

    // ── Microsoft facade ────────────────────────────────────────────

    struct StubIdentity {
        refreshes: AtomicU32,
        authorized: std::sync::Mutex<bool>,
    }

    impl StubIdentity {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                refreshes: AtomicU32::new(0),
                authorized: std::sync::Mutex::new(false),
            })
        }

        fn token(tag: &str) -> MailToken {
            MailToken {
                access_token: tag.to_string(),
                expires_at: Utc::now() + chrono::Duration::seconds(3600),
                account: "student@school.at".to_string(),
            }
        }
    }

    #[async_trait]
    impl SessionClient for StubIdentity {
        type Handle = MailToken;

        async fn login(&self) -> Result<MailToken, SessionError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            if *self.authorized.lock().unwrap() {
                Ok(Self::token("refreshed"))
            } else {
                Err(SessionError::NotConfigured)
            }
        }

        async fn logout(&self, _handle: Arc<MailToken>) {}
    }

    #[async_trait]
    impl IdentityProvider for StubIdentity {
        async fn start_device_flow(&self) -> Result<DeviceFlow, SessionError> {
            Ok(DeviceFlow {
                device_code: "dev".to_string(),
                user_code: "HJB3KLMNP".to_string(),
                verification_uri: "https://microsoft.com/devicelogin".to_string(),
                message: "enter the code".to_string(),
                interval_secs: 5,
                expires_at: Utc::now() + chrono::Duration::seconds(900),
            })
        }

        async fn poll_device_flow(&self, _flow: &DeviceFlow) -> Result<DevicePoll, SessionError> {
            if *self.authorized.lock().unwrap() {
                Ok(DevicePoll::Authorized(Self::token("initial")))
            } else {
                Ok(DevicePoll::Pending { interval_secs: 5 })
            }
        }

        async fn fetch_messages(
            &self,
            _token: &MailToken,
        ) -> Result<Vec<EmailMessage>, SessionError> {
            Ok(Vec::new())
        }
    }

    fn microsoft_service(
        client: Arc<StubIdentity>,
    ) -> (MicrosoftService<StubIdentity>, Arc<DataCache>) {
        let dir = std::env::temp_dir().join(format!("clockd-test-ms-{}", std::process::id()));
        let cache = Arc::new(DataCache::new());
        let account = Arc::new(CredentialSlot::ephemeral(dir.join("ms.json")));
        let service =
            MicrosoftService::new(account, client, Arc::clone(&cache), SessionPolicy::default());
        (service, cache)
    }

    #[tokio::test(start_paused = true)]
    async fn device_flow_pending_then_authorized() {
        let client = StubIdentity::new();
        let (service, cache) = microsoft_service(Arc::clone(&client));

        service.begin_login().await.unwrap();
        assert!(matches!(
            service.poll_login().await.unwrap(),
            DevicePoll::Pending { .. }
        ));
        assert!(cache.mail_token().await.is_none());

        *client.authorized.lock().unwrap() = true;
        assert!(matches!(
            service.poll_login().await.unwrap(),
            DevicePoll::Authorized(_)
        ));
        assert_eq!(service.manager.state().await, SessionState::Connected);
        assert_eq!(
            cache.mail_token().await.map(|t| t.access_token),
            Some("initial".to_string())
        );

        // The adopted token is fresh — the next refresh does not re-login.
        service.refresh_once().await.unwrap();
        assert_eq!(client.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_without_flow_is_rejected() {
        let client = StubIdentity::new();
        let (service, _cache) = microsoft_service(client);
        assert!(matches!(
            service.poll_login().await,
            Err(SessionError::NotConfigured)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn logout_clears_token_and_session() {
        let client = StubIdentity::new();
        let (service, cache) = microsoft_service(Arc::clone(&client));

        service.begin_login().await.unwrap();
        *client.authorized.lock().unwrap() = true;
        service.poll_login().await.unwrap();

        service.logout().await;
        assert_eq!(service.manager.state().await, SessionState::Disconnected);
        assert!(cache.mail_token().await.is_none());
        assert!(service.accounts().await.is_empty());
    }
}
