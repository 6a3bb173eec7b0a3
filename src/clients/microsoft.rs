//! Microsoft identity/mail provider adapter.
//!
//! Implements the OAuth 2.0 device-code grant against the configured
//! authority: the clock displays a user code, the user authorizes in a
//! browser elsewhere, and the backend polls the token endpoint. Once an
//! account is linked, its refresh token is used for silent renewal — that
//! silent renewal *is* this service's login. Mail comes from Microsoft
//! Graph with the resulting bearer token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::MailToken;
use crate::config::MicrosoftConfig;
use crate::credentials::{CredentialSlot, MicrosoftAccount};
use crate::errors::SessionError;
use crate::session::SessionClient;

/// A device-code flow waiting for the user to authorize.
#[derive(Debug, Clone)]
pub struct DeviceFlow {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    /// Human-readable instructions from the authority, shown on the clock.
    pub message: String,
    pub interval_secs: u64,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of one poll step of a device-code flow.
#[derive(Debug, Clone)]
pub enum DevicePoll {
    Pending { interval_secs: u64 },
    SlowDown { interval_secs: u64 },
    Authorized(MailToken),
    Declined,
    Expired,
}

/// One mail message pulled from Graph.
#[derive(Debug, Clone, Serialize)]
pub struct EmailMessage {
    pub subject: String,
    pub from_email: String,
    pub received_date: String,
    pub body: String,
}

/// What the microsoft service facade needs from its provider.
#[async_trait]
pub trait IdentityProvider: SessionClient<Handle = MailToken> {
    async fn start_device_flow(&self) -> Result<DeviceFlow, SessionError>;
    async fn poll_device_flow(&self, flow: &DeviceFlow) -> Result<DevicePoll, SessionError>;
    async fn fetch_messages(&self, token: &MailToken) -> Result<Vec<EmailMessage>, SessionError>;
}

// ── Wire types ───────────────────────────────────────────────────────

#[derive(Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    expires_in: u64,
    interval: Option<u64>,
    message: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: u64,
    id_token: Option<String>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

#[derive(Deserialize)]
struct GraphMessageList {
    #[serde(default)]
    value: Vec<GraphMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    subject: Option<String>,
    from: Option<GraphRecipient>,
    received_date_time: Option<String>,
    body_preview: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphRecipient {
    email_address: Option<GraphEmailAddress>,
}

#[derive(Deserialize)]
struct GraphEmailAddress {
    address: Option<String>,
}

// ── Parsers ──────────────────────────────────────────────────────────

/// Pull `preferred_username` out of an id token payload. The claims are
/// display-only here (account labeling), so the signature is not verified.
fn username_from_id_token(id_token: &str) -> Option<String> {
    let payload = id_token.split('.').nth(1)?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    claims
        .get("preferred_username")
        .and_then(|v| v.as_str())
        .map(String::from)
}

/// Map a token-endpoint error (outside the device-flow pending states) onto
/// the session error taxonomy. `invalid_grant` means the refresh token is
/// dead and the user has to link the account again.
fn classify_token_error(error: &str, description: Option<&str>) -> SessionError {
    match error {
        "invalid_grant" | "interaction_required" | "invalid_client" | "unauthorized_client" => {
            SessionError::InvalidCredentials
        }
        _ => SessionError::transient(format!(
            "token endpoint error {error}: {}",
            description.unwrap_or("")
        )),
    }
}

fn transport_error(e: &reqwest::Error) -> SessionError {
    if e.is_timeout() {
        SessionError::transient("microsoft request timed out")
    } else {
        SessionError::transient(format!("microsoft request failed: {e}"))
    }
}

fn message_from_graph(raw: GraphMessage) -> EmailMessage {
    EmailMessage {
        subject: raw.subject.unwrap_or_default(),
        from_email: raw
            .from
            .and_then(|f| f.email_address)
            .and_then(|a| a.address)
            .unwrap_or_default(),
        received_date: raw.received_date_time.unwrap_or_default(),
        body: raw.body_preview.unwrap_or_default(),
    }
}

// ── Client ───────────────────────────────────────────────────────────

/// HTTP implementation of the identity provider.
pub struct GraphIdentityClient {
    http: reqwest::Client,
    settings: MicrosoftConfig,
    account: Arc<CredentialSlot<MicrosoftAccount>>,
}

impl GraphIdentityClient {
    pub fn new(settings: MicrosoftConfig, account: Arc<CredentialSlot<MicrosoftAccount>>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .expect("build microsoft http client");
        Self {
            http,
            settings,
            account,
        }
    }

    /// Scope string for token requests. `offline_access` is required for a
    /// refresh token to come back at all.
    fn scope(&self) -> String {
        let mut scopes = self.settings.scopes.clone();
        if !scopes.iter().any(|s| s == "offline_access") {
            scopes.push("offline_access".to_string());
        }
        scopes.join(" ")
    }

    fn token_url(&self) -> String {
        format!("{}/oauth2/v2.0/token", self.settings.authority)
    }

    /// Turn a successful token response into a [`MailToken`] and persist the
    /// rotated refresh token into the account store.
    async fn store_token(&self, response: TokenResponse, fallback_account: Option<String>) -> MailToken {
        let account = response
            .id_token
            .as_deref()
            .and_then(username_from_id_token)
            .or(fallback_account)
            .unwrap_or_else(|| "microsoft account".to_string());

        if let Some(refresh_token) = response.refresh_token {
            self.account
                .set(MicrosoftAccount {
                    account: account.clone(),
                    refresh_token,
                })
                .await;
        }

        // Renew a minute before the advertised expiry to absorb clock skew.
        let lifetime = response.expires_in.saturating_sub(60);
        MailToken {
            access_token: response.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(lifetime as i64),
            account,
        }
    }
}

#[async_trait]
impl SessionClient for GraphIdentityClient {
    type Handle = MailToken;

    /// Silent renewal using the stored refresh token. No linked account
    /// means not configured — the device flow is the way in.
    async fn login(&self) -> Result<MailToken, SessionError> {
        if self.settings.client_id.is_empty() {
            return Err(SessionError::NotConfigured);
        }
        let Some(stored) = self.account.get().await else {
            return Err(SessionError::NotConfigured);
        };

        let scope = self.scope();
        let response = self
            .http
            .post(self.token_url())
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.settings.client_id.as_str()),
                ("scope", scope.as_str()),
                ("refresh_token", stored.refresh_token.as_str()),
            ])
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        if response.status().is_success() {
            let token: TokenResponse = response.json().await.map_err(|e| transport_error(&e))?;
            let mail_token = self.store_token(token, Some(stored.account)).await;
            info!(account = %mail_token.account, "microsoft token refreshed");
            Ok(mail_token)
        } else if response.status().is_server_error() {
            Err(SessionError::transient(format!(
                "token endpoint status {}",
                response.status()
            )))
        } else {
            let err: TokenErrorResponse =
                response.json().await.map_err(|e| transport_error(&e))?;
            warn!("microsoft token refresh rejected: {}", err.error);
            Err(classify_token_error(
                &err.error,
                err.error_description.as_deref(),
            ))
        }
    }

    /// The v2 endpoint offers no token revocation for public clients; the
    /// facade clears the stored account instead.
    async fn logout(&self, handle: Arc<MailToken>) {
        debug!(account = %handle.account, "dropping microsoft token");
    }

    fn expires_at(&self, handle: &MailToken) -> Option<DateTime<Utc>> {
        Some(handle.expires_at)
    }
}

#[async_trait]
impl IdentityProvider for GraphIdentityClient {
    async fn start_device_flow(&self) -> Result<DeviceFlow, SessionError> {
        if self.settings.client_id.is_empty() {
            return Err(SessionError::NotConfigured);
        }
        let response = self
            .http
            .post(format!("{}/oauth2/v2.0/devicecode", self.settings.authority))
            .form(&[
                ("client_id", self.settings.client_id.as_str()),
                ("scope", self.scope().as_str()),
            ])
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        if !response.status().is_success() {
            if response.status().is_server_error() {
                return Err(SessionError::transient(format!(
                    "devicecode endpoint status {}",
                    response.status()
                )));
            }
            let err: TokenErrorResponse =
                response.json().await.map_err(|e| transport_error(&e))?;
            return Err(classify_token_error(
                &err.error,
                err.error_description.as_deref(),
            ));
        }

        let DeviceCodeResponse {
            device_code,
            user_code,
            verification_uri,
            expires_in,
            interval,
            message,
        } = response.json().await.map_err(|e| transport_error(&e))?;
        info!(user_code = %user_code, "device flow started");
        let message = message.unwrap_or_else(|| {
            format!("To sign in, open {verification_uri} and enter the code {user_code}.")
        });
        Ok(DeviceFlow {
            device_code,
            user_code,
            verification_uri,
            message,
            interval_secs: interval.unwrap_or(5),
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in as i64),
        })
    }

    async fn poll_device_flow(&self, flow: &DeviceFlow) -> Result<DevicePoll, SessionError> {
        if flow.expires_at <= Utc::now() {
            return Ok(DevicePoll::Expired);
        }

        let response = self
            .http
            .post(self.token_url())
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
                ("client_id", self.settings.client_id.as_str()),
                ("device_code", flow.device_code.as_str()),
            ])
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        if response.status().is_success() {
            let token: TokenResponse = response.json().await.map_err(|e| transport_error(&e))?;
            let mail_token = self.store_token(token, None).await;
            info!(account = %mail_token.account, "device flow authorized");
            return Ok(DevicePoll::Authorized(mail_token));
        }
        if response.status().is_server_error() {
            return Err(SessionError::transient(format!(
                "token endpoint status {}",
                response.status()
            )));
        }

        let err: TokenErrorResponse = response.json().await.map_err(|e| transport_error(&e))?;
        match err.error.as_str() {
            "authorization_pending" => Ok(DevicePoll::Pending {
                interval_secs: flow.interval_secs,
            }),
            "slow_down" => Ok(DevicePoll::SlowDown {
                interval_secs: flow.interval_secs + 5,
            }),
            "authorization_declined" => Ok(DevicePoll::Declined),
            "expired_token" => Ok(DevicePoll::Expired),
            other => Err(classify_token_error(other, err.error_description.as_deref())),
        }
    }

    async fn fetch_messages(&self, token: &MailToken) -> Result<Vec<EmailMessage>, SessionError> {
        let response = self
            .http
            .get(format!(
                "{}/me/messages?$top=10&$select=subject,from,receivedDateTime,bodyPreview",
                self.settings.graph_endpoint
            ))
            .bearer_auth(&token.access_token)
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        match response.status() {
            s if s.is_success() => {
                let list: GraphMessageList =
                    response.json().await.map_err(|e| transport_error(&e))?;
                Ok(list.value.into_iter().map(message_from_graph).collect())
            }
            reqwest::StatusCode::UNAUTHORIZED => Err(SessionError::Expired),
            s => Err(SessionError::transient(format!("graph status {s}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_username_from_id_token() {
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(
            serde_json::json!({"preferred_username": "student@school.at", "aud": "x"}).to_string(),
        );
        let token = format!("eyJhbGciOiJub25lIn0.{payload}.sig");
        assert_eq!(
            username_from_id_token(&token).as_deref(),
            Some("student@school.at")
        );
    }

    #[test]
    fn test_username_from_garbage_token() {
        assert!(username_from_id_token("not-a-jwt").is_none());
        assert!(username_from_id_token("a.%%%.c").is_none());
    }

    #[test]
    fn test_token_error_classification() {
        assert_eq!(
            classify_token_error("invalid_grant", Some("AADSTS70008: expired")),
            SessionError::InvalidCredentials
        );
        assert_eq!(
            classify_token_error("invalid_client", None),
            SessionError::InvalidCredentials
        );
        assert!(matches!(
            classify_token_error("temporarily_unavailable", None),
            SessionError::Transient(_)
        ));
    }

    #[test]
    fn test_device_code_response_parses() {
        let raw: DeviceCodeResponse = serde_json::from_value(serde_json::json!({
            "device_code": "DAQABAAE…",
            "user_code": "HJB3KLMNP",
            "verification_uri": "https://microsoft.com/devicelogin",
            "expires_in": 900,
            "interval": 5,
            "message": "To sign in, use a web browser…",
        }))
        .unwrap();
        assert_eq!(raw.user_code, "HJB3KLMNP");
        assert_eq!(raw.interval, Some(5));
    }

    #[test]
    fn test_graph_message_mapping() {
        let raw: GraphMessage = serde_json::from_value(serde_json::json!({
            "subject": "Schulfest",
            "from": {"emailAddress": {"name": "Direktion", "address": "direktion@school.at"}},
            "receivedDateTime": "2026-02-02T09:00:00Z",
            "bodyPreview": "Liebe Schülerinnen und Schüler…",
        }))
        .unwrap();

        let msg = message_from_graph(raw);
        assert_eq!(msg.subject, "Schulfest");
        assert_eq!(msg.from_email, "direktion@school.at");
        assert_eq!(msg.received_date, "2026-02-02T09:00:00Z");
    }

    #[test]
    fn test_graph_message_with_missing_fields() {
        let raw: GraphMessage = serde_json::from_value(serde_json::json!({})).unwrap();
        let msg = message_from_graph(raw);
        assert_eq!(msg.subject, "");
        assert_eq!(msg.from_email, "");
    }
}
