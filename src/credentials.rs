//! File-backed per-service credential stores.
//!
//! Each external service keeps its secrets in its own JSON file under the
//! data directory — never mixed. A malformed or missing file loads as "not
//! configured" with a warning; startup must survive any on-disk state.
//! Persistence failures are logged and the store keeps working from memory.

use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::errors::ValidationError;

/// WebUntis account secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UntisCredentials {
    pub username: String,
    pub password: String,
    /// Host of the WebUntis server, e.g. `arche.webuntis.com`. Normalized by
    /// [`UntisCredentials::normalized`] before it is stored.
    pub server: String,
    pub school: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_user_agent() -> String {
    "OpenClock".to_string()
}

impl UntisCredentials {
    /// Validate required fields and normalize the server address. Runs
    /// before any network call — an empty field never reaches the remote.
    pub fn normalized(mut self) -> Result<Self, ValidationError> {
        if self.username.trim().is_empty() {
            return Err(ValidationError::MissingField("username"));
        }
        if self.password.is_empty() {
            return Err(ValidationError::MissingField("password"));
        }
        if self.school.trim().is_empty() {
            return Err(ValidationError::MissingField("school"));
        }
        if self.user_agent.trim().is_empty() {
            self.user_agent = default_user_agent();
        }
        self.server = normalize_server(&self.server)?;
        Ok(self)
    }
}

/// Reduce a user-entered server address to its bare host.
///
/// Accepts `https://arche.webuntis.com/WebUntis/`, `arche.webuntis.com/`,
/// etc. The client adds the scheme and `/WebUntis` path itself.
fn normalize_server(raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ValidationError::MissingField("server"));
    }
    // "string" is the swagger-ui placeholder; setups pasted it verbatim.
    if trimmed == "string" {
        return Err(ValidationError::InvalidServer(raw.to_string()));
    }
    let without_scheme = match trimmed.split_once("://") {
        Some((_, rest)) => rest,
        None => trimmed,
    };
    let host = without_scheme.split('/').next().unwrap_or("");
    if host.is_empty() {
        return Err(ValidationError::InvalidServer(raw.to_string()));
    }
    Ok(host.to_string())
}

/// Microsoft account material acquired through the device-code flow.
///
/// The client configuration (client id, authority, scopes) lives in the
/// static config; this is the per-account state that must survive restarts
/// so the token can be silently refreshed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicrosoftAccount {
    /// User principal name, for display and account listing.
    pub account: String,
    pub refresh_token: String,
}

/// JSON-file-backed slot holding one service's secrets.
pub struct CredentialSlot<T> {
    path: PathBuf,
    value: RwLock<Option<T>>,
}

impl<T: Serialize + DeserializeOwned + Clone + Send + Sync> CredentialSlot<T> {
    /// Load the slot from disk. Missing file means "not configured";
    /// malformed content is treated the same way, with a warning.
    pub async fn load(path: PathBuf) -> Self {
        let value = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str::<T>(&raw) {
                Ok(v) => {
                    info!("loaded credentials from {}", path.display());
                    Some(v)
                }
                Err(e) => {
                    warn!("ignoring malformed credential file {}: {e}", path.display());
                    None
                }
            },
            Err(_) => None,
        };
        Self {
            path,
            value: RwLock::new(value),
        }
    }

    /// In-memory-only slot, for tests.
    #[cfg(test)]
    pub fn ephemeral(path: PathBuf) -> Self {
        Self {
            path,
            value: RwLock::new(None),
        }
    }

    pub async fn get(&self) -> Option<T> {
        self.value.read().await.clone()
    }

    /// Store a value in memory and persist it immediately. A write failure
    /// degrades to in-memory-only operation; it never fails the caller.
    pub async fn set(&self, value: T) {
        let mut slot = self.value.write().await;
        match serde_json::to_vec_pretty(&value) {
            Ok(bytes) => {
                if let Some(parent) = self.path.parent() {
                    let _ = tokio::fs::create_dir_all(parent).await;
                }
                if let Err(e) = tokio::fs::write(&self.path, bytes).await {
                    warn!(
                        "failed to persist credentials to {}: {e}; continuing in-memory",
                        self.path.display()
                    );
                }
            }
            Err(e) => warn!("failed to serialize credentials: {e}"),
        }
        *slot = Some(value);
    }

    /// Drop the value from memory and disk.
    pub async fn clear(&self) {
        let mut slot = self.value.write().await;
        *slot = None;
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove {}: {e}", self.path.display());
            }
        }
    }
}
