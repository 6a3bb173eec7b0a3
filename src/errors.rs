//! Error taxonomy shared by the session managers, provider adapters, and
//! HTTP handlers.
//!
//! Provider adapters classify every remote failure into a [`SessionError`]
//! variant at the client boundary; raw transport or protocol errors never
//! cross into the core.

use thiserror::Error;

/// Failures surfaced by session establishment and data refresh.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// No credentials configured for the service. Terminal until new
    /// credentials are stored.
    #[error("no credentials configured")]
    NotConfigured,
    /// The remote rejected the configured secret. Terminal — retrying with
    /// the same credentials risks account lockout.
    #[error("credentials rejected by remote service")]
    InvalidCredentials,
    /// The remote no longer accepts the current session. The owning manager
    /// drops the handle and reconnects on the next attempt.
    #[error("session expired or revoked")]
    Expired,
    /// Network failure, timeout, rate limit, or remote 5xx.
    #[error("transient remote error: {0}")]
    Transient(String),
}

impl SessionError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Whether the retry combinator may re-attempt after this failure.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Stable machine-readable kind, embedded in error responses.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotConfigured => "not_configured",
            Self::InvalidCredentials => "invalid_credentials",
            Self::Expired => "expired",
            Self::Transient(_) => "transient",
        }
    }
}

/// Rejections produced by credential validation, before any network I/O.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("server address `{0}` is not usable")]
    InvalidServer(String),
}
