//! Shared application state passed to every handler via Axum's `State`
//! extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::cache::DataCache;
use crate::clock::ClockSettings;
use crate::config::Config;
use crate::services::{MicrosoftService, UntisService};

/// Shared application state for the clockd server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Last-known-good data from both services; read-only for handlers.
    pub cache: Arc<DataCache>,
    /// Timetable service facade (credentials, session, refresh).
    pub untis: Arc<UntisService>,
    /// Microsoft identity/mail service facade.
    pub microsoft: Arc<MicrosoftService>,
    /// Runtime-mutable clock device settings.
    pub clock: Arc<ClockSettings>,
}
