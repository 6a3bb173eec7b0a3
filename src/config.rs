//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `CLOCKD_API_KEY`, `CLOCKD_LISTEN`,
//!    `CLOCKD_DATA_DIR`
//! 2. **Config file** — path via `--config <path>`, or `clockd.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8000"
//! cors_origins = ["http://localhost:3000"]
//!
//! [auth]
//! api_key = ""            # empty = auth disabled (on-device UI)
//!
//! [storage]
//! data_dir = "/var/lib/clockd"
//!
//! [untis]
//! refresh_interval_secs = 60
//! day_range = 10
//! request_timeout_secs = 30
//!
//! [microsoft]
//! client_id = "..."
//! authority = "https://login.microsoftonline.com/<tenant>"
//! scopes = ["User.Read", "Mail.Read"]
//! refresh_interval_secs = 3600
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub untis: UntisConfig,
    #[serde(default)]
    pub microsoft: MicrosoftConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8000`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Origins allowed by the CORS layer. The clock's web UIs run on
    /// localhost during setup.
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared Bearer token for every `/api/*` route except health.
    /// Empty (the default) disables authentication entirely — the backend
    /// normally only listens on the clock itself.
    #[serde(default)]
    pub api_key: String,
}

/// Where persistent state lives.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory for credentials, cache snapshot, and clock settings.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl StorageConfig {
    pub fn untis_credentials_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("untis_credentials.json")
    }

    pub fn microsoft_account_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("microsoft_account.json")
    }

    pub fn cache_snapshot_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("cache_snapshot.json")
    }

    pub fn clock_settings_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("clock_settings.json")
    }
}

/// Timetable service settings.
#[derive(Debug, Clone, Deserialize)]
pub struct UntisConfig {
    /// Seconds between timetable refreshes (default 60).
    #[serde(default = "default_untis_refresh_interval")]
    pub refresh_interval_secs: u64,
    /// Days of timetable fetched per refresh (default 10).
    #[serde(default = "default_day_range")]
    pub day_range: u32,
    /// Upper bound on a single login or fetch call (default 30).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Microsoft identity/mail settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MicrosoftConfig {
    /// Azure AD application (client) id.
    #[serde(default = "default_ms_client_id")]
    pub client_id: String,
    /// Token authority, including tenant.
    #[serde(default = "default_ms_authority")]
    pub authority: String,
    /// Delegated scopes requested in the device flow.
    #[serde(default = "default_ms_scopes")]
    pub scopes: Vec<String>,
    /// Microsoft Graph base URL.
    #[serde(default = "default_graph_endpoint")]
    pub graph_endpoint: String,
    /// Seconds between silent token refreshes (default 3600).
    #[serde(default = "default_ms_refresh_interval")]
    pub refresh_interval_secs: u64,
    /// Upper bound on a single token or Graph call (default 30).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8000".to_string()
}
fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost".to_string(),
        "http://localhost:3000".to_string(),
        "http://localhost:8000".to_string(),
    ]
}
fn default_data_dir() -> String {
    "/var/lib/clockd".to_string()
}
fn default_untis_refresh_interval() -> u64 {
    60
}
fn default_day_range() -> u32 {
    10
}
fn default_request_timeout() -> u64 {
    30
}
fn default_ms_client_id() -> String {
    "cda7262c-6d80-4c31-adb6-5d9027364fa7".to_string()
}
fn default_ms_authority() -> String {
    "https://login.microsoftonline.com/076218b1-9f9c-4129-bbb0-337d5a8fe3e3".to_string()
}
fn default_ms_scopes() -> Vec<String> {
    vec!["User.Read".to_string(), "Mail.Read".to_string()]
}
fn default_graph_endpoint() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}
fn default_ms_refresh_interval() -> u64 {
    3600
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            cors_origins: default_cors_origins(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for UntisConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_untis_refresh_interval(),
            day_range: default_day_range(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for MicrosoftConfig {
    fn default() -> Self {
        Self {
            client_id: default_ms_client_id(),
            authority: default_ms_authority(),
            scopes: default_ms_scopes(),
            graph_endpoint: default_graph_endpoint(),
            refresh_interval_secs: default_ms_refresh_interval(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file >
    /// defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure — a config
    /// the operator named must not be silently ignored). Otherwise looks
    /// for `clockd.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("clockd.toml").exists() {
            let content =
                std::fs::read_to_string("clockd.toml").expect("Failed to read clockd.toml");
            toml::from_str(&content).expect("Failed to parse clockd.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(key) = std::env::var("CLOCKD_API_KEY") {
            config.auth.api_key = key;
        }
        if let Ok(listen) = std::env::var("CLOCKD_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(dir) = std::env::var("CLOCKD_DATA_DIR") {
            config.storage.data_dir = dir;
        }

        config
    }
}
