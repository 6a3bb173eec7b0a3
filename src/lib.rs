#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]

//! # clockd
//!
//! Backend for the OpenClock smart clock: aggregates the WebUntis school
//! timetable and a Microsoft mailbox behind one HTTP API on the device,
//! keeps both sessions alive in the background, and persists credentials
//! and settings across reboots.
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap, router setup, graceful shutdown
//! config.rs        — TOML + env-var configuration
//! auth.rs          — optional Bearer token middleware
//! errors.rs        — session error taxonomy shared by core and handlers
//! session/
//!   mod.rs         — SessionManager state machine, single-flight logins
//!   retry.rs       — the one retry-with-backoff combinator
//! clients/
//!   untis.rs       — WebUntis JSON-RPC adapter
//!   microsoft.rs   — device-code OAuth + Graph adapter
//! credentials.rs   — per-service file-backed secret slots
//! cache.rs         — last-known-good data, atomic wholesale replace
//! services.rs      — per-service facades (the only session mutators)
//! refresh.rs       — one cancellable background loop per service
//! lifecycle.rs     — startup restore, shutdown drain + snapshot
//! clock.rs         — runtime-mutable device settings (JSON)
//! system.rs        — reboot/hostname/timezone/log shims
//! routes/          — thin HTTP handlers over all of the above
//! ```

pub mod auth;
pub mod cache;
pub mod clients;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod errors;
pub mod lifecycle;
pub mod refresh;
pub mod routes;
pub mod services;
pub mod session;
pub mod state;
pub mod system;

// Re-export key types at crate root for convenience.
pub use auth::ApiKey;
pub use cache::DataCache;
pub use config::Config;
pub use errors::SessionError;
pub use session::{SessionManager, SessionState};
pub use state::AppState;
