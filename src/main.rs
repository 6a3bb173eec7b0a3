#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! clockd entry point: configuration, wiring, router, graceful shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::HeaderValue;
use axum::{
    middleware,
    routing::{get, post},
    Extension, Router,
};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use clockd::auth::{self, ApiKey};
use clockd::cache::DataCache;
use clockd::clients::microsoft::GraphIdentityClient;
use clockd::clients::untis::HttpUntisClient;
use clockd::clock::ClockSettings;
use clockd::config::Config;
use clockd::credentials::CredentialSlot;
use clockd::lifecycle::Lifecycle;
use clockd::routes;
use clockd::services::{MicrosoftService, UntisService};
use clockd::session::SessionPolicy;
use clockd::state::AppState;

/// Smart clock backend.
#[derive(Parser)]
#[command(name = "clockd", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (default when no subcommand given).
    Serve,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Serve) | None => run_server(cli.config.as_deref()).await,
    }
}

async fn run_server(config_path: Option<&str>) {
    let config = Arc::new(Config::load(config_path));

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("clockd v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    info!("Data directory: {}", config.storage.data_dir);

    // Wire up services: credential slots feed clients, clients feed session
    // managers, refresh loops feed the cache.
    let cache = Arc::new(DataCache::new());

    let untis_creds = Arc::new(CredentialSlot::load(config.storage.untis_credentials_path()).await);
    let untis_timeout = Duration::from_secs(config.untis.request_timeout_secs);
    let untis_client = Arc::new(HttpUntisClient::new(Arc::clone(&untis_creds), untis_timeout));
    let untis = Arc::new(UntisService::new(
        untis_creds,
        untis_client,
        Arc::clone(&cache),
        SessionPolicy {
            login_timeout: untis_timeout,
            ..SessionPolicy::default()
        },
        config.untis.day_range,
    ));

    let ms_account =
        Arc::new(CredentialSlot::load(config.storage.microsoft_account_path()).await);
    let ms_client = Arc::new(GraphIdentityClient::new(
        config.microsoft.clone(),
        Arc::clone(&ms_account),
    ));
    let microsoft = Arc::new(MicrosoftService::new(
        ms_account,
        ms_client,
        Arc::clone(&cache),
        SessionPolicy {
            login_timeout: Duration::from_secs(config.microsoft.request_timeout_secs),
            ..SessionPolicy::default()
        },
    ));

    let clock = Arc::new(ClockSettings::load(config.storage.clock_settings_path()).await);

    let state = AppState {
        config: Arc::clone(&config),
        start_time: Instant::now(),
        cache,
        untis,
        microsoft,
        clock,
    };

    // Restore persisted cache and start the refresh loops.
    let lifecycle = Lifecycle::start(&state).await;

    // Build router
    let public_routes = Router::new().route("/api/health", get(routes::health::health));

    let authed_routes = Router::new()
        .route(
            "/api/untis/creds",
            post(routes::untis::set_creds).delete(routes::untis::clear_creds),
        )
        .route("/api/untis/timetable", get(routes::untis::timetable))
        .route("/api/untis/holidays", get(routes::untis::holidays))
        .route("/api/untis/current-lesson", get(routes::untis::current_lesson))
        .route("/api/untis/lessons-today", get(routes::untis::lessons_today))
        .route("/api/untis/lessons-week", get(routes::untis::lessons_week))
        .route("/api/untis/next-event", get(routes::untis::next_event))
        .route("/api/untis/status", get(routes::untis::status))
        .route("/api/untis/login-name", get(routes::untis::login_name))
        .route("/api/untis/logout", post(routes::untis::logout))
        .route("/api/microsoft/login", post(routes::microsoft::login))
        .route("/api/microsoft/poll", post(routes::microsoft::poll))
        .route("/api/microsoft/accounts", get(routes::microsoft::accounts))
        .route("/api/microsoft/messages", get(routes::microsoft::messages))
        .route("/api/microsoft/status", get(routes::microsoft::status))
        .route("/api/microsoft/logout", post(routes::microsoft::logout))
        .route(
            "/api/config",
            get(routes::config::get).put(routes::config::put),
        )
        .route("/api/config/debug", axum::routing::patch(routes::config::patch_debug))
        .route("/api/config/setup", axum::routing::patch(routes::config::patch_setup))
        .route(
            "/api/config/hostname",
            axum::routing::patch(routes::config::patch_hostname),
        )
        .route(
            "/api/config/timezone",
            axum::routing::patch(routes::config::patch_timezone),
        )
        .route("/api/config/reset", post(routes::config::reset))
        .route("/api/system/reboot", post(routes::system::reboot))
        .route("/api/system/shutdown", post(routes::system::shutdown))
        .route("/api/system/run", post(routes::system::run))
        .route("/api/system/logs", get(routes::system::logs))
        .layer(middleware::from_fn(auth::require_api_key));

    let app = Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .layer(Extension(ApiKey(config.auth.api_key.clone())))
        .layer(cors_layer(&config.server.cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // Drain loops and persist state.
    info!("Shutting down...");
    lifecycle.shutdown(&state).await;
    info!("Goodbye");
}

/// CORS for the setup/display web UIs.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("ignoring unparseable CORS origin {origin:?}");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
