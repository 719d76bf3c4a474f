//! # Neon Relay - Main Application Entry Point
//!
//! HTTP and WebSocket server for realtime voice calls against a conversational
//! audio endpoint, plus realtime chat rooms.
//!
//! ## Application Architecture:
//! - **config**: Application configuration (config.toml + `APP_*` environment variables)
//! - **state**: Shared application state, metrics, call registry and room store
//! - **health**: Health and metrics endpoints
//! - **middleware**: Request logging and per-route metrics
//! - **handlers**: REST handlers for config, rooms and calls
//! - **audio**: PCM conversion, capture framing, device seams and playback scheduling
//! - **call**: Call state machine, session lifecycle and the live endpoint transport
//! - **rooms**: Room message store with change subscriptions
//! - **gateway**: Browser-facing WebSocket actors for calls and rooms
//! - **error**: Error types and HTTP error responses

mod audio;
mod call;
mod config;
mod error;
mod gateway;
mod handlers;
mod health;
mod middleware;
mod rooms;
mod state;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use futures_util::future::join_all;
use state::AppState;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often ended calls are swept out of the registry.
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// The main application entry point.
///
/// 1. Loads configuration from files and environment variables
/// 2. Sets up logging
/// 3. Creates shared application state (call registry, room store, transport)
/// 4. Configures the HTTP server with middleware, REST routes and WebSocket routes
/// 5. On SIGINT/SIGTERM, stops the server and hangs up every live call
#[actix_web::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting neon-relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    info!(
        model = %config.call.model,
        voice = %config.call.voice,
        max_calls = config.performance.max_concurrent_calls,
        "Call settings"
    );
    if !config.call.has_api_key() {
        warn!("No API key configured; calls will fail until GEMINI_API_KEY is set");
    }

    let app_state = AppState::new(config.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    let pruner = spawn_registry_pruner(app_state.clone());

    info!("Starting HTTP server on {}", bind_addr);

    let server_state = app_state.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(server_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/rooms/{room}/messages", web::get().to(handlers::list_messages))
                    .route("/rooms/{room}/messages", web::post().to(handlers::post_message))
                    .route("/calls", web::get().to(handlers::list_calls))
                    .route("/calls/{id}", web::get().to(handlers::get_call))
                    .route("/calls/{id}", web::delete().to(handlers::end_call)),
            )
            .route("/ws/call", web::get().to(gateway::call_websocket))
            .route("/ws/rooms/{room}", web::get().to(gateway::room_websocket))
            .route("/health", web::get().to(health::health_check))
    })
    // Actix installs its own signal handling; shutdown is driven below instead
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        signal = wait_for_shutdown() => {
            match signal {
                Ok(name) => info!("Received {}, stopping server...", name),
                Err(e) => error!("Signal handling failed, stopping server: {}", e),
            }
            server_handle.stop(true).await;
        }
    }

    pruner.abort();
    end_all_calls(&app_state).await;

    info!("Server stopped gracefully");
    Ok(())
}

/// Structured logging to the console. `RUST_LOG` overrides the default filter.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "neon_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Resolves with the name of the first termination signal received.
async fn wait_for_shutdown() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sigint.recv() => Ok("SIGINT"),
    }
}

fn spawn_registry_pruner(state: AppState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PRUNE_INTERVAL);
        loop {
            interval.tick().await;
            let pruned = state.calls.prune_ended();
            if pruned > 0 {
                debug!(pruned, "Pruned ended calls from registry");
            }
        }
    })
}

async fn end_all_calls(state: &AppState) {
    let sessions = state.calls.sessions();
    if sessions.is_empty() {
        return;
    }

    info!(calls = ?state.calls.call_ids(), "Ending live calls");
    join_all(sessions.iter().map(|session| session.end())).await;
    for session in &sessions {
        state.calls.remove(session.id());
    }
}
