//! # Voice Bridge Backend - Main Application Entry Point
//!
//! This is the main entry point for the voice-bridge-backend web server. It
//! bridges telephone calls (one WebSocket per call) into a conversational-AI
//! backend, paces synthesized replies back to the caller in real time, and
//! notifies an external application of each completed turn.
//!
//! ## Application Architecture:
//! - **config**: Application configuration (TOML files + environment variables)
//! - **state**: Shared application state and metrics
//! - **audio**: Frame splitting and real-time playback scheduling
//! - **conversation**: The session boundary to the AI backend
//! - **bridge**: Per-call orchestration and lifecycle
//! - **dispatch**: Fire-and-forget webhook delivery of turn results
//! - **websocket**: The call socket actor the telephony platform connects to
//! - **health**: System health monitoring endpoints
//! - **middleware**: Custom request processing (logging, metrics)
//! - **handlers**: HTTP request handlers for API endpoints
//! - **error**: Custom error types and HTTP error responses

mod audio;
mod bridge;
mod config;
mod conversation;
mod dispatch;
mod error;
mod handlers;
mod health;
mod middleware;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use audio::PlaybackScheduler;
use config::AppConfig;
use conversation::remote::RemoteSessionFactory;
use conversation::SessionFactory;
use dispatch::{TurnDispatcher, WebhookDispatcher};
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use websocket::CallRuntime;

/// Global shutdown signal, set by the signal handler task and polled by the
/// main select loop.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** for debugging and monitoring
/// 3. **Builds the call runtime** (playback scheduler, webhook dispatcher,
///    backend session factory) shared by every call
/// 4. **Configures the HTTP server** with middleware and routes
/// 5. **Handles graceful shutdown**, canceling in-flight playback jobs so no
///    delivery task outlives the server loop
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-bridge-backend v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{}, backend {}",
        config.server.host, config.server.port, config.backend.url
    );

    let app_state = AppState::new(config.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    // The call runtime is process-wide: one scheduler paces every call, one
    // dispatcher owns the outbound HTTP client, one factory opens backend
    // sessions.
    let scheduler = Arc::new(PlaybackScheduler::new(config.audio.frame_interval()));
    let dispatcher: Arc<dyn TurnDispatcher> = Arc::new(WebhookDispatcher::new(
        Duration::from_secs(config.webhook.timeout_secs),
    )?);
    let factory: Arc<dyn SessionFactory> =
        Arc::new(RemoteSessionFactory::new(config.backend.url.clone()));
    let runtime = web::Data::new(CallRuntime {
        scheduler: Arc::clone(&scheduler),
        dispatcher,
        factory,
    });
    let scheduler_data = web::Data::from(Arc::clone(&scheduler));

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(runtime.clone())
            .app_data(scheduler_data.clone())
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            // The call socket the telephony platform dials
            .route("/socket", web::get().to(websocket::call_socket))
            // Management API
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            // Also provide health check at root level for convenience
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    // Any calls still up had their sockets closed by the server stopping;
    // their playback jobs must not keep ticking.
    scheduler.cancel_all();

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "info",
///   "voice_bridge_backend=debug")
/// - If not set, defaults to "voice_bridge_backend=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_bridge_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Set up signal handlers for graceful shutdown.
///
/// Listens for SIGTERM and SIGINT; whichever arrives first sets the global
/// shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Wait for the shutdown signal to be set, polling every 100 ms.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
