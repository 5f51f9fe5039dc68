//! # Voice Bridge - Main Application Entry Point
//!
//! Real-time voice agent bridge: phone-call audio arrives over a WebSocket,
//! is streamed to a speech recognizer, final utterances are answered by a
//! language model and the answers are spoken back through speech synthesis.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, `config.toml`, environment)
//! - **state**: shared application state and voice counters
//! - **websocket**: the `/ws/voice` transport actor
//! - **session**: per-connection orchestration, registry, utterance handling
//! - **recognizer**: streaming speech recognition link
//! - **services**: agent/transcript/directive stores, language model, synthesis
//! - **transcript**: best-effort transcript logging
//! - **audio**: PCM format math and frame accumulation
//! - **health** / **handlers**: diagnostic HTTP endpoints
//! - **error**: session and HTTP error types

mod audio;
mod config;
mod error;
mod handlers;
mod health;
mod protocol;
mod recognizer;
mod services;
mod session;
mod state;
mod transcript;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use crate::config::AppConfig;
use services::Collaborators;
use state::AppState;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// ## What this does:
/// 1. Loads `.env`, initializes tracing and loads the layered configuration
/// 2. Builds the collaborator clients (HTTP or in-memory per store URL)
/// 3. Serves the call socket and the diagnostic API until SIGINT/SIGTERM
#[actix_web::main]
async fn main() -> Result<()> {
    // A missing `.env` is normal in production
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    if !config.recognizer_configured() {
        warn!("No speech recognizer API key configured; sessions will run without live transcription");
    }

    let services = Collaborators::from_config(&config)?;
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let app_state = AppState::new(config, services);

    info!("Starting HTTP server on {}", bind_addr);

    // The closure runs once per worker thread; each gets a clone of the state
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .route("/ws/voice", web::get().to(websocket::voice_websocket))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route("/sessions/{id}", web::get().to(handlers::get_session)),
            )
            // Unversioned alias for load balancer checks
            .route("/health", web::get().to(health::health_check))
    })
    // Signals are handled below so the shutdown is logged
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
            }
        }
        signal = wait_for_shutdown() => {
            if let Err(e) = signal {
                error!("Failed to listen for shutdown signals: {}", e);
            }
            info!("Shutdown signal received, stopping server...");
            // Graceful: workers finish in-flight requests first
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` controls verbosity; defaults to
/// `voice_bridge=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_bridge=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
#[cfg(unix)]
async fn wait_for_shutdown() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
