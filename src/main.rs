//! # Voice Classifier Backend - Main Application Entry Point
//!
//! Real-time voice classification server. Clients stream raw PCM audio over a
//! WebSocket; every `chunk_trigger_count` chunks the session's audio is turned
//! into a log-mel spectrogram, run through a recurrent classifier and reported
//! back as a `{label, probability}` prediction.
//!
//! ## Application Architecture:
//! - **config**: Application configuration (TOML files + environment variables)
//! - **audio**: PCM decoding, session buffers, mel features and the session orchestrator
//! - **classifier**: Recurrent model loading, stateful inference engines and the decision function
//! - **device**: Compute device selection (CPU / CUDA / Metal)
//! - **state**: Shared application state and metrics
//! - **health**: Health and metrics endpoints
//! - **middleware**: Request logging and metrics collection
//! - **handlers**: Read-only introspection endpoints
//! - **websocket**: The streaming audio endpoint
//! - **error**: Error types and HTTP error responses

mod audio;
mod classifier;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod middleware;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpRequest, HttpServer};
use anyhow::{Context, Result};
use classifier::model::ClassifierModel;
use classifier::pool::EnginePool;
use crate::config::AppConfig;
use error::AppError;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once SIGTERM or SIGINT arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// The main application entry point.
///
/// ## Startup order:
/// 1. **Load and validate configuration**
/// 2. **Pick the compute device** from the configured preference
/// 3. **Load the classifier checkpoint**. A missing or incompatible checkpoint
///    stops the process here: the server never accepts a session without a model
/// 4. **Build the engine pool and shared state**
/// 5. **Serve HTTP + WebSocket** until a shutdown signal arrives
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-classifier-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let device = device::create_device_from_string(&config.model.device);
    let checkpoint_stem = config.model.checkpoint_stem();
    let model = ClassifierModel::load(config.model.to_model_spec(), &checkpoint_stem, device)
        .with_context(|| format!("Cannot start without a classifier model ({})", checkpoint_stem.display()))?;

    let engines = EnginePool::new(Arc::new(model), config.model.hidden_state)
        .context("Failed to initialise the inference engine")?;
    info!(
        "Hidden-state policy: {:?}, state shape {:?}",
        engines.policy(),
        engines.shared_handle().state_shape()
    );

    let app_state = AppState::new(config.clone(), engines);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);
    info!("Audio stream endpoint: ws://{}/ws/audio", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/model", web::get().to(handlers::get_model_info)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ws/audio", web::get().to(websocket::audio_websocket))
            .default_service(web::route().to(not_found))
    })
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
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

async fn not_found(req: HttpRequest) -> Result<&'static str, AppError> {
    Err(AppError::NotFound(format!("No route for {} {}", req.method(), req.path())))
}

/// Initialize tracing.
///
/// `RUST_LOG` controls filtering; the default is
/// `voice_classifier_backend=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_classifier_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Listen for SIGTERM / SIGINT and raise the shutdown flag.
fn setup_signal_handlers() {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async {
        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers, graceful shutdown disabled: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
