//! Session Controller
//!
//! Admission and lifecycle engine for marketplace sessions.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Connect the aggregate store (Redis, or in-memory for local runs)
//! 4. Build recording / dispatcher clients and the event bus
//! 5. Initialize actor system (`SessionControllerHandle`)
//! 6. Start HTTP server (API, probes, metrics)
//! 7. Wait for shutdown signal, then drain actors

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use secrecy::ExposeSecret;
use session_controller::actors::{ActorMetrics, SessionControllerHandle};
use session_controller::clock::SystemClock;
use session_controller::config::{Config, StoreBackend};
use session_controller::engine::{EngineConfig, EngineDeps, SessionEngine};
use session_controller::observability::{init_metrics_recorder, HealthState};
use session_controller::routes::{self, AppState};
use session_controller::services::{
    DispatcherClient, EventPublisher, LogOnlyEventBus, Notifier, RecordingClient, RedisEventBus,
};
use session_controller::store::{
    self, AggregateStore, InMemorySequence, InMemoryStore, RedisSequence, RedisStore,
    SequenceGenerator,
};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Stores, sequence and event sinks for the selected backend.
struct Backend {
    store: Arc<dyn AggregateStore>,
    sequence: Arc<dyn SequenceGenerator>,
    publisher: Arc<dyn EventPublisher>,
    notifier: Arc<dyn Notifier>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "session_controller=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Session Controller");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        sc_id = %config.sc_id,
        bind_address = %config.bind_address,
        store_backend = ?config.store_backend,
        commit_max_attempts = config.commit_max_attempts,
        min_session_seconds = config.min_session_seconds,
        min_balance_minutes = config.min_balance_minutes,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        format!("Failed to install Prometheus metrics recorder: {e}")
    })?;

    let health_state = Arc::new(HealthState::new());

    let backend = connect_backend(&config).await?;

    let timeout = Duration::from_secs(config.external_timeout_seconds);
    let recording = RecordingClient::new(
        config.recording_api_url.clone(),
        config.recording_api_key.clone(),
        timeout,
    )?;
    let dispatcher = DispatcherClient::new(config.dispatcher_url.clone(), timeout)?;

    let engine = Arc::new(SessionEngine::new(
        EngineDeps {
            store: backend.store,
            sequence: backend.sequence,
            recording: Arc::new(recording),
            dispatcher: Arc::new(dispatcher),
            publisher: backend.publisher,
            notifier: backend.notifier,
            clock: Arc::new(SystemClock),
        },
        EngineConfig::from(&config),
    ));

    let actor_metrics = ActorMetrics::new();
    let controller = SessionControllerHandle::new(
        config.sc_id.clone(),
        Arc::clone(&engine),
        Arc::clone(&actor_metrics),
    );
    info!(sc_id = %config.sc_id, "Actor system initialized");

    let state = Arc::new(AppState {
        controller: controller.clone(),
        engine,
    });
    let app = routes::build_routes(state, Arc::clone(&health_state), prometheus_handle);

    let addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!("Invalid bind address: {}", e);
        e
    })?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    health_state.set_ready();
    info!("Session Controller listening on {}", addr);

    let shutdown_health = Arc::clone(&health_state);
    let shutdown_controller = controller.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown signal received, draining");
            shutdown_health.set_not_ready();
            if let Err(e) = shutdown_controller.shutdown().await {
                warn!(error = %e, "Controller shutdown request failed");
            }
        })
        .await?;

    info!(
        messages_processed = actor_metrics.messages_processed(),
        "Session Controller shutdown complete"
    );

    Ok(())
}

async fn connect_backend(config: &Config) -> Result<Backend, Box<dyn std::error::Error>> {
    match config.store_backend {
        StoreBackend::Memory => {
            warn!("Using in-memory store; state will not survive a restart");
            let bus = Arc::new(LogOnlyEventBus);
            Ok(Backend {
                store: Arc::new(InMemoryStore::new()),
                sequence: Arc::new(InMemorySequence::new()),
                publisher: bus.clone(),
                notifier: bus,
            })
        }
        StoreBackend::Redis => {
            let redis_url = config
                .redis_url
                .as_ref()
                .ok_or("REDIS_URL is required for the redis store backend")?;

            info!("Connecting to Redis...");
            let connection = store::redis::connect(redis_url.expose_secret()).await?;
            info!("Redis connection established");

            let bus = Arc::new(RedisEventBus::new(connection.clone()));
            Ok(Backend {
                store: Arc::new(RedisStore::new(connection.clone())),
                sequence: Arc::new(RedisSequence::new(connection)),
                publisher: bus.clone(),
                notifier: bus,
            })
        }
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
