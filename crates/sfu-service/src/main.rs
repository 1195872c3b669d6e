//! SFU Service
//!
//! WebSocket signaling server in front of a pool of media workers.
//!
//! # Servers
//!
//! - WebSocket gateway for client signaling (default: 0.0.0.0:8080)
//! - HTTP server for health endpoints and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Select the media engine and start the worker pool
//! 4. Initialize the room registry actor
//! 5. Start health HTTP server (liveness, readiness, metrics)
//! 6. Start the WebSocket gateway
//! 7. Wait for a shutdown signal or a worker death

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use sfu_service::actors::{ActorMetrics, RoomRegistryHandle, RoomSettings, SessionSettings};
use sfu_service::auth::{JwtVerifier, TokenVerifier};
use sfu_service::config::{Config, MediaEngineKind};
use sfu_service::errors::SfuError;
use sfu_service::gateway::{gateway_router, GatewayState};
use sfu_service::media::local::LocalEngine;
use sfu_service::media::MediaEngine;
use sfu_service::observability::{health_router, init_metrics_recorder, HealthState};
use sfu_service::worker_pool::{WorkerPool, WorkerPoolSettings};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Bound on the registry's graceful shutdown.
const REGISTRY_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sfu_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting SFU service");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        bind_address = %config.bind_address,
        health_bind_address = %config.health_bind_address,
        media_engine = config.media_engine.as_str(),
        num_workers = config.num_workers,
        rtc_min_port = config.rtc_min_port,
        rtc_max_port = config.rtc_max_port,
        announced_ip = %config.announced_ip,
        "Configuration loaded successfully"
    );

    // Initialize Prometheus metrics recorder
    // This must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());

    // Root token: cancelled on shutdown signal or worker death
    let root_token = CancellationToken::new();

    // Start the worker pool (MUST succeed - no media without workers)
    let engine = select_engine(config.media_engine)?;
    info!(
        engine = engine.name(),
        num_workers = config.num_workers,
        "Starting media workers..."
    );
    let pool = WorkerPool::initialize(
        engine,
        config.num_workers,
        WorkerPoolSettings::from(&config),
        root_token.clone(),
    )
    .await
    .map_err(|e| {
        error!(error = %e, "Failed to start media workers");
        e
    })?;
    info!(workers = pool.worker_count(), "Media workers started");

    // Initialize actor system
    let actor_metrics = ActorMetrics::new();
    let registry = RoomRegistryHandle::new(
        Arc::clone(&pool),
        RoomSettings::from(&config),
        Arc::clone(&actor_metrics),
        root_token.child_token(),
    );
    info!("Room registry initialized");

    // Start health HTTP server (MUST succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let health_app = health_router(Arc::clone(&health_state)).merge(metrics_router);

    // Bind listener BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = root_token.child_token();
    let health_task = tokio::spawn(async move {
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });
    info!(addr = %health_addr, "Health server started");

    // Start WebSocket gateway
    let gateway_addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Invalid gateway bind address");
        format!("Invalid gateway bind address: {e}")
    })?;

    let verifier: Arc<dyn TokenVerifier> = Arc::new(JwtVerifier::new(&config.jwt_secret));
    let gateway_shutdown_token = root_token.child_token();
    let gateway_state = Arc::new(GatewayState {
        verifier,
        registry: registry.clone(),
        session_settings: SessionSettings::from(&config),
        metrics: Arc::clone(&actor_metrics),
        shutdown: gateway_shutdown_token.clone(),
        max_message_bytes: config.max_message_bytes,
    });

    let gateway_listener = tokio::net::TcpListener::bind(gateway_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %gateway_addr, "Failed to bind gateway");
            format!("Failed to bind gateway to {gateway_addr}: {e}")
        })?;

    let gateway_task = tokio::spawn(async move {
        let server = axum::serve(gateway_listener, gateway_router(gateway_state))
            .with_graceful_shutdown(async move {
                gateway_shutdown_token.cancelled().await;
                info!("Gateway shutting down");
            });
        if let Err(e) = server.await {
            error!(error = %e, "Gateway failed");
        }
    });
    info!(addr = %gateway_addr, "Gateway started");

    health_state.set_ready();
    info!("SFU service running - press Ctrl+C to shutdown");

    tokio::select! {
        () = shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown...");
        }
        () = root_token.cancelled() => {
            error!("Media worker died, shutting down");
        }
    }

    // Mark as not ready immediately so load balancers stop sending traffic
    health_state.set_not_ready();

    match tokio::time::timeout(REGISTRY_SHUTDOWN_TIMEOUT, registry.shutdown()).await {
        Ok(Ok(())) => info!("Room registry stopped"),
        Ok(Err(e)) => warn!(error = %e, "Room registry shutdown error"),
        Err(_) => warn!(
            timeout_secs = REGISTRY_SHUTDOWN_TIMEOUT.as_secs(),
            "Room registry shutdown timed out"
        ),
    }

    // Closes connections, the health server and the registry token tree
    root_token.cancel();
    pool.shutdown();

    let _ = tokio::time::timeout(Duration::from_secs(5), gateway_task).await;
    let _ = tokio::time::timeout(Duration::from_secs(2), health_task).await;

    if pool.worker_died() {
        error!("SFU service exiting after worker death");
        std::process::exit(1);
    }

    info!("SFU service shutdown complete");
    Ok(())
}

/// Build the configured media engine.
fn select_engine(kind: MediaEngineKind) -> Result<Arc<dyn MediaEngine>, SfuError> {
    match kind {
        MediaEngineKind::Local => Ok(Arc::new(LocalEngine::new())),
        #[cfg(feature = "mediasoup")]
        MediaEngineKind::Mediasoup => Ok(Arc::new(
            sfu_service::media::mediasoup::MediasoupEngine::new(),
        )),
        #[cfg(not(feature = "mediasoup"))]
        MediaEngineKind::Mediasoup => Err(SfuError::Config(
            "SFU_MEDIA_ENGINE=mediasoup requires the `mediasoup` feature".to_string(),
        )),
    }
}

/// Resolves on Ctrl+C or SIGTERM.
///
/// A handler that fails to install is logged and treated as never firing,
/// so the other signal (or a worker death) still stops the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
