//! Test server harness for E2E testing
//!
//! Provides `TestSfuServer` for spawning a real gateway, registry and worker
//! pool backed by the in-process media engine.

use crate::token_builders::TestTokenBuilder;
use secrecy::SecretString;
use sfu_service::actors::{ActorMetrics, RoomRegistryHandle, RoomSettings, SessionSettings};
use sfu_service::auth::JwtVerifier;
use sfu_service::gateway::{gateway_router, GatewayState};
use sfu_service::media::local::LocalEngine;
use sfu_service::worker_pool::{WorkerPool, WorkerPoolSettings};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// HS256 secret shared by the harness and its token helpers.
pub const TEST_JWT_SECRET: &str = "sfu-test-secret-at-least-32-bytes-long";

/// Default number of workers in the harness pool.
pub const TEST_WORKER_COUNT: usize = 2;

/// Test harness for spawning the SFU gateway in E2E tests.
///
/// # Example
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_join_e2e() -> anyhow::Result<()> {
///     let server = TestSfuServer::spawn().await?;
///     let mut client = SignalingClient::connect(&server.ws_url_for("alice")).await?;
///
///     client.send(json!({"type": "JOIN_ROOM", "roomId": "r1"})).await?;
///     client.recv_type("ROOM_JOINED").await?;
///     Ok(())
/// }
/// ```
pub struct TestSfuServer {
    addr: SocketAddr,
    engine: Arc<LocalEngine>,
    registry: RoomRegistryHandle,
    metrics: Arc<ActorMetrics>,
    root_token: CancellationToken,
    _handle: JoinHandle<()>,
}

impl TestSfuServer {
    /// Spawn a server with a fresh local engine and two workers.
    pub async fn spawn() -> Result<Self, anyhow::Error> {
        Self::spawn_with(Arc::new(LocalEngine::new()), TEST_WORKER_COUNT).await
    }

    /// Spawn a server over the given engine.
    ///
    /// The server will:
    /// - Start `workers` media workers on `engine`
    /// - Bind to a random available port (127.0.0.1:0)
    /// - Start the gateway in the background
    pub async fn spawn_with(
        engine: Arc<LocalEngine>,
        workers: usize,
    ) -> Result<Self, anyhow::Error> {
        let root_token = CancellationToken::new();

        let pool = WorkerPool::initialize(
            engine.clone(),
            workers,
            WorkerPoolSettings {
                death_grace: Duration::from_secs(2),
                usage_log_interval: Duration::from_secs(120),
            },
            root_token.clone(),
        )
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start worker pool: {}", e))?;

        let metrics = ActorMetrics::new();
        let registry = RoomRegistryHandle::new(
            pool,
            RoomSettings::default(),
            Arc::clone(&metrics),
            root_token.child_token(),
        );

        let state = Arc::new(GatewayState {
            verifier: Arc::new(JwtVerifier::new(&SecretString::from(
                TEST_JWT_SECRET.to_string(),
            ))),
            registry: registry.clone(),
            session_settings: SessionSettings::default(),
            metrics: Arc::clone(&metrics),
            shutdown: root_token.child_token(),
            max_message_bytes: 64 * 1024,
        });

        // Bind to random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let app = gateway_router(state);
        let shutdown = root_token.child_token();
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = server.await {
                eprintln!("Test server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            engine,
            registry,
            metrics,
            root_token,
            _handle: handle,
        })
    }

    /// WebSocket URL carrying `token`.
    pub fn ws_url(&self, token: &str) -> String {
        format!("ws://{}/ws?token={}", self.addr, token)
    }

    /// WebSocket URL with a valid token for `user_id`.
    pub fn ws_url_for(&self, user_id: &str) -> String {
        self.ws_url(&self.token_for(user_id, None))
    }

    /// WebSocket URL with no token.
    pub fn ws_url_without_token(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// A valid token for `user_id`, optionally with a display name.
    pub fn token_for(&self, user_id: &str, name: Option<&str>) -> String {
        let builder = TestTokenBuilder::new().for_user(user_id);
        let builder = match name {
            Some(name) => builder.with_name(name),
            None => builder,
        };
        builder.sign(TEST_JWT_SECRET)
    }

    /// Get the socket address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The engine backing the pool, for fault injection.
    pub fn engine(&self) -> &Arc<LocalEngine> {
        &self.engine
    }

    pub fn registry(&self) -> &RoomRegistryHandle {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<ActorMetrics> {
        &self.metrics
    }

    /// Number of rooms currently held by the registry.
    pub async fn room_count(&self) -> usize {
        self.registry
            .get_status()
            .await
            .map(|status| status.room_count)
            .unwrap_or(0)
    }

    /// Poll until the registry holds `expected` rooms or `timeout` passes.
    pub async fn wait_for_room_count(&self, expected: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.room_count().await == expected {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until `expected` sessions are live or `timeout` passes.
    pub async fn wait_for_session_count(&self, expected: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.metrics.session_count() == expected {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for TestSfuServer {
    fn drop(&mut self) {
        // Stop sessions, rooms and the server task immediately when the test
        // completes.
        self.root_token.cancel();
        self._handle.abort();
    }
}
