//! `Server`: accepts sessions and wires them into the connection engine.
//!
//! In WebSocket mode an Axum router serves the upgrade endpoint alongside
//! `/health` and `/metrics`. In stream mode a plain TCP accept loop takes
//! its place.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use chrono::{DateTime, Utc};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::Mutex;
use tidewire_core::{FrameMode, MsgId, PacketCodec, ServerConfig};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::connection::{ConnId, Connection, ConnectionContext};
use crate::dispatcher::{DispatchOptions, Dispatcher};
use crate::errors::{RegistryError, ServerError};
use crate::health::{self, HealthInputs, HealthResponse};
use crate::heartbeat::run_liveness_monitor;
use crate::hooks::ServerHooks;
use crate::metrics::CONNECTIONS_REJECTED_TOTAL;
use crate::registry::{ConnectionRegistry, ConnectionTracker};
use crate::router::Router;
use crate::shutdown::ShutdownCoordinator;
use crate::transport::{Transport, stream_transport, websocket_transport};

/// Pause after a failed TCP accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A tidewire server.
pub struct Server {
    config: ServerConfig,
    codec: Arc<PacketCodec>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<ConnectionRegistry>,
    coordinator: ShutdownCoordinator,
    conn_ctx: ConnectionContext,
    next_conn_id: AtomicU64,
    start_time: Instant,
    started_at: DateTime<Utc>,
    metrics: OnceLock<PrometheusHandle>,
    /// Listener and liveness monitor, awaited by [`drain`](Self::drain).
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    /// Validate `config` and assemble the server. Nothing listens until
    /// [`listen`](Self::listen). With a worker pool configured this must run
    /// inside a Tokio runtime.
    pub fn new(config: ServerConfig, router: Router, hooks: ServerHooks) -> Result<Arc<Self>, ServerError> {
        config.validate()?;

        let codec = Arc::new(PacketCodec::new(config.max_payload_len));
        let dispatcher = Dispatcher::new(router, DispatchOptions::from(&config));
        let registry = Arc::new(ConnectionRegistry::with_codec(Arc::clone(&codec)));
        let coordinator = ShutdownCoordinator::new();
        let conn_ctx = ConnectionContext {
            codec: Arc::clone(&codec),
            dispatcher: Arc::clone(&dispatcher),
            tracker: Arc::clone(&registry) as Arc<dyn ConnectionTracker>,
            hooks: Arc::new(hooks),
            max_outbound_queue_len: config.max_outbound_queue_len,
            heartbeat_timeout: config.heartbeat_timeout(),
            shutdown: coordinator.token(),
        };

        Ok(Arc::new(Self {
            config,
            codec,
            dispatcher,
            registry,
            coordinator,
            conn_ctx,
            next_conn_id: AtomicU64::new(1),
            start_time: Instant::now(),
            started_at: Utc::now(),
            metrics: OnceLock::new(),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Serve `/metrics` from `handle`. Only the first call takes effect.
    pub fn set_metrics_handle(&self, handle: PrometheusHandle) -> bool {
        self.metrics.set(handle).is_ok()
    }

    /// The configuration the server was built with.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Frame codec shared by all connections.
    pub fn codec(&self) -> &Arc<PacketCodec> {
        &self.codec
    }

    /// Live connections.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Request dispatcher.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Look up a live connection.
    pub fn connection(&self, id: ConnId) -> Result<Arc<Connection>, RegistryError> {
        self.registry.get(id)
    }

    /// Queue a message on every live connection. See
    /// [`ConnectionRegistry::broadcast`].
    pub fn broadcast(&self, msg_id: MsgId, data: &[u8]) -> usize {
        self.registry.broadcast(msg_id, data)
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.coordinator.is_shutting_down()
    }

    /// Token cancelled on shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.coordinator.token()
    }

    /// Current `/health` body.
    pub fn health(&self) -> HealthResponse {
        health::health_check(HealthInputs {
            start_time: self.start_time,
            started_at: self.started_at,
            connections: self.registry.len(),
            workers: self.dispatcher.pool_size(),
            frame_mode: self.config.frame_mode,
            shutting_down: self.is_shutting_down(),
        })
    }

    /// Turn an accepted transport into a running, registered connection.
    pub fn accept(&self, transport: Transport) -> Result<Arc<Connection>, ServerError> {
        if self.is_shutting_down() {
            return Err(ServerError::ShuttingDown);
        }

        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn = Connection::new(id, transport, &self.conn_ctx);
        if self
            .registry
            .try_add(Arc::clone(&conn), self.config.max_connections)
            .is_err()
        {
            counter!(CONNECTIONS_REJECTED_TOTAL).increment(1);
            conn.stop();
            return Err(ServerError::TooManyConnections(self.config.max_connections));
        }

        conn.start();
        info!(conn_id = id, remote_addr = %conn.remote_addr(), "connection accepted");
        Ok(conn)
    }

    /// HTTP routes: the WebSocket endpoint, `/health` and `/metrics`.
    ///
    /// The upgrade handler reads the peer address from `ConnectInfo`, so
    /// serve it with `into_make_service_with_connect_info::<SocketAddr>()`.
    pub fn router(self: &Arc<Self>) -> axum::Router {
        axum::Router::new()
            .route(&self.config.ws_path, get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(self))
    }

    /// Bind and start serving in the background, along with the liveness
    /// monitor. Returns the bound address; [`drain`](Self::drain) waits for
    /// both tasks.
    pub async fn listen(self: &Arc<Self>) -> Result<SocketAddr, ServerError> {
        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let token = self.coordinator.token();

        let monitor = tokio::spawn({
            let registry = Arc::clone(&self.registry);
            let interval = self.config.heartbeat_check_interval();
            let cancel = self.coordinator.child_token();
            async move {
                let _ = run_liveness_monitor(registry, interval, cancel).await;
            }
        });

        let serving = match self.config.frame_mode {
            FrameMode::Websocket => {
                let app = self
                    .router()
                    .into_make_service_with_connect_info::<SocketAddr>();
                tokio::spawn(async move {
                    let serve = axum::serve(listener, app)
                        .with_graceful_shutdown(async move { token.cancelled().await });
                    if let Err(e) = serve.await {
                        error!(error = %e, "http server failed");
                    }
                })
            }
            FrameMode::Stream => tokio::spawn(Arc::clone(self).accept_loop(listener, token)),
        };

        info!(
            %local_addr,
            frame_mode = %self.config.frame_mode,
            workers = self.dispatcher.pool_size(),
            "tidewire server listening"
        );
        self.tasks.lock().extend([monitor, serving]);
        Ok(local_addr)
    }

    /// Stop accepting, stop every connection and close the worker pool.
    pub fn shutdown(&self) {
        self.coordinator.shutdown();
        let stopped = self.registry.clear_all();
        self.dispatcher.shutdown();
        info!(stopped, "server shut down");
    }

    /// [`shutdown`](Self::shutdown), then wait up to `timeout` (30 s when
    /// `None`) for the listener and liveness monitor to exit. Returns
    /// `false` if either was still running at the deadline.
    pub async fn drain(&self, timeout: Option<Duration>) -> bool {
        self.shutdown();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        self.coordinator.drain(tasks, timeout).await
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, token: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                biased;
                () = token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, remote_addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%remote_addr, error = %e, "failed to set TCP_NODELAY");
                    }
                    let (reader, writer) = stream.into_split();
                    let transport = stream_transport(reader, writer, &self.codec, remote_addr);
                    if let Err(e) = self.accept(transport) {
                        warn!(%remote_addr, error = %e, "rejected connection");
                    }
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
        debug!("accept loop stopped");
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("frame_mode", &self.config.frame_mode)
            .field("connections", &self.registry.len())
            .finish_non_exhaustive()
    }
}

/// GET {ws_path}
async fn ws_handler(
    State(server): State<Arc<Server>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    if server.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server is shutting down").into_response();
    }
    if server.registry.len() >= server.config.max_connections {
        counter!(CONNECTIONS_REJECTED_TOTAL).increment(1);
        warn!(%remote_addr, "connection limit reached, refusing upgrade");
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    }

    ws.max_message_size(server.codec.max_frame_len())
        .on_upgrade(move |socket| async move {
            if let Err(e) = server.accept(websocket_transport(socket, remote_addr)) {
                warn!(%remote_addr, error = %e, "rejected session after upgrade");
            }
        })
}

/// GET /health
async fn health_handler(State(server): State<Arc<Server>>) -> Json<HealthResponse> {
    Json(server.health())
}

/// GET /metrics
async fn metrics_handler(State(server): State<Arc<Server>>) -> Response {
    match server.metrics.get() {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
