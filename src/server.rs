//! HTTP server: browser client, JSON API and the terminal WebSocket on one
//! listener.
//!
//! Routes:
//!
//! - `/`, `/index.html`, `/js/*`, `/css/*` - embedded client ([`crate::assets`])
//! - `/api/sessions`, `/api/settings` - JSON API ([`crate::api`])
//! - `ws_path` (default `/ws`) - WebSocket upgrade, one bridge controller each
//!
//! Each upgraded socket is split into:
//!
//! - a writer task draining the connection's [`MessageSink`] into the socket
//! - the [`ConnectionController`] read loop
//!
//! When the controller returns (teardown done, final output queued) the sink
//! is dropped, the writer drains what is left and closes the socket.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{self, ApiState};
use crate::assets;
use crate::bridge::controller::ConnectionController;
use crate::bridge::message::Message;
use crate::bridge::remote::RemoteConnector;
use crate::bridge::transport::MessageSink;
use crate::config::{SettingsProvider, SettingsStore};
use crate::constants::{DEFAULT_BIND_ADDR, DEFAULT_LISTEN_PORT, WS_PATH};
use crate::profiles::ProfileStore;
use crate::ws::{self, WsWriter};

/// Listener and upgrade configuration, fixed for the server's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind.
    pub bind_addr: String,
    /// TCP port (0 picks a free port).
    pub port: u16,
    /// Request path accepted for the WebSocket upgrade.
    pub ws_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            port: DEFAULT_LISTEN_PORT,
            ws_path: WS_PATH.to_string(),
        }
    }
}

impl ServerConfig {
    /// Check that `ws_path` is a literal route that does not shadow the
    /// client files or the API.
    ///
    /// # Errors
    ///
    /// Returns an error describing the conflicting path.
    pub fn validate(&self) -> Result<()> {
        let path = self.ws_path.as_str();
        if !path.starts_with('/') || path.len() < 2 {
            bail!("WebSocket path must start with '/' and name a route: {path:?}");
        }
        if path.contains(['{', '}', '*']) {
            bail!("WebSocket path must be literal: {path:?}");
        }
        if path == "/api" || path.starts_with("/api/") || assets::ROUTES.contains(&path) {
            bail!("WebSocket path {path:?} collides with a built-in route");
        }
        Ok(())
    }
}

/// Dependencies shared by every WebSocket connection.
#[derive(Clone)]
struct UpgradeState {
    connector: Arc<dyn RemoteConnector>,
    settings: Arc<dyn SettingsProvider>,
}

/// Build the full route table.
fn app(
    config: &ServerConfig,
    connector: Arc<dyn RemoteConnector>,
    settings: Arc<SettingsStore>,
    profiles: Arc<ProfileStore>,
) -> Router {
    let bridge = UpgradeState {
        connector,
        settings: Arc::clone(&settings) as Arc<dyn SettingsProvider>,
    };

    Router::new()
        .route(&config.ws_path, get(upgrade))
        .with_state(bridge)
        .merge(api::router(ApiState { profiles, settings }))
        .merge(assets::router())
        .fallback(not_found)
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Running HTTP server.
#[derive(Debug)]
pub struct BridgeServer {
    /// Bound address (resolved port).
    local_addr: SocketAddr,
    /// Cancelled to stop accepting.
    shutdown: CancellationToken,
    /// Handle to the serve task.
    serve_handle: JoinHandle<()>,
}

impl BridgeServer {
    /// Bind the listener and spawn the serve task.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the address
    /// cannot be bound.
    pub async fn start(
        config: ServerConfig,
        connector: Arc<dyn RemoteConnector>,
        settings: Arc<SettingsStore>,
        profiles: Arc<ProfileStore>,
    ) -> Result<Self> {
        config.validate()?;

        let addr = format!("{}:{}", config.bind_addr, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        let local_addr = listener.local_addr()?;

        log::info!(
            "[Server] Listening on http://{local_addr} (WebSocket at {})",
            config.ws_path
        );

        let router = app(&config, connector, settings, profiles);
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone().cancelled_owned();
        let serve_handle = tokio::spawn(async move {
            let service = router.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(listener, service)
                .with_graceful_shutdown(signal)
                .await
            {
                log::error!("[Server] Serve loop failed: {e}");
            }
        });

        Ok(Self {
            local_addr,
            shutdown,
            serve_handle,
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and wait for in-flight HTTP requests.
    /// Upgraded WebSocket connections run to completion on their own tasks.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.serve_handle.await {
            log::warn!("[Server] Serve task ended abnormally: {e}");
        }
        log::info!("[Server] Stopped accepting connections");
    }
}

async fn upgrade(
    State(bridge): State<UpgradeState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let client_id = generate_client_id();
    log::info!("[Server] Client connected: {client_id} from {peer}");
    ws.on_upgrade(move |socket| handle_connection(socket, client_id, bridge))
}

/// Run one upgraded socket's controller to completion.
async fn handle_connection(socket: WebSocket, client_id: String, bridge: UpgradeState) {
    let (writer, reader) = ws::split(socket);

    let (sink, outbound) = MessageSink::channel();
    let writer_task = tokio::spawn(write_loop(writer, outbound, client_id.clone()));

    let controller =
        ConnectionController::new(client_id.clone(), bridge.connector, bridge.settings, sink);
    controller.run(reader).await;
    drop(controller);

    if let Err(e) = writer_task.await {
        log::warn!("[Server] {client_id}: writer task ended abnormally: {e}");
    }
    log::info!("[Server] Client disconnected: {client_id}");
}

/// Drain queued messages into the socket, then close it.
async fn write_loop(mut writer: WsWriter, mut outbound: mpsc::Receiver<Message>, client_id: String) {
    while let Some(message) = outbound.recv().await {
        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                log::error!("[Server] {client_id}: failed to encode message: {e}");
                continue;
            }
        };
        if let Err(e) = writer.send_text(text).await {
            log::debug!("[Server] {client_id}: send failed, dropping writer: {e:#}");
            return;
        }
    }

    if let Err(e) = writer.close().await {
        log::debug!("[Server] {client_id}: close failed: {e:#}");
    }
}

/// Generate a unique client ID using a monotonic counter + random suffix.
fn generate_client_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let rand: u16 = rand::random();
    format!("ws:{seq:x}{rand:04x}")
}
