//! Per-connection state machine.
//!
//! One [`ConnectionController`] exists per browser connection. It reads
//! frames from the transport, dispatches `connect` / `input` / `resize`,
//! and owns at most one remote session at a time.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──connect──► Connecting ──ok──► Active ──transport closed──► Closed
//!   ▲                   │
//!   └──────failure──────┘
//! ```
//!
//! When the transport closes (or fails) the controller tears down exactly
//! once, holding its lock: stop the batcher (final flush), stop keepalive,
//! close the session, close the connection.
//!
//! # Locking
//!
//! A single `tokio::sync::Mutex` guards the session handle, the batcher and
//! the keepalive monitor. Blocking I/O (dialing, queueing input) happens
//! with the lock released; only handle lookups and teardown take it.

// Rust guideline compliant 2025-01

use std::sync::Arc;

use tokio::sync::Mutex;

use super::batcher::OutputBatcher;
use super::keepalive::KeepaliveMonitor;
use super::message::{ConnectRequest, Message, MessageType, ResizeRequest};
use super::remote::{open_remote_session, RemoteConnector, SessionHandle};
use super::transport::{FrameSource, MessageSink};
use crate::config::{Settings, SettingsProvider};

/// Controller lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No session.
    Idle,
    /// Inside the connect handler.
    Connecting,
    /// A session is open.
    Active,
    /// Torn down; terminal.
    Closed,
}

/// State shared between the read loop and teardown.
#[derive(Debug)]
struct BridgeState {
    phase: Phase,
    session: Option<SessionHandle>,
    batcher: Option<Arc<OutputBatcher>>,
    keepalive: Option<KeepaliveMonitor>,
}

/// Drives one browser connection.
pub struct ConnectionController {
    /// Connection id used in log lines.
    id: String,
    connector: Arc<dyn RemoteConnector>,
    settings: Arc<dyn SettingsProvider>,
    sink: MessageSink,
    state: Mutex<BridgeState>,
}

impl std::fmt::Debug for ConnectionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionController")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl ConnectionController {
    /// Create an idle controller writing to `sink`.
    pub fn new(
        id: impl Into<String>,
        connector: Arc<dyn RemoteConnector>,
        settings: Arc<dyn SettingsProvider>,
        sink: MessageSink,
    ) -> Self {
        Self {
            id: id.into(),
            connector,
            settings,
            sink,
            state: Mutex::new(BridgeState {
                phase: Phase::Idle,
                session: None,
                batcher: None,
                keepalive: None,
            }),
        }
    }

    /// Connection id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle phase.
    pub async fn phase(&self) -> Phase {
        self.state.lock().await.phase
    }

    /// Read frames until the transport closes, then tear down.
    ///
    /// Returns only after the final `output` flush has been queued on the
    /// sink.
    pub async fn run<S: FrameSource>(&self, mut source: S) {
        loop {
            match source.next_frame().await {
                Some(Ok(frame)) => self.on_message(&frame).await,
                Some(Err(e)) => {
                    log::info!("[Bridge {}] Transport read failed: {e:#}", self.id);
                    break;
                }
                None => {
                    log::info!("[Bridge {}] Transport closed", self.id);
                    break;
                }
            }
        }

        self.teardown().await;
    }

    /// Handle one raw inbound frame.
    ///
    /// Malformed frames are logged and dropped; they never end the loop.
    pub async fn on_message(&self, raw: &[u8]) {
        let message = match Message::decode(raw) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("[Bridge {}] Ignoring malformed message: {e}", self.id);
                return;
            }
        };

        match message.kind {
            MessageType::Connect => self.handle_connect(&message.data).await,
            MessageType::Input => self.handle_input(message.data).await,
            MessageType::Resize => self.handle_resize(&message.data).await,
            other => log::debug!("[Bridge {}] Ignoring {other:?} from client", self.id),
        }
    }

    async fn handle_connect(&self, data: &str) {
        let request: ConnectRequest = match serde_json::from_str(data) {
            Ok(request) => request,
            Err(e) => {
                log::warn!("[Bridge {}] Invalid connect request: {e}", self.id);
                self.sink.send(Message::error("invalid connect request")).await;
                return;
            }
        };

        let phase = {
            let mut state = self.state.lock().await;
            let phase = state.phase;
            if phase == Phase::Idle {
                state.phase = Phase::Connecting;
            }
            phase
        };
        match phase {
            Phase::Idle => {}
            Phase::Connecting | Phase::Active => {
                log::warn!("[Bridge {}] Rejecting connect: session already active", self.id);
                // Sent outside the lock: the sink may be full.
                self.sink.send(Message::error("session already active")).await;
                return;
            }
            Phase::Closed => return,
        }

        let settings = self.load_settings();
        log::info!(
            "[Bridge {}] Connecting to {}@{}",
            self.id,
            request.user,
            request.address()
        );

        let batcher = Arc::new(OutputBatcher::start(self.sink.clone()));
        let opened = open_remote_session(
            self.connector.as_ref(),
            &request,
            &batcher,
            settings.ssh.connection_timeout(),
        )
        .await;

        match opened {
            Ok(handle) => {
                let keepalive = KeepaliveMonitor::spawn(
                    handle.connection(),
                    settings.ssh.keep_alive_interval(),
                    settings.ssh.keep_alive_max_fails,
                );

                let mut state = self.state.lock().await;
                state.session = Some(handle);
                state.batcher = Some(batcher);
                state.keepalive = keepalive;
                state.phase = Phase::Active;
                drop(state);

                log::info!("[Bridge {}] Session established", self.id);
                self.sink.send(Message::connected()).await;
            }
            Err(e) => {
                batcher.stop().await;
                log::warn!("[Bridge {}] Connect failed: {e}", self.id);
                self.state.lock().await.phase = Phase::Idle;
                self.sink.send(Message::error(e.to_string())).await;
            }
        }
    }

    async fn handle_input(&self, data: String) {
        let input = {
            let state = self.state.lock().await;
            match &state.session {
                Some(session) => session.input(),
                None => return,
            }
        };

        // The queue may be full; wait without holding the lock.
        if input.send(data.into_bytes()).await.is_err() {
            log::debug!("[Bridge {}] Input dropped, session stdin closed", self.id);
        }
    }

    async fn handle_resize(&self, data: &str) {
        let Ok(size) = serde_json::from_str::<ResizeRequest>(data) else {
            log::debug!("[Bridge {}] Ignoring malformed resize", self.id);
            return;
        };

        let state = self.state.lock().await;
        if let Some(session) = &state.session {
            if let Err(e) = session.resize(size.cols, size.rows).await {
                log::debug!("[Bridge {}] Resize failed: {e}", self.id);
            }
        }
    }

    fn load_settings(&self) -> Settings {
        let loaded = self.settings.load_settings().and_then(|settings| {
            settings.validate()?;
            Ok(settings)
        });
        loaded.unwrap_or_else(|e| {
            log::warn!("[Bridge {}] Unusable settings, using defaults: {e:#}", self.id);
            Settings::default()
        })
    }

    /// Release everything, in order. Runs at most once.
    async fn teardown(&self) {
        let mut state = self.state.lock().await;
        if state.phase == Phase::Closed {
            return;
        }
        state.phase = Phase::Closed;

        if let Some(batcher) = state.batcher.take() {
            batcher.stop().await;
        }
        if let Some(keepalive) = state.keepalive.take() {
            keepalive.stop().await;
        }
        if let Some(session) = state.session.take() {
            session.close().await;
        }

        log::info!("[Bridge {}] Torn down", self.id);
    }
}
