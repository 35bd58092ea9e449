//! SSH implementation of the remote session traits, built on `russh`.
//!
//! # Architecture
//!
//! `russh` exposes a session channel as a message stream rather than as
//! separate byte streams, so each [`SshSession`] is split apart by a pump
//! task once the shell starts:
//!
//! ```text
//!                  ┌──────────── pump task ─────────────┐
//! stdin duplex ───►│ channel.data()                     │
//!                  │ ChannelMsg::Data ──────────────────┼──► stdout duplex
//!                  │ ChannelMsg::ExtendedData(1) ───────┼──► stderr duplex
//! commands ───────►│ window_change() / close()          │
//!                  └────────────────────────────────────┘
//! ```
//!
//! When the channel closes the pump exits and drops the duplex writers, so
//! readers of stdout/stderr observe EOF.
//!
//! Host keys are accepted without verification.
//!
//! # Keepalive
//!
//! `russh` 0.44 keeps its own `keepalive@openssh.com` sender private, so a
//! liveness check opens a throwaway session channel instead. The server has
//! to answer the open (confirm or refuse) within the reply timeout; a peer
//! that stays silent counts as a failed check.

// Rust guideline compliant 2025-01

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::{Channel, ChannelMsg, Disconnect, Pty};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::bridge::message::ConnectRequest;
use crate::bridge::remote::{
    RemoteConnection, RemoteConnector, RemoteError, RemoteReader, RemoteSession, RemoteWriter,
};
use crate::constants::{
    KEEPALIVE_REPLY_TIMEOUT, PTY_BAUD_RATE, REMOTE_READ_CHUNK, SSH_PIPE_CAPACITY,
};

/// `russh` client callbacks.
struct SshHandler {
    address: String,
}

#[async_trait]
impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        log::warn!(
            "[SSH] Accepting host key for {} without verification",
            self.address
        );
        Ok(true)
    }
}

fn protocol(e: impl std::fmt::Display) -> RemoteError {
    RemoteError::Protocol(e.to_string())
}

/// Dials SSH servers with password authentication.
#[derive(Debug, Clone, Copy)]
pub struct SshConnector {
    /// Deadline for the server's answer to a keepalive check.
    reply_timeout: Duration,
}

impl Default for SshConnector {
    fn default() -> Self {
        Self {
            reply_timeout: KEEPALIVE_REPLY_TIMEOUT,
        }
    }
}

impl SshConnector {
    /// Create a connector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override how long keepalive checks wait for the server.
    pub fn with_reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }
}

#[async_trait]
impl RemoteConnector for SshConnector {
    async fn dial(
        &self,
        request: &ConnectRequest,
        timeout: Duration,
    ) -> Result<Arc<dyn RemoteConnection>, RemoteError> {
        let address = request.address();
        let config = Arc::new(client::Config::default());
        let handler = SshHandler {
            address: address.clone(),
        };

        let connect = async {
            let mut handle = client::connect(config, address.as_str(), handler)
                .await
                .map_err(protocol)?;

            let accepted = handle
                .authenticate_password(request.user.clone(), request.password.clone())
                .await
                .map_err(protocol)?;
            if !accepted {
                return Err(RemoteError::AuthRejected);
            }
            Ok(handle)
        };

        let handle = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| RemoteError::Timeout(timeout))??;

        log::debug!("[SSH] Authenticated as {} on {address}", request.user);
        Ok(Arc::new(SshConnection {
            handle,
            reply_timeout: self.reply_timeout,
            closed: AtomicBool::new(false),
        }))
    }
}

/// An authenticated SSH connection.
pub struct SshConnection {
    handle: client::Handle<SshHandler>,
    reply_timeout: Duration,
    closed: AtomicBool,
}

impl std::fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnection")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RemoteConnection for SshConnection {
    async fn open_session(&self) -> Result<Box<dyn RemoteSession>, RemoteError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RemoteError::Closed);
        }
        let channel = self.handle.channel_open_session().await.map_err(protocol)?;
        Ok(Box::new(SshSession::new(channel)))
    }

    async fn send_keepalive(&self) -> Result<(), RemoteError> {
        if self.closed.load(Ordering::SeqCst) || self.handle.is_closed() {
            return Err(RemoteError::Closed);
        }

        let opened = tokio::time::timeout(self.reply_timeout, self.handle.channel_open_session())
            .await
            .map_err(|_| RemoteError::Timeout(self.reply_timeout))?;
        match opened {
            Ok(channel) => {
                if let Err(e) = channel.close().await {
                    log::debug!("[SSH] Closing keepalive channel failed: {e}");
                }
                Ok(())
            }
            // A refusal is still an answer from a live server.
            Err(russh::Error::ChannelOpenFailure(reason)) => {
                log::debug!("[SSH] Keepalive channel refused: {reason:?}");
                Ok(())
            }
            Err(e) => Err(protocol(e)),
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            log::debug!("[SSH] Disconnect failed: {e}");
        }
    }
}

/// Requests handled by the pump task.
enum Command {
    Resize {
        cols: u32,
        rows: u32,
        reply: oneshot::Sender<Result<(), RemoteError>>,
    },
    Close,
}

/// Pump-side ends of the stdio pipes.
#[derive(Default)]
struct PumpEnds {
    stdin: Option<DuplexStream>,
    stdout: Option<DuplexStream>,
    stderr: Option<DuplexStream>,
}

/// One SSH session channel.
pub struct SshSession {
    /// The channel until the pump takes it.
    channel: Mutex<Option<Channel<client::Msg>>>,
    ends: PumpEnds,
    /// Messages that arrived while waiting for a request reply.
    early: Vec<ChannelMsg>,
    commands: Option<mpsc::Sender<Command>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("started", &self.commands.is_some())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl SshSession {
    fn new(channel: Channel<client::Msg>) -> Self {
        Self {
            channel: Mutex::new(Some(channel)),
            ends: PumpEnds::default(),
            early: Vec::new(),
            commands: None,
            closed: AtomicBool::new(false),
        }
    }

    fn channel_mut(&mut self) -> Result<&mut Channel<client::Msg>, RemoteError> {
        self.channel.get_mut().as_mut().ok_or(RemoteError::Closed)
    }

    /// Wait for the reply to a `want_reply` request, keeping anything else
    /// that arrives for the pump.
    async fn await_reply(&mut self, what: &str) -> Result<(), RemoteError> {
        loop {
            let msg = self.channel_mut()?.wait().await;
            match msg {
                Some(ChannelMsg::Success) => return Ok(()),
                Some(ChannelMsg::Failure) => {
                    return Err(RemoteError::Protocol(format!("{what} request refused")))
                }
                Some(other) => self.early.push(other),
                None => return Err(RemoteError::Closed),
            }
        }
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn request_pty(&mut self, term: &str, cols: u32, rows: u32) -> Result<(), RemoteError> {
        let modes = [
            (Pty::ECHO, 1),
            (Pty::TTY_OP_ISPEED, PTY_BAUD_RATE),
            (Pty::TTY_OP_OSPEED, PTY_BAUD_RATE),
        ];
        self.channel_mut()?
            .request_pty(true, term, cols, rows, 0, 0, &modes)
            .await
            .map_err(protocol)?;
        self.await_reply("pty").await
    }

    fn stdin_pipe(&mut self) -> Result<RemoteWriter, RemoteError> {
        if self.ends.stdin.is_some() {
            return Err(RemoteError::PipeTaken("stdin"));
        }
        let (local, pump) = tokio::io::duplex(SSH_PIPE_CAPACITY);
        self.ends.stdin = Some(pump);
        Ok(Box::new(local))
    }

    fn stdout_pipe(&mut self) -> Result<RemoteReader, RemoteError> {
        if self.ends.stdout.is_some() {
            return Err(RemoteError::PipeTaken("stdout"));
        }
        let (local, pump) = tokio::io::duplex(SSH_PIPE_CAPACITY);
        self.ends.stdout = Some(pump);
        Ok(Box::new(local))
    }

    fn stderr_pipe(&mut self) -> Result<RemoteReader, RemoteError> {
        if self.ends.stderr.is_some() {
            return Err(RemoteError::PipeTaken("stderr"));
        }
        let (local, pump) = tokio::io::duplex(SSH_PIPE_CAPACITY);
        self.ends.stderr = Some(pump);
        Ok(Box::new(local))
    }

    async fn start_shell(&mut self) -> Result<(), RemoteError> {
        self.channel_mut()?
            .request_shell(true)
            .await
            .map_err(protocol)?;
        self.await_reply("shell").await?;

        let channel = self.channel.get_mut().take().ok_or(RemoteError::Closed)?;
        let (commands, command_rx) = mpsc::channel(8);
        let pump = Pump {
            channel,
            ends: std::mem::take(&mut self.ends),
            commands: command_rx,
        };
        tokio::spawn(pump.run(std::mem::take(&mut self.early)));
        self.commands = Some(commands);
        Ok(())
    }

    async fn resize(&self, cols: u32, rows: u32) -> Result<(), RemoteError> {
        let commands = self.commands.as_ref().ok_or(RemoteError::Closed)?;
        let (reply, reply_rx) = oneshot::channel();
        commands
            .send(Command::Resize { cols, rows, reply })
            .await
            .map_err(|_| RemoteError::Closed)?;
        reply_rx.await.map_err(|_| RemoteError::Closed)?
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        match &self.commands {
            Some(commands) => {
                // A gone pump means the channel is already closed.
                let _ = commands.send(Command::Close).await;
            }
            None => {
                if let Some(channel) = self.channel.lock().await.take() {
                    if let Err(e) = channel.close().await {
                        log::debug!("[SSH] Channel close failed: {e}");
                    }
                }
            }
        }
    }
}

/// Owns the channel once the shell is running.
struct Pump {
    channel: Channel<client::Msg>,
    ends: PumpEnds,
    commands: mpsc::Receiver<Command>,
}

/// What woke the pump.
enum Event {
    Remote(Option<ChannelMsg>),
    Stdin(std::io::Result<usize>),
    Command(Option<Command>),
}

impl Pump {
    async fn run(mut self, early: Vec<ChannelMsg>) {
        for msg in early {
            self.deliver(msg).await;
        }

        let mut stdin = self.ends.stdin.take();
        let mut buf = vec![0u8; REMOTE_READ_CHUNK];

        loop {
            let event = tokio::select! {
                msg = self.channel.wait() => Event::Remote(msg),
                read = read_stdin(&mut stdin, &mut buf) => Event::Stdin(read),
                cmd = self.commands.recv() => Event::Command(cmd),
            };

            match event {
                Event::Remote(Some(msg)) => self.deliver(msg).await,
                Event::Remote(None) => {
                    log::debug!("[SSH] Channel closed by remote");
                    break;
                }
                Event::Stdin(Ok(0)) | Event::Stdin(Err(_)) => {
                    stdin = None;
                    if let Err(e) = self.channel.eof().await {
                        log::debug!("[SSH] Sending EOF failed: {e}");
                    }
                }
                Event::Stdin(Ok(n)) => {
                    if let Err(e) = self.channel.data(&buf[..n]).await {
                        log::debug!("[SSH] Channel write failed: {e}");
                        break;
                    }
                }
                Event::Command(Some(Command::Resize { cols, rows, reply })) => {
                    let result = self
                        .channel
                        .window_change(cols, rows, 0, 0)
                        .await
                        .map_err(protocol);
                    let _ = reply.send(result);
                }
                Event::Command(Some(Command::Close)) | Event::Command(None) => {
                    if let Err(e) = self.channel.close().await {
                        log::debug!("[SSH] Channel close failed: {e}");
                    }
                    break;
                }
            }
        }
        // Dropping `self.ends` signals EOF to the stdout/stderr readers.
    }

    async fn deliver(&mut self, msg: ChannelMsg) {
        let (target, data) = match msg {
            ChannelMsg::Data { data } => (&mut self.ends.stdout, data),
            ChannelMsg::ExtendedData { data, ext: 1 } => (&mut self.ends.stderr, data),
            ChannelMsg::ExitStatus { exit_status } => {
                log::debug!("[SSH] Remote shell exited with status {exit_status}");
                return;
            }
            _ => return,
        };

        if let Some(writer) = target {
            if writer.write_all(&data).await.is_err() {
                // Reader gone; keep draining the channel.
                *target = None;
            }
        }
    }
}

/// Read from stdin, or wait forever once it is closed.
async fn read_stdin(stdin: &mut Option<DuplexStream>, buf: &mut [u8]) -> std::io::Result<usize> {
    match stdin {
        Some(stdin) => stdin.read(buf).await,
        None => std::future::pending().await,
    }
}
