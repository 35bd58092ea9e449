//! Remote session protocol seam and session connector.
//!
//! The bridge never talks to an SSH library directly. It drives the
//! [`RemoteConnector`] / [`RemoteConnection`] / [`RemoteSession`] traits,
//! which expose the handful of primitives an interactive shell needs:
//! dial + password auth, open session, request PTY, stdio pipes, resize,
//! start shell, keepalive request and close. [`crate::ssh`] implements them
//! on top of `russh`.
//!
//! [`open_remote_session`] performs the full setup sequence and wires the
//! session's streams:
//!
//! ```text
//! input queue ──► forward_input ──► session stdin
//! session stdout ──► copy_output ──┐
//! session stderr ──► copy_output ──┴──► OutputBatcher
//! ```
//!
//! Any failure during setup closes what was already opened (session, then
//! connection) before the error is returned.

// Rust guideline compliant 2025-01

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::batcher::OutputBatcher;
use super::message::ConnectRequest;
use crate::constants::{
    DEFAULT_PTY_COLS, DEFAULT_PTY_ROWS, INPUT_QUEUE_CAPACITY, REMOTE_READ_CHUNK,
    TASK_SHUTDOWN_GRACE, TERMINAL_TYPE,
};

/// Readable end of a remote stdio stream.
pub type RemoteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Writable end of a remote stdio stream.
pub type RemoteWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Failure of a single remote-protocol primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The connection deadline elapsed.
    Timeout(Duration),
    /// The server rejected the credentials.
    AuthRejected,
    /// The connection or session is already closed.
    Closed,
    /// A pipe was requested twice.
    PipeTaken(&'static str),
    /// Any other protocol or I/O failure.
    Protocol(String),
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout(after) => write!(f, "timed out after {}s", after.as_secs()),
            Self::AuthRejected => write!(f, "authentication failed"),
            Self::Closed => write!(f, "connection closed"),
            Self::PipeTaken(name) => write!(f, "{name} already taken"),
            Self::Protocol(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for RemoteError {}

/// Failure of one step of [`open_remote_session`].
///
/// The `Display` text is what the browser receives in the `error` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// Dial or authentication failed.
    Dial(RemoteError),
    /// Opening the session channel failed.
    Session(RemoteError),
    /// The PTY request was refused.
    Pty(RemoteError),
    /// The stdin pipe could not be opened.
    StdinPipe(RemoteError),
    /// The stdout pipe could not be opened.
    StdoutPipe(RemoteError),
    /// The stderr pipe could not be opened.
    StderrPipe(RemoteError),
    /// The shell could not be started.
    Shell(RemoteError),
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dial(e) => write!(f, "ssh dial error: {e}"),
            Self::Session(e) => write!(f, "session error: {e}"),
            Self::Pty(e) => write!(f, "pty error: {e}"),
            Self::StdinPipe(e) => write!(f, "stdin pipe error: {e}"),
            Self::StdoutPipe(e) => write!(f, "stdout pipe error: {e}"),
            Self::StderrPipe(e) => write!(f, "stderr pipe error: {e}"),
            Self::Shell(e) => write!(f, "shell error: {e}"),
        }
    }
}

impl std::error::Error for ConnectError {}

/// Dials remote connections.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    /// Connect to `request.address()` and authenticate with the request's
    /// password, giving up after `timeout`.
    async fn dial(
        &self,
        request: &ConnectRequest,
        timeout: Duration,
    ) -> Result<Arc<dyn RemoteConnection>, RemoteError>;
}

/// An authenticated remote connection.
#[async_trait]
pub trait RemoteConnection: Send + Sync {
    /// Open a new session on this connection.
    async fn open_session(&self) -> Result<Box<dyn RemoteSession>, RemoteError>;

    /// Send one keepalive request and wait for the reply.
    async fn send_keepalive(&self) -> Result<(), RemoteError>;

    /// Close the connection. Idempotent.
    async fn close(&self);
}

/// One interactive session on a remote connection.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Request a pseudo-terminal of `cols` x `rows` with terminal type `term`.
    async fn request_pty(&mut self, term: &str, cols: u32, rows: u32) -> Result<(), RemoteError>;

    /// Take the session's stdin stream.
    fn stdin_pipe(&mut self) -> Result<RemoteWriter, RemoteError>;

    /// Take the session's stdout stream.
    fn stdout_pipe(&mut self) -> Result<RemoteReader, RemoteError>;

    /// Take the session's stderr stream.
    fn stderr_pipe(&mut self) -> Result<RemoteReader, RemoteError>;

    /// Start the login shell.
    async fn start_shell(&mut self) -> Result<(), RemoteError>;

    /// Change the PTY size.
    async fn resize(&self, cols: u32, rows: u32) -> Result<(), RemoteError>;

    /// Close the session. Idempotent; pending stdout/stderr reads see EOF.
    async fn close(&self);
}

/// A live remote session and the tasks wired to it.
///
/// Owned by exactly one connection controller. Dropping the input sender
/// (via [`close`](Self::close)) ends the input task; closing the session
/// ends the two copy tasks.
pub struct SessionHandle {
    connection: Arc<dyn RemoteConnection>,
    session: Box<dyn RemoteSession>,
    input_tx: mpsc::Sender<Vec<u8>>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    /// The remote connection (shared with the keepalive monitor).
    pub fn connection(&self) -> Arc<dyn RemoteConnection> {
        Arc::clone(&self.connection)
    }

    /// Writer end of the input queue.
    pub fn input(&self) -> mpsc::Sender<Vec<u8>> {
        self.input_tx.clone()
    }

    /// Resize the remote PTY.
    pub async fn resize(&self, cols: u32, rows: u32) -> Result<(), RemoteError> {
        self.session.resize(cols, rows).await
    }

    /// Close the session, then the connection, then wait for the stream
    /// tasks to notice.
    pub async fn close(self) {
        let Self {
            connection,
            session,
            input_tx,
            tasks,
        } = self;

        drop(input_tx);
        session.close().await;
        connection.close().await;

        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(TASK_SHUTDOWN_GRACE, task).await.is_err() {
                log::warn!("[Remote] Stream task still running after close, aborting");
                abort.abort();
            }
        }
    }
}

/// Open a remote session for `request` and wire its streams.
///
/// On success the returned handle owns the connection, the session, the
/// input queue and three running tasks. stdout and stderr both feed
/// `batcher`; their relative order is whatever the two tasks produce.
pub async fn open_remote_session(
    connector: &dyn RemoteConnector,
    request: &ConnectRequest,
    batcher: &Arc<OutputBatcher>,
    timeout: Duration,
) -> Result<SessionHandle, ConnectError> {
    let connection = connector
        .dial(request, timeout)
        .await
        .map_err(ConnectError::Dial)?;

    let mut session = match connection.open_session().await {
        Ok(session) => session,
        Err(e) => {
            connection.close().await;
            return Err(ConnectError::Session(e));
        }
    };

    match wire_session(session.as_mut(), batcher).await {
        Ok((input_tx, tasks)) => Ok(SessionHandle {
            connection,
            session,
            input_tx,
            tasks,
        }),
        Err(e) => {
            session.close().await;
            connection.close().await;
            Err(e)
        }
    }
}

/// PTY, pipes, stream tasks, shell, in that order.
async fn wire_session(
    session: &mut dyn RemoteSession,
    batcher: &Arc<OutputBatcher>,
) -> Result<(mpsc::Sender<Vec<u8>>, Vec<JoinHandle<()>>), ConnectError> {
    session
        .request_pty(TERMINAL_TYPE, DEFAULT_PTY_COLS, DEFAULT_PTY_ROWS)
        .await
        .map_err(ConnectError::Pty)?;

    let stdin = session.stdin_pipe().map_err(ConnectError::StdinPipe)?;
    let stdout = session.stdout_pipe().map_err(ConnectError::StdoutPipe)?;
    let stderr = session.stderr_pipe().map_err(ConnectError::StderrPipe)?;

    let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_CAPACITY);
    let tasks = vec![
        tokio::spawn(forward_input(input_rx, stdin)),
        tokio::spawn(copy_output("stdout", stdout, Arc::clone(batcher))),
        tokio::spawn(copy_output("stderr", stderr, Arc::clone(batcher))),
    ];

    // On failure the caller closes the session, which ends the copy tasks;
    // dropping `input_tx` here ends the input task.
    session.start_shell().await.map_err(ConnectError::Shell)?;

    Ok((input_tx, tasks))
}

/// Drain the input queue into the session's stdin, preserving order.
async fn forward_input(mut input_rx: mpsc::Receiver<Vec<u8>>, mut stdin: RemoteWriter) {
    while let Some(data) = input_rx.recv().await {
        let written = async {
            stdin.write_all(&data).await?;
            stdin.flush().await
        };
        if let Err(e) = written.await {
            log::debug!("[Remote] stdin write failed, stopping input: {e}");
            break;
        }
    }
}

/// Copy one remote output stream into the batcher until EOF or error.
///
/// EOF is how a remote-side close is observed; it is not an error.
async fn copy_output(name: &'static str, mut reader: RemoteReader, batcher: Arc<OutputBatcher>) {
    let mut buf = vec![0u8; REMOTE_READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                log::debug!("[Remote] {name} reached end of stream");
                break;
            }
            Ok(n) => {
                // A stopped batcher drops the chunk; keep draining until the
                // session closes so the remote never stalls on a full window.
                batcher.write(&buf[..n]).await;
            }
            Err(e) => {
                log::debug!("[Remote] {name} read failed: {e}");
                break;
            }
        }
    }
}
