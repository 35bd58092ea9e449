//! In-memory remote session for bridge tests.
//!
//! Records everything the bridge asks of the remote side (PTY requests,
//! stdin bytes, resizes, keepalive requests, close order) and lets a test
//! play the remote shell by writing to its stdout/stderr.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::Notify;

use super::message::ConnectRequest;
use super::remote::{
    RemoteConnection, RemoteConnector, RemoteError, RemoteReader, RemoteSession, RemoteWriter,
};

/// Setup step at which the fake reports a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailAt {
    Dial,
    Session,
    Pty,
    StdinPipe,
    StdoutPipe,
    StderrPipe,
    Shell,
}

#[derive(Default)]
struct FakeState {
    fail_at: Mutex<Option<FailAt>>,
    dials: AtomicUsize,
    dial_timeouts: Mutex<Vec<Duration>>,
    open_sessions: AtomicUsize,
    pty_requests: Mutex<Vec<(String, u32, u32)>>,
    shell_started: AtomicBool,
    input: Arc<Mutex<Vec<u8>>>,
    input_notify: Arc<Notify>,
    stdout: Mutex<Option<DuplexStream>>,
    stderr: Mutex<Option<DuplexStream>>,
    resizes: Mutex<Vec<(u32, u32)>>,
    keepalive_failing: AtomicBool,
    keepalives_sent: AtomicUsize,
    session_closed: AtomicBool,
    connection_closed: AtomicBool,
    connection_closes: AtomicUsize,
    close_log: Mutex<Vec<&'static str>>,
}

impl FakeState {
    fn fails_at(&self, step: FailAt) -> bool {
        *self.fail_at.lock().unwrap() == Some(step)
    }

    fn drop_stdio(&self) {
        self.stdout.lock().unwrap().take();
        self.stderr.lock().unwrap().take();
    }
}

fn injected(step: FailAt) -> RemoteError {
    RemoteError::Protocol(format!("injected {step:?} failure"))
}

/// Fake remote endpoint; also acts as the connector.
#[derive(Clone, Default)]
pub(crate) struct FakeRemote {
    state: Arc<FakeState>,
}

impl FakeRemote {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn failing_at(step: FailAt) -> Self {
        let remote = Self::new();
        *remote.state.fail_at.lock().unwrap() = Some(step);
        remote
    }

    pub(crate) fn clear_failure(&self) {
        *self.state.fail_at.lock().unwrap() = None;
    }

    pub(crate) fn set_keepalive_failing(&self, failing: bool) {
        self.state.keepalive_failing.store(failing, Ordering::SeqCst);
    }

    pub(crate) fn dials(&self) -> usize {
        self.state.dials.load(Ordering::SeqCst)
    }

    pub(crate) fn dial_timeouts(&self) -> Vec<Duration> {
        self.state.dial_timeouts.lock().unwrap().clone()
    }

    pub(crate) fn open_sessions(&self) -> usize {
        self.state.open_sessions.load(Ordering::SeqCst)
    }

    pub(crate) fn pty_requests(&self) -> Vec<(String, u32, u32)> {
        self.state.pty_requests.lock().unwrap().clone()
    }

    pub(crate) fn shell_started(&self) -> bool {
        self.state.shell_started.load(Ordering::SeqCst)
    }

    pub(crate) fn input(&self) -> Vec<u8> {
        self.state.input.lock().unwrap().clone()
    }

    pub(crate) async fn wait_for_input_len(&self, len: usize) {
        let wait = async {
            loop {
                let notified = self.state.input_notify.notified();
                if self.state.input.lock().unwrap().len() >= len {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(2), wait)
            .await
            .expect("timed out waiting for stdin bytes");
    }

    pub(crate) async fn emit_stdout(&self, data: &[u8]) {
        Self::emit(&self.state.stdout, data).await;
    }

    pub(crate) async fn emit_stderr(&self, data: &[u8]) {
        Self::emit(&self.state.stderr, data).await;
    }

    async fn emit(slot: &Mutex<Option<DuplexStream>>, data: &[u8]) {
        let stream = slot.lock().unwrap().take();
        let mut stream = stream.expect("stream closed");
        stream.write_all(data).await.unwrap();
        *slot.lock().unwrap() = Some(stream);
    }

    pub(crate) fn stdio_closed(&self) -> bool {
        self.state.stdout.lock().unwrap().is_none() && self.state.stderr.lock().unwrap().is_none()
    }

    pub(crate) fn resizes(&self) -> Vec<(u32, u32)> {
        self.state.resizes.lock().unwrap().clone()
    }

    pub(crate) fn keepalives_sent(&self) -> usize {
        self.state.keepalives_sent.load(Ordering::SeqCst)
    }

    pub(crate) fn connection_closes(&self) -> usize {
        self.state.connection_closes.load(Ordering::SeqCst)
    }

    pub(crate) fn close_log(&self) -> Vec<&'static str> {
        self.state.close_log.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteConnector for FakeRemote {
    async fn dial(
        &self,
        _request: &ConnectRequest,
        timeout: Duration,
    ) -> Result<Arc<dyn RemoteConnection>, RemoteError> {
        self.state.dials.fetch_add(1, Ordering::SeqCst);
        self.state.dial_timeouts.lock().unwrap().push(timeout);
        if self.state.fails_at(FailAt::Dial) {
            return Err(RemoteError::Protocol("connection refused".into()));
        }
        self.state.connection_closed.store(false, Ordering::SeqCst);
        Ok(Arc::new(FakeConnection {
            state: Arc::clone(&self.state),
        }))
    }
}

pub(crate) struct FakeConnection {
    state: Arc<FakeState>,
}

#[async_trait]
impl RemoteConnection for FakeConnection {
    async fn open_session(&self) -> Result<Box<dyn RemoteSession>, RemoteError> {
        if self.state.fails_at(FailAt::Session) {
            return Err(injected(FailAt::Session));
        }
        self.state.open_sessions.fetch_add(1, Ordering::SeqCst);
        self.state.session_closed.store(false, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            state: Arc::clone(&self.state),
        }))
    }

    async fn send_keepalive(&self) -> Result<(), RemoteError> {
        self.state.keepalives_sent.fetch_add(1, Ordering::SeqCst);
        if self.state.connection_closed.load(Ordering::SeqCst) {
            return Err(RemoteError::Closed);
        }
        if self.state.keepalive_failing.load(Ordering::SeqCst) {
            return Err(RemoteError::Protocol("no reply".into()));
        }
        Ok(())
    }

    async fn close(&self) {
        if self.state.connection_closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.connection_closes.fetch_add(1, Ordering::SeqCst);
        self.state.close_log.lock().unwrap().push("connection");
        self.state.drop_stdio();
    }
}

pub(crate) struct FakeSession {
    state: Arc<FakeState>,
}

impl FakeSession {
    fn pipe(&self, step: FailAt, slot: &Mutex<Option<DuplexStream>>) -> Result<RemoteReader, RemoteError> {
        if self.state.fails_at(step) {
            return Err(injected(step));
        }
        let (local, remote) = tokio::io::duplex(64 * 1024);
        *slot.lock().unwrap() = Some(remote);
        Ok(Box::new(local))
    }
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn request_pty(&mut self, term: &str, cols: u32, rows: u32) -> Result<(), RemoteError> {
        if self.state.fails_at(FailAt::Pty) {
            return Err(injected(FailAt::Pty));
        }
        self.state
            .pty_requests
            .lock()
            .unwrap()
            .push((term.to_string(), cols, rows));
        Ok(())
    }

    fn stdin_pipe(&mut self) -> Result<RemoteWriter, RemoteError> {
        if self.state.fails_at(FailAt::StdinPipe) {
            return Err(injected(FailAt::StdinPipe));
        }
        Ok(Box::new(RecordingWriter {
            buf: Arc::clone(&self.state.input),
            notify: Arc::clone(&self.state.input_notify),
        }))
    }

    fn stdout_pipe(&mut self) -> Result<RemoteReader, RemoteError> {
        self.pipe(FailAt::StdoutPipe, &self.state.stdout)
    }

    fn stderr_pipe(&mut self) -> Result<RemoteReader, RemoteError> {
        self.pipe(FailAt::StderrPipe, &self.state.stderr)
    }

    async fn start_shell(&mut self) -> Result<(), RemoteError> {
        if self.state.fails_at(FailAt::Shell) {
            return Err(injected(FailAt::Shell));
        }
        self.state.shell_started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resize(&self, cols: u32, rows: u32) -> Result<(), RemoteError> {
        self.state.resizes.lock().unwrap().push((cols, rows));
        Ok(())
    }

    async fn close(&self) {
        if self.state.session_closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.close_log.lock().unwrap().push("session");
        self.state.drop_stdio();
    }
}

/// stdin sink that appends into a shared buffer.
struct RecordingWriter {
    buf: Arc<Mutex<Vec<u8>>>,
    notify: Arc<Notify>,
}

impl AsyncWrite for RecordingWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.buf.lock().unwrap().extend_from_slice(data);
        self.notify.notify_waiters();
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
