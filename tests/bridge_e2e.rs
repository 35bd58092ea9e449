//! End-to-end: browser WebSocket client ⇄ server ⇄ bridge ⇄ echo shell.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;

use web2ssh::bridge::{
    ConnectRequest, Message, MessageType, RemoteConnection, RemoteConnector, RemoteError,
    RemoteReader, RemoteSession, RemoteWriter,
};
use tempfile::TempDir;
use web2ssh::{BridgeServer, ProfileStore, ServerConfig, SettingsStore};

/// Shared record of what the bridge did to the remote side.
#[derive(Default)]
struct Record {
    dials: AtomicUsize,
    resizes: Mutex<Vec<(u32, u32)>>,
    closes: Mutex<Vec<&'static str>>,
}

/// Remote whose shell echoes stdin back on stdout.
#[derive(Clone, Default)]
struct EchoRemote {
    record: Arc<Record>,
    refuse: bool,
}

#[async_trait]
impl RemoteConnector for EchoRemote {
    async fn dial(
        &self,
        request: &ConnectRequest,
        _timeout: Duration,
    ) -> Result<Arc<dyn RemoteConnection>, RemoteError> {
        self.record.dials.fetch_add(1, Ordering::SeqCst);
        if self.refuse {
            return Err(RemoteError::Protocol(format!(
                "dial tcp {}: connection refused",
                request.address()
            )));
        }
        Ok(Arc::new(EchoConnection {
            record: Arc::clone(&self.record),
        }))
    }
}

struct EchoConnection {
    record: Arc<Record>,
}

#[async_trait]
impl RemoteConnection for EchoConnection {
    async fn open_session(&self) -> Result<Box<dyn RemoteSession>, RemoteError> {
        Ok(Box::new(EchoSession {
            record: Arc::clone(&self.record),
            stdin: None,
            stdout: None,
            stderr: Mutex::new(None),
            echo: Mutex::new(None),
        }))
    }

    async fn send_keepalive(&self) -> Result<(), RemoteError> {
        Ok(())
    }

    async fn close(&self) {
        self.record.closes.lock().unwrap().push("connection");
    }
}

struct EchoSession {
    record: Arc<Record>,
    stdin: Option<DuplexStream>,
    stdout: Option<DuplexStream>,
    stderr: Mutex<Option<DuplexStream>>,
    echo: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl RemoteSession for EchoSession {
    async fn request_pty(&mut self, _term: &str, _cols: u32, _rows: u32) -> Result<(), RemoteError> {
        Ok(())
    }

    fn stdin_pipe(&mut self) -> Result<RemoteWriter, RemoteError> {
        let (local, remote) = tokio::io::duplex(4096);
        self.stdin = Some(remote);
        Ok(Box::new(local))
    }

    fn stdout_pipe(&mut self) -> Result<RemoteReader, RemoteError> {
        let (local, remote) = tokio::io::duplex(4096);
        self.stdout = Some(remote);
        Ok(Box::new(local))
    }

    fn stderr_pipe(&mut self) -> Result<RemoteReader, RemoteError> {
        let (local, remote) = tokio::io::duplex(4096);
        *self.stderr.lock().unwrap() = Some(remote);
        Ok(Box::new(local))
    }

    async fn start_shell(&mut self) -> Result<(), RemoteError> {
        let (Some(mut stdin), Some(mut stdout)) = (self.stdin.take(), self.stdout.take()) else {
            return Err(RemoteError::Closed);
        };
        let echo = tokio::spawn(async move {
            let _ = tokio::io::copy(&mut stdin, &mut stdout).await;
        });
        *self.echo.lock().unwrap() = Some(echo);
        Ok(())
    }

    async fn resize(&self, cols: u32, rows: u32) -> Result<(), RemoteError> {
        self.record.resizes.lock().unwrap().push((cols, rows));
        Ok(())
    }

    async fn close(&self) {
        self.record.closes.lock().unwrap().push("session");
        self.stderr.lock().unwrap().take();
        if let Some(echo) = self.echo.lock().unwrap().take() {
            echo.abort();
        }
    }
}

type Client = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Server with stores in a fresh temp dir; keep the dir alive for the test.
async fn start(remote: &EchoRemote) -> (BridgeServer, TempDir) {
    let tmp = TempDir::new().unwrap();
    let config = ServerConfig {
        bind_addr: "127.0.0.1".to_string(),
        port: 0,
        ..ServerConfig::default()
    };
    let server = BridgeServer::start(
        config,
        Arc::new(remote.clone()),
        Arc::new(SettingsStore::open(tmp.path()).unwrap()),
        Arc::new(ProfileStore::open(tmp.path()).unwrap()),
    )
    .await
    .unwrap();
    (server, tmp)
}

async fn open(server: &BridgeServer) -> Client {
    let url = format!("ws://{}/ws", server.local_addr());
    tokio_tungstenite::connect_async(url).await.unwrap().0
}

async fn send(client: &mut Client, kind: MessageType, data: &str) {
    let text = Message::new(kind, data).encode().unwrap();
    client.send(tungstenite::Message::Text(text)).await.unwrap();
}

async fn recv(client: &mut Client) -> Option<Message> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), client.next())
            .await
            .expect("timed out waiting for frame")?
            .ok()?;
        match frame {
            tungstenite::Message::Text(text) => return Some(Message::decode(text.as_bytes()).unwrap()),
            tungstenite::Message::Close(_) => return None,
            _ => continue,
        }
    }
}

const CONNECT: &str = r#"{"host":"shell.test","port":22,"user":"u","password":"p"}"#;

#[tokio::test]
async fn test_input_is_echoed_back_as_output() {
    let remote = EchoRemote::default();
    let (server, _tmp) = start(&remote).await;
    let mut client = open(&server).await;

    send(&mut client, MessageType::Connect, CONNECT).await;
    assert_eq!(recv(&mut client).await, Some(Message::connected()));

    send(&mut client, MessageType::Input, "echo héllo\r").await;

    let mut echoed = String::new();
    while echoed.len() < "echo héllo\r".len() {
        let msg = recv(&mut client).await.expect("connection closed early");
        assert_eq!(msg.kind, MessageType::Output);
        echoed.push_str(&msg.data);
    }
    assert_eq!(echoed, "echo héllo\r");

    server.shutdown().await;
}

#[tokio::test]
async fn test_resize_and_disconnect_release_remote() {
    let remote = EchoRemote::default();
    let (server, _tmp) = start(&remote).await;
    let mut client = open(&server).await;

    send(&mut client, MessageType::Connect, CONNECT).await;
    assert_eq!(recv(&mut client).await, Some(Message::connected()));

    send(&mut client, MessageType::Resize, r#"{"cols":120,"rows":40}"#).await;
    // Round-trip an echo so the resize has been handled.
    send(&mut client, MessageType::Input, "x").await;
    assert_eq!(recv(&mut client).await, Some(Message::output("x")));
    assert_eq!(*remote.record.resizes.lock().unwrap(), vec![(120, 40)]);

    client.close(None).await.unwrap();
    // Server closes its side once teardown completes.
    while recv(&mut client).await.is_some() {}

    let released = async {
        while remote.record.closes.lock().unwrap().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(2), released)
        .await
        .expect("remote not released");
    let closes = remote.record.closes.lock().unwrap().clone();
    assert_eq!(closes, vec!["session", "connection"]);
    server.shutdown().await;
}

#[tokio::test]
async fn test_failed_connect_keeps_connection_usable() {
    let refusing = EchoRemote {
        refuse: true,
        ..EchoRemote::default()
    };
    let (server, _tmp) = start(&refusing).await;
    let mut client = open(&server).await;

    send(&mut client, MessageType::Connect, CONNECT).await;
    let err = recv(&mut client).await.unwrap();
    assert_eq!(err.kind, MessageType::Error);
    assert!(err.data.contains("connection refused"), "got: {}", err.data);

    // Malformed frames are ignored and the connection stays open.
    client
        .send(tungstenite::Message::Text("{oops".to_string()))
        .await
        .unwrap();
    send(&mut client, MessageType::Connect, "not json").await;
    assert_eq!(
        recv(&mut client).await,
        Some(Message::error("invalid connect request"))
    );
    assert_eq!(refusing.record.dials.load(Ordering::SeqCst), 1);

    server.shutdown().await;
}
