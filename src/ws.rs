//! Server-side WebSocket transport halves.
//!
//! The HTTP layer ([`crate::server`]) performs the upgrade and hands the
//! socket to [`split`], which returns a ([`WsWriter`], [`WsReader`]) pair:
//! the reader feeds the bridge as a [`FrameSource`], the writer is driven by
//! a single writer task.
//!
//! Browsers connect from arbitrary origins; the `Origin` header is not
//! checked.

// Rust guideline compliant 2026-02

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::extract::ws::{Message as WsFrame, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};

use crate::bridge::transport::FrameSource;

/// Split an upgraded socket into its writer and reader halves.
pub fn split(socket: WebSocket) -> (WsWriter, WsReader) {
    let (sink, stream) = socket.split();
    (WsWriter { sink }, WsReader { stream })
}

/// Write half of a WebSocket connection.
pub struct WsWriter {
    sink: SplitSink<WebSocket, WsFrame>,
}

impl std::fmt::Debug for WsWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsWriter").finish_non_exhaustive()
    }
}

impl WsWriter {
    /// Send a UTF-8 text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the send fails (connection closed, I/O error).
    pub async fn send_text(&mut self, text: String) -> Result<()> {
        self.sink
            .send(WsFrame::Text(text.into()))
            .await
            .context("WebSocket send_text failed")
    }

    /// Send a close frame, flush, and close the sink.
    ///
    /// # Errors
    ///
    /// Returns an error if closing fails.
    pub async fn close(&mut self) -> Result<()> {
        self.sink.close().await.context("WebSocket close failed")
    }
}

/// Read half of a WebSocket connection.
pub struct WsReader {
    stream: SplitStream<WebSocket>,
}

impl std::fmt::Debug for WsReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsReader").finish_non_exhaustive()
    }
}

/// Text and binary frames are both accepted as payload. Control frames are
/// skipped; the socket answers pings itself. A close frame ends the stream.
#[async_trait]
impl FrameSource for WsReader {
    async fn next_frame(&mut self) -> Option<Result<Vec<u8>>> {
        loop {
            let frame = match self.stream.next().await? {
                Ok(frame) => frame,
                Err(e) => {
                    return Some(Err(anyhow::Error::new(e).context("WebSocket read failed")))
                }
            };
            match frame {
                WsFrame::Text(text) => return Some(Ok(text.as_str().as_bytes().to_vec())),
                WsFrame::Binary(data) => return Some(Ok(data.to_vec())),
                WsFrame::Close(_) => return None,
                WsFrame::Ping(_) | WsFrame::Pong(_) => {}
            }
        }
    }
}
