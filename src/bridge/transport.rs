//! Transport seam between the bridge and the browser connection.
//!
//! The controller reads raw frames through [`FrameSource`] and writes
//! [`Message`]s through a [`MessageSink`]. The sink is a bounded queue
//! drained by a single writer task, so the controller and the batcher can
//! both emit frames without sharing the socket. A writer that falls behind
//! fills the queue and senders wait for it.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver};

use super::message::Message;
use crate::constants::OUTBOUND_QUEUE_CAPACITY;

/// Inbound half of a message-framed transport.
#[async_trait]
pub trait FrameSource: Send {
    /// Next inbound frame payload.
    ///
    /// Returns `None` once the peer has closed the connection, and
    /// `Some(Err(_))` on a read failure. Both end the controller's loop.
    async fn next_frame(&mut self) -> Option<Result<Vec<u8>>>;
}

/// In-process transport: frames pushed into the channel are read in order.
#[async_trait]
impl FrameSource for UnboundedReceiver<Vec<u8>> {
    async fn next_frame(&mut self) -> Option<Result<Vec<u8>>> {
        self.recv().await.map(Ok)
    }
}

/// Outbound half of a transport connection.
///
/// Cloneable; every clone feeds the same writer task. Holds at most
/// [`OUTBOUND_QUEUE_CAPACITY`] frames.
#[derive(Debug, Clone)]
pub struct MessageSink {
    tx: mpsc::Sender<Message>,
}

impl MessageSink {
    /// Create a sink and the receiver its writer task drains.
    pub fn channel() -> (Self, mpsc::Receiver<Message>) {
        Self::with_capacity(OUTBOUND_QUEUE_CAPACITY)
    }

    /// Like [`channel`](Self::channel) with an explicit queue depth.
    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue a message for the writer task, waiting while the queue is full.
    ///
    /// Returns `false` if the writer is gone (transport closed).
    pub async fn send(&self, message: Message) -> bool {
        self.tx.send(message).await.is_ok()
    }

    /// Whether the writer task has stopped draining this sink.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
