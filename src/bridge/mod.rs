//! Browser-to-remote-shell bridge.
//!
//! # Architecture
//!
//! ```text
//! transport frames ──► ConnectionController ──connect──► open_remote_session
//!                            │   input/resize                 │
//!                            ▼                                ▼
//!                       SessionHandle ◄──── stdin / stdout / stderr tasks
//!                            │                                │
//!                    KeepaliveMonitor                   OutputBatcher ──► MessageSink
//! ```
//!
//! - [`controller`] owns one browser connection and its session lifecycle.
//! - [`batcher`] coalesces remote output into `output` frames.
//! - [`remote`] defines the remote protocol seam and wires a session.
//! - [`keepalive`] pings idle connections.
//! - [`message`] holds the wire types.
//! - [`transport`] decouples the controller from the socket.

pub mod batcher;
pub mod controller;
pub mod keepalive;
pub mod message;
pub mod remote;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use batcher::OutputBatcher;
pub use controller::{ConnectionController, Phase};
pub use keepalive::{KeepaliveMonitor, KeepaliveOutcome};
pub use message::{ConnectRequest, Message, MessageType, ResizeRequest};
pub use remote::{
    open_remote_session, ConnectError, RemoteConnection, RemoteConnector, RemoteError,
    RemoteReader, RemoteSession, RemoteWriter, SessionHandle,
};
pub use transport::{FrameSource, MessageSink};
