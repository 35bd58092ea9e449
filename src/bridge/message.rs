//! Wire types exchanged with the browser.
//!
//! Every frame is a JSON object `{"type": ..., "data": ...}`. The `data`
//! field is always a string; for `connect` and `resize` it carries a nested
//! JSON document that is decoded separately so that a bad payload can be
//! reported (or ignored) without rejecting the envelope.

// Rust guideline compliant 2025-01

use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_SSH_PORT;

/// Message kinds understood by the bridge, in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Browser → bridge: open a remote session.
    Connect,
    /// Browser → bridge: keystrokes for the remote shell.
    Input,
    /// Browser → bridge: terminal size changed.
    Resize,
    /// Bridge → browser: batched remote output.
    Output,
    /// Bridge → browser: remote session is ready.
    Connected,
    /// Bridge → browser: human-readable failure.
    Error,
}

/// One frame on the transport connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message kind.
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Opaque payload, format depends on `kind`.
    #[serde(default)]
    pub data: String,
}

impl Message {
    /// Build a message of the given kind.
    pub fn new(kind: MessageType, data: impl Into<String>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }

    /// Remote output frame.
    pub fn output(data: impl Into<String>) -> Self {
        Self::new(MessageType::Output, data)
    }

    /// Session-ready frame (empty payload).
    pub fn connected() -> Self {
        Self::new(MessageType::Connected, "")
    }

    /// Error frame carrying a human-readable cause.
    pub fn error(cause: impl Into<String>) -> Self {
        Self::new(MessageType::Error, cause)
    }

    /// Decode a raw frame.
    ///
    /// # Errors
    ///
    /// Returns the JSON error for malformed frames or unknown message types.
    pub fn decode(raw: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(raw)
    }

    /// Encode as the JSON text sent on the wire.
    ///
    /// # Errors
    ///
    /// Serialization of this type cannot fail in practice; the error is
    /// surfaced rather than unwrapped.
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Payload of a `connect` message.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// Remote host name or address.
    pub host: String,
    /// Remote SSH port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Login user.
    pub user: String,
    /// Login password.
    #[serde(default)]
    pub password: String,
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

impl ConnectRequest {
    /// `host:port` address for dialing.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// Manual impl so the password never reaches the logs.
impl std::fmt::Debug for ConnectRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectRequest")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// Payload of a `resize` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeRequest {
    /// Terminal width in columns.
    pub cols: u32,
    /// Terminal height in rows.
    pub rows: u32,
}
