//! web2ssh - browser terminal to SSH bridge.
//!
//! Serves a browser terminal page, a small JSON API for saved hosts and
//! settings, and the WebSocket endpoint the page uses to drive an
//! interactive shell on a remote host over SSH.
//!
//! # Architecture
//!
//! - **Server** - one HTTP listener; each WebSocket upgrade gets a controller
//! - **Bridge** - per-connection state machine, output batching, keepalive
//! - **SSH** - `russh` implementation of the remote session seam
//! - **Config / Profiles** - settings and saved hosts on disk
//!
//! # Modules
//!
//! - [`bridge`] - connection controller and its collaborators
//! - [`ssh`] - SSH connector
//! - [`server`] - HTTP listener and route table
//! - [`api`] - JSON routes for profiles and settings
//! - [`assets`] - embedded browser client
//! - [`ws`] - WebSocket transport halves
//! - [`config`] - settings loading/saving
//! - [`profiles`] - saved connection profiles

pub mod api;
pub mod assets;
pub mod bridge;
pub mod config;
pub mod constants;
pub mod profiles;
pub mod server;
pub mod ssh;
pub mod ws;

// Re-export commonly used types
pub use bridge::{ConnectionController, Message, MessageType, OutputBatcher};
pub use config::{Settings, SettingsProvider, SettingsStore};
pub use profiles::{Profile, ProfileStore};
pub use server::{BridgeServer, ServerConfig};
pub use ssh::SshConnector;
