//! Application-wide constants for web2ssh.
//!
//! This module centralizes the tuning numbers of the terminal bridge so the
//! latency/throughput tradeoffs live in one place.
//!
//! # Categories
//!
//! - **Output batching**: Flush delay, frame size and queue depth
//! - **Remote session**: PTY defaults, read chunk size, input queue depth
//! - **Keepalive**: Defaults used when settings are unavailable
//! - **Server**: Listen defaults and WebSocket path

use std::time::Duration;

// ============================================================================
// Output batching
// ============================================================================

/// Delay after the last appended chunk before pending output is flushed.
///
/// Bounds the latency of the first unflushed byte. 8ms is below the
/// threshold where typing echo feels sluggish.
pub const OUTPUT_FLUSH_DELAY: Duration = Duration::from_millis(8);

/// Pending output size that forces an immediate flush.
pub const OUTPUT_FLUSH_THRESHOLD: usize = 64 * 1024;

/// Number of pending writes the batcher queue holds before writers block.
pub const OUTPUT_QUEUE_CAPACITY: usize = 256;

/// Number of encoded frames queued towards the socket writer.
///
/// Once full, flushes wait for the writer, which in turn stalls the
/// batcher and the remote read side.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 32;

// ============================================================================
// Remote session
// ============================================================================

/// Terminal type requested for the remote PTY.
pub const TERMINAL_TYPE: &str = "xterm-256color";

/// Initial PTY width in columns.
pub const DEFAULT_PTY_COLS: u32 = 80;

/// Initial PTY height in rows.
pub const DEFAULT_PTY_ROWS: u32 = 24;

/// Terminal input/output speed advertised in the PTY modes (baud).
pub const PTY_BAUD_RATE: u32 = 14_400;

/// Buffer size used when copying remote stdout/stderr into the batcher.
pub const REMOTE_READ_CHUNK: usize = 32 * 1024;

/// Number of pending input writes queued towards the remote stdin.
pub const INPUT_QUEUE_CAPACITY: usize = 100;

/// Capacity of the in-memory pipes between the SSH channel pump and the
/// stdio streams handed to the bridge.
pub const SSH_PIPE_CAPACITY: usize = 64 * 1024;

/// How long teardown waits for stream tasks to observe the close.
pub const TASK_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Default SSH port when a connect request or profile omits it.
pub const DEFAULT_SSH_PORT: u16 = 22;

// ============================================================================
// Keepalive
// ============================================================================

/// Connection deadline used when settings cannot be loaded (seconds).
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 10;

/// Keepalive period used when settings cannot be loaded (seconds).
pub const DEFAULT_KEEPALIVE_INTERVAL_SECS: u64 = 30;

/// Consecutive failed keepalives before the remote connection is closed.
pub const DEFAULT_KEEPALIVE_MAX_FAILS: u32 = 3;

/// How long a keepalive request waits for the server's reply before it
/// counts as failed.
pub const KEEPALIVE_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Server
// ============================================================================

/// Default TCP port for `web2ssh serve`.
pub const DEFAULT_LISTEN_PORT: u16 = 8080;

/// Default bind address for `web2ssh serve`.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0";

/// Request path that is upgraded to the terminal WebSocket.
pub const WS_PATH: &str = "/ws";

/// Saved connection profiles collection route.
pub const SESSIONS_API_PATH: &str = "/api/sessions";

/// Settings document route.
pub const SETTINGS_API_PATH: &str = "/api/settings";
