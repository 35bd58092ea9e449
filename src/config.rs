//! Settings loading, validation and persistence.
//!
//! Settings live in `settings.json` under the config directory. The bridge
//! reads the `ssh` section once per `connect`; the `terminal` section is
//! stored for the browser UI.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use std::fs;

use crate::constants::{
    DEFAULT_CONNECTION_TIMEOUT_SECS, DEFAULT_KEEPALIVE_INTERVAL_SECS, DEFAULT_KEEPALIVE_MAX_FAILS,
};

/// Settings file name inside the config directory.
const SETTINGS_FILE: &str = "settings.json";

/// Returns the configuration directory path, creating it if necessary.
///
/// `WEB2SSH_CONFIG_DIR` overrides the default `~/.web2ssh`.
pub fn config_dir() -> Result<PathBuf> {
    let dir = if let Ok(dir) = std::env::var("WEB2SSH_CONFIG_DIR") {
        PathBuf::from(dir)
    } else {
        dirs::home_dir()
            .context("Could not determine home directory")?
            .join(".web2ssh")
    };
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create config dir: {}", dir.display()))?;
    Ok(dir)
}

/// Remote connection settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct SshSettings {
    /// Dial + authentication deadline in seconds.
    pub connection_timeout: u64,
    /// Keepalive period in seconds; 0 disables keepalive.
    pub keep_alive_interval: u64,
    /// Consecutive failed keepalives before the connection is closed.
    pub keep_alive_max_fails: u32,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT_SECS,
            keep_alive_interval: DEFAULT_KEEPALIVE_INTERVAL_SECS,
            keep_alive_max_fails: DEFAULT_KEEPALIVE_MAX_FAILS,
        }
    }
}

impl SshSettings {
    /// Connection deadline.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout)
    }

    /// Keepalive period (zero when disabled).
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval)
    }
}

/// Browser terminal appearance.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct TerminalSettings {
    /// Font size in pixels.
    pub font_size: u32,
    /// One of `block`, `underline`, `bar`.
    pub cursor_style: String,
    /// Whether the cursor blinks.
    pub cursor_blink: bool,
    /// Lines kept in the browser scrollback.
    pub scrollback_lines: u32,
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            font_size: 14,
            cursor_style: "block".to_string(),
            cursor_blink: true,
            scrollback_lines: 1000,
        }
    }
}

/// All user settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    /// Remote connection settings.
    pub ssh: SshSettings,
    /// Browser terminal settings.
    pub terminal: TerminalSettings,
}

impl Settings {
    /// Check every field against its allowed range.
    pub fn validate(&self) -> Result<()> {
        let ssh = &self.ssh;
        if !(1..=120).contains(&ssh.connection_timeout) {
            bail!("connectionTimeout must be between 1 and 120");
        }
        if ssh.keep_alive_interval > 600 {
            bail!("keepAliveInterval must be between 0 and 600");
        }
        if !(1..=100).contains(&ssh.keep_alive_max_fails) {
            bail!("keepAliveMaxFails must be between 1 and 100");
        }

        let term = &self.terminal;
        if !(8..=72).contains(&term.font_size) {
            bail!("fontSize must be between 8 and 72");
        }
        if !matches!(term.cursor_style.as_str(), "block" | "underline" | "bar") {
            bail!("cursorStyle must be block, underline, or bar");
        }
        if term.scrollback_lines > 100_000 {
            bail!("scrollbackLines must be between 0 and 100000");
        }
        Ok(())
    }

    /// Read one value by dotted key, e.g. `ssh.connectionTimeout`.
    pub fn get_key(&self, key: &str) -> Result<serde_json::Value> {
        let value = serde_json::to_value(self)?;
        key.split('.')
            .try_fold(&value, |node, part| node.get(part))
            .cloned()
            .with_context(|| format!("Unknown settings key: {key}"))
    }

    /// Set one value by dotted key. Does not validate.
    pub fn set_key(&mut self, key: &str, value: &str) -> Result<()> {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
            value
                .parse()
                .ok()
                .with_context(|| format!("Invalid value for {key}: {value}"))
        }

        match key {
            "ssh.connectionTimeout" => self.ssh.connection_timeout = parse(key, value)?,
            "ssh.keepAliveInterval" => self.ssh.keep_alive_interval = parse(key, value)?,
            "ssh.keepAliveMaxFails" => self.ssh.keep_alive_max_fails = parse(key, value)?,
            "terminal.fontSize" => self.terminal.font_size = parse(key, value)?,
            "terminal.cursorStyle" => self.terminal.cursor_style = value.to_string(),
            "terminal.cursorBlink" => self.terminal.cursor_blink = parse(key, value)?,
            "terminal.scrollbackLines" => self.terminal.scrollback_lines = parse(key, value)?,
            _ => bail!("Unknown settings key: {key}"),
        }
        Ok(())
    }
}

/// Source of settings for the bridge.
pub trait SettingsProvider: Send + Sync {
    /// Current settings.
    fn load_settings(&self) -> Result<Settings>;
}

/// Fixed settings, e.g. for tests or embedding.
impl SettingsProvider for Settings {
    fn load_settings(&self) -> Result<Settings> {
        Ok(self.clone())
    }
}

/// JSON file backed settings store.
///
/// Reads share a lock; writes take it exclusively.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    lock: RwLock<()>,
}

impl SettingsStore {
    /// Store rooted at `dir` (created if missing).
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create config dir: {}", dir.display()))?;
        Ok(Self {
            path: dir.join(SETTINGS_FILE),
            lock: RwLock::new(()),
        })
    }

    /// Store in the default config directory.
    pub fn open_default() -> Result<Self> {
        Self::open(&config_dir()?)
    }

    /// Path of the settings file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load settings. A missing file yields defaults; missing fields take
    /// their defaults.
    ///
    /// A file whose values fail [`Settings::validate`] is ignored with a
    /// warning and the defaults are returned instead.
    pub fn load(&self) -> Result<Settings> {
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);

        if !self.path.exists() {
            return Ok(Settings::default());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        let settings: Settings = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", self.path.display()))?;

        if let Err(e) = settings.validate() {
            log::warn!(
                "[Config] Ignoring {}: {e}; using defaults",
                self.path.display()
            );
            return Ok(Settings::default());
        }
        Ok(settings)
    }

    /// Persist settings.
    pub fn save(&self, settings: &Settings) -> Result<()> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);

        fs::write(&self.path, serde_json::to_string_pretty(settings)?)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;

        // Set restrictive permissions (owner read/write only)
        #[cfg(unix)]
        fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }
}

impl SettingsProvider for SettingsStore {
    fn load_settings(&self) -> Result<Settings> {
        self.load()
    }
}
