//! Saved connection profiles.
//!
//! Profiles are stored as a JSON array in `sessions.json` next to the
//! settings file. They only hold what is needed to prefill a `connect`
//! request; passwords are never stored.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use crate::config::config_dir;
use crate::constants::DEFAULT_SSH_PORT;

/// Profiles file name inside the config directory.
const PROFILES_FILE: &str = "sessions.json";

/// A saved remote host.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    /// Random identifier assigned on creation.
    #[serde(default)]
    pub id: String,
    /// Display name.
    pub name: String,
    /// Remote host.
    pub host: String,
    /// Remote SSH port (0 means default).
    #[serde(default)]
    pub port: u16,
    /// Login user.
    pub user: String,
    /// Authentication method hint for the UI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_type: Option<String>,
    /// Private key path hint for the UI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
}

/// No saved profile has the requested id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileNotFound(pub String);

impl std::fmt::Display for ProfileNotFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session not found: {}", self.0)
    }
}

impl std::error::Error for ProfileNotFound {}

/// JSON file backed profile store.
#[derive(Debug)]
pub struct ProfileStore {
    path: PathBuf,
    lock: RwLock<()>,
}

impl ProfileStore {
    /// Store rooted at `dir` (created if missing).
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create config dir: {}", dir.display()))?;
        Ok(Self {
            path: dir.join(PROFILES_FILE),
            lock: RwLock::new(()),
        })
    }

    /// Store in the default config directory.
    pub fn open_default() -> Result<Self> {
        Self::open(&config_dir()?)
    }

    /// All saved profiles, in insertion order.
    pub fn list(&self) -> Result<Vec<Profile>> {
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);
        self.read_all()
    }

    /// The profile with `id`.
    pub fn get(&self, id: &str) -> Result<Profile> {
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);
        self.read_all()?
            .into_iter()
            .find(|p| p.id == id)
            .ok_or_else(|| ProfileNotFound(id.to_string()).into())
    }

    /// Save a new profile, assigning its id. Port 0 becomes 22.
    pub fn add(&self, mut profile: Profile) -> Result<Profile> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);

        profile.id = generate_profile_id();
        if profile.port == 0 {
            profile.port = DEFAULT_SSH_PORT;
        }

        let mut profiles = self.read_all()?;
        profiles.push(profile.clone());
        self.write_all(&profiles)?;
        Ok(profile)
    }

    /// Replace the profile with `id`.
    pub fn update(&self, id: &str, mut profile: Profile) -> Result<Profile> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);

        profile.id = id.to_string();
        let mut profiles = self.read_all()?;
        let Some(slot) = profiles.iter_mut().find(|p| p.id == id) else {
            return Err(ProfileNotFound(id.to_string()).into());
        };
        *slot = profile.clone();
        self.write_all(&profiles)?;
        Ok(profile)
    }

    /// Delete the profile with `id`.
    pub fn remove(&self, id: &str) -> Result<()> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);

        let mut profiles = self.read_all()?;
        let before = profiles.len();
        profiles.retain(|p| p.id != id);
        if profiles.len() == before {
            return Err(ProfileNotFound(id.to_string()).into());
        }
        self.write_all(&profiles)
    }

    // Callers hold the lock.
    fn read_all(&self) -> Result<Vec<Profile>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", self.path.display()))
    }

    fn write_all(&self, profiles: &[Profile]) -> Result<()> {
        fs::write(&self.path, serde_json::to_string_pretty(profiles)?)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;

        #[cfg(unix)]
        fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }
}

/// 16 hex digits of randomness.
fn generate_profile_id() -> String {
    let id: u64 = rand::random();
    format!("{id:016x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(name: &str) -> Profile {
        Profile {
            id: String::new(),
            name: name.to_string(),
            host: format!("{name}.example.test"),
            port: 0,
            user: "deploy".to_string(),
            auth_type: None,
            key_path: None,
        }
    }

    #[test]
    fn test_empty_store_lists_nothing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = ProfileStore::open(tmp.path()).unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_add_assigns_id_and_default_port() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = ProfileStore::open(tmp.path()).unwrap();

        let saved = store.add(profile("web")).unwrap();
        assert_eq!(saved.id.len(), 16);
        assert!(saved.id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(saved.port, 22);
        assert_eq!(store.list().unwrap(), vec![saved]);
    }

    #[test]
    fn test_add_keeps_explicit_port_and_order() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = ProfileStore::open(tmp.path()).unwrap();

        let mut db = profile("db");
        db.port = 2222;
        store.add(profile("web")).unwrap();
        store.add(db).unwrap();

        let names: Vec<_> = store.list().unwrap().into_iter().map(|p| (p.name, p.port)).collect();
        assert_eq!(names, vec![("web".to_string(), 22), ("db".to_string(), 2222)]);
    }

    #[test]
    fn test_update_replaces_matching_profile() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = ProfileStore::open(tmp.path()).unwrap();
        let saved = store.add(profile("web")).unwrap();

        let mut changed = profile("web-renamed");
        changed.port = 2200;
        store.update(&saved.id, changed).unwrap();

        let list = store.list().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, saved.id);
        assert_eq!(list[0].name, "web-renamed");
        assert_eq!(list[0].port, 2200);
    }

    #[test]
    fn test_update_and_remove_unknown_id_fail() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = ProfileStore::open(tmp.path()).unwrap();
        store.add(profile("web")).unwrap();

        assert!(store.update("missing", profile("x")).is_err());
        let err = store.remove("missing").unwrap_err();
        assert_eq!(
            err.downcast_ref::<ProfileNotFound>(),
            Some(&ProfileNotFound("missing".to_string()))
        );
        assert_eq!(err.to_string(), "session not found: missing");
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_get_finds_by_id() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = ProfileStore::open(tmp.path()).unwrap();
        let web = store.add(profile("web")).unwrap();
        store.add(profile("db")).unwrap();

        assert_eq!(store.get(&web.id).unwrap(), web);
        assert!(store.get("missing").is_err());
    }

    #[test]
    fn test_remove_deletes_only_that_profile() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = ProfileStore::open(tmp.path()).unwrap();
        let web = store.add(profile("web")).unwrap();
        let db = store.add(profile("db")).unwrap();

        store.remove(&web.id).unwrap();
        assert_eq!(store.list().unwrap(), vec![db]);
    }

    #[test]
    fn test_optional_fields_are_omitted_when_absent() {
        let json = serde_json::to_string(&profile("web")).unwrap();
        assert!(!json.contains("authType"));
        assert!(!json.contains("keyPath"));

        let mut with_key = profile("web");
        with_key.key_path = Some("~/.ssh/id_ed25519".to_string());
        let json = serde_json::to_string(&with_key).unwrap();
        assert!(json.contains("\"keyPath\""));
    }
}
