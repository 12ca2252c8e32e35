//! Durable storage for the server's own OAuth token pairs.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};

use crate::auth::token_store::{TokenKey, TokenRecord};

/// Directory under the home directory holding the default vault file.
const VAULT_DIR: &str = ".mcp-atlassian";
const VAULT_FILE: &str = "oauth-tokens.json";

/// Serializes read-modify-write cycles of every file vault in the process.
static WRITE_LOCK: Mutex<()> = Mutex::new(());
/// Distinguishes temp files of concurrent writers.
static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn write_lock() -> MutexGuard<'static, ()> {
    WRITE_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Persistence backend for [`TokenRecord`]s.
///
/// Implementations must make `save` durable before returning: the token store
/// only reports a refresh as successful once the new record is saved.
pub trait TokenVault: Send + Sync {
    fn load(&self, key: &TokenKey) -> Result<Option<TokenRecord>>;
    fn save(&self, key: &TokenKey, record: &TokenRecord) -> Result<()>;
    fn delete(&self, key: &TokenKey) -> Result<()>;
}

/// JSON file vault, one object keyed by `oauth-<client_id>:<cloud_id>`.
///
/// The file is written with mode 0600 and replaced atomically. Saves and
/// deletes hold a process-wide lock across their read-modify-write cycle.
#[derive(Debug, Clone)]
pub struct FileTokenVault {
    path: PathBuf,
}

impl FileTokenVault {
    /// Vault at `~/.mcp-atlassian/oauth-tokens.json`.
    pub fn new() -> Result<Self> {
        let home = dirs::home_dir().context("could not determine home directory for token vault")?;
        Ok(Self {
            path: home.join(VAULT_DIR).join(VAULT_FILE),
        })
    }

    /// Create a vault at a specific path (useful for testing).
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<HashMap<String, TokenRecord>> {
        match std::fs::read_to_string(&self.path) {
            Ok(data) => serde_json::from_str(&data)
                .with_context(|| format!("token vault {} is corrupt", self.path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e).with_context(|| format!("reading {}", self.path.display())),
        }
    }

    fn write_map(&self, map: &HashMap<String, TokenRecord>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let data = serde_json::to_string_pretty(map)?;
        let tmp = self.temp_path();
        if let Err(e) = write_private(&tmp, data.as_bytes()) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e).with_context(|| format!("writing {}", tmp.display()));
        }

        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e).with_context(|| format!("replacing {}", self.path.display()));
        }
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| VAULT_FILE.to_string());
        let unique = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.path
            .with_file_name(format!("{}.{}.{}.tmp", name, std::process::id(), unique))
    }
}

/// Create `path` readable by the owner only, then write and sync `data`.
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(data)?;
    file.sync_all()
}

impl TokenVault for FileTokenVault {
    fn load(&self, key: &TokenKey) -> Result<Option<TokenRecord>> {
        Ok(self.read_map()?.remove(&key.storage_key()))
    }

    fn save(&self, key: &TokenKey, record: &TokenRecord) -> Result<()> {
        let _guard = write_lock();
        let mut map = self.read_map()?;
        map.insert(key.storage_key(), record.clone());
        self.write_map(&map)
    }

    fn delete(&self, key: &TokenKey) -> Result<()> {
        let _guard = write_lock();
        let mut map = self.read_map()?;
        if map.remove(&key.storage_key()).is_some() {
            self.write_map(&map)?;
        }
        Ok(())
    }
}
