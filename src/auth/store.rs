//! Credential storage.
//!
//! A `CredentialStore` is a keyed table of username -> password hash. Two
//! backends ship:
//! - `MemoryCredentialStore`: a mutex-guarded map, lost on restart
//! - `SqliteCredentialStore`: a single SQLite table for deployments that need
//!   credentials to survive a restart
//!
//! `Credentials` layers the password hasher over whichever store the config
//! selects. Usernames are opaque keys: no trimming or case folding.

use super::password::PasswordHasher;
use crate::config::CredentialsConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("{0} must not be empty")]
    EmptyField(&'static str),
    #[error("password hashing failed: {0}")]
    Hash(String),
    #[error("credential storage failure: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for CredentialError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Keyed password-hash table shared by every request handler.
///
/// Implementations provide their own mutual exclusion; callers may invoke
/// any method concurrently from different sessions.
pub trait CredentialStore: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Insert or replace the hash for `username`. Returns `true` when an
    /// existing record was overwritten.
    fn upsert(&self, username: &str, password_hash: &str) -> Result<bool, CredentialError>;

    fn password_hash(&self, username: &str) -> Result<Option<String>, CredentialError>;

    fn count(&self) -> Result<u64, CredentialError>;
}

// ── In-memory backend ───────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    records: Mutex<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn upsert(&self, username: &str, password_hash: &str) -> Result<bool, CredentialError> {
        let previous = self
            .records
            .lock()
            .insert(username.to_owned(), password_hash.to_owned());
        Ok(previous.is_some())
    }

    fn password_hash(&self, username: &str) -> Result<Option<String>, CredentialError> {
        Ok(self.records.lock().get(username).cloned())
    }

    fn count(&self) -> Result<u64, CredentialError> {
        Ok(self.records.lock().len() as u64)
    }
}

// ── SQLite backend ──────────────────────────────────────────────────

pub struct SqliteCredentialStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteCredentialStore {
    /// Open (or create) the credential database at the given path.
    pub fn open(db_path: &Path) -> Result<Self, CredentialError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                CredentialError::Storage(format!("create {}: {e}", parent.display()))
            })?;
        }
        let conn = rusqlite::Connection::open(db_path)?;

        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS credentials (
                username TEXT PRIMARY KEY,
                password_hash TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn upsert(&self, username: &str, password_hash: &str) -> Result<bool, CredentialError> {
        let conn = self.conn.lock();
        let existed: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM credentials WHERE username = ?1)",
            rusqlite::params![username],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT INTO credentials (username, password_hash, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(username) DO UPDATE SET
                password_hash = excluded.password_hash,
                updated_at = excluded.updated_at",
            rusqlite::params![username, password_hash, epoch_secs()],
        )?;
        Ok(existed)
    }

    fn password_hash(&self, username: &str) -> Result<Option<String>, CredentialError> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            "SELECT password_hash FROM credentials WHERE username = ?1",
            rusqlite::params![username],
            |row| row.get(0),
        );
        match row {
            Ok(hash) => Ok(Some(hash)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn count(&self) -> Result<u64, CredentialError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM credentials", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

/// Factory: create the configured credential backend.
pub fn create_credential_store(
    config: &CredentialsConfig,
) -> anyhow::Result<Arc<dyn CredentialStore>> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryCredentialStore::new())),
        "sqlite" => {
            let path = config.resolved_path();
            let store = SqliteCredentialStore::open(&path)?;
            tracing::info!(path = %path.display(), "SQLite credential store opened");
            Ok(Arc::new(store))
        }
        other if other.trim().is_empty() => {
            anyhow::bail!("credentials.backend cannot be empty. Supported values: memory, sqlite")
        }
        other => anyhow::bail!(
            "Unknown credential backend '{other}'. Supported values: memory, sqlite"
        ),
    }
}

// ── Register / verify ───────────────────────────────────────────────

/// Registration and password verification over a `CredentialStore`.
pub struct Credentials {
    store: Arc<dyn CredentialStore>,
    hasher: PasswordHasher,
}

impl Credentials {
    pub fn new(store: Arc<dyn CredentialStore>, hasher: PasswordHasher) -> Self {
        Self { store, hasher }
    }

    pub fn store(&self) -> &dyn CredentialStore {
        self.store.as_ref()
    }

    /// Hash `password` and store it under `username`, replacing any prior
    /// record for that username.
    pub fn register(&self, username: &str, password: &str) -> Result<(), CredentialError> {
        if username.is_empty() {
            return Err(CredentialError::EmptyField("username"));
        }
        if password.is_empty() {
            return Err(CredentialError::EmptyField("password"));
        }

        let hash = self
            .hasher
            .hash(password)
            .map_err(|e| CredentialError::Hash(e.to_string()))?;
        let replaced = self.store.upsert(username, &hash)?;
        if replaced {
            tracing::info!(username, "Existing credentials overwritten by registration");
        } else {
            tracing::info!(username, "User registered");
        }
        Ok(())
    }

    /// `Ok(false)` for both unknown users and wrong passwords; only storage
    /// failures are errors.
    pub fn verify(&self, username: &str, password: &str) -> Result<bool, CredentialError> {
        match self.store.password_hash(username)? {
            Some(stored) => Ok(self.hasher.verify(password, &stored)),
            None => {
                // Same cost as a real check so unknown users are not distinguishable by timing
                self.hasher.dummy_verify(password);
                Ok(false)
            }
        }
    }
}

/// Current Unix epoch in seconds.
fn epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
