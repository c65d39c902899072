//! Credential Store — durable record of accounts, settings, and `activeIndex`
//!
//! Manages a single JSON document containing every account plus pool
//! settings plus the persisted selection index. All writes use atomic
//! temp-file + rename to prevent corruption on crash. A tokio Mutex
//! serializes concurrent writes from request-time mutation and the
//! background refresh task.
//!
//! Writes are best-effort: a failed `save` is logged and swallowed rather
//! than propagated to the caller, since losing the last few stat updates is
//! preferable to failing a live request over a disk hiccup.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::constants::{DEFAULT_ACCOUNT_EMAIL, DEFAULT_DATABASE_RELATIVE_PATH};
use crate::database;
use crate::error::{Error, Result};

/// How an account's credential material is obtained.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CredentialSource {
    /// Refresh-token exchange against the OAuth token endpoint.
    Oauth,
    /// A long-lived API key, used as-is.
    Manual,
    /// Extracted from a local credential database file on demand.
    Database,
}

/// Credential material, shaped by `source`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CredentialMaterial {
    /// Refresh token, for `source = oauth`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Long-lived key, for `source = manual`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Path to the local credential database, for `source = database`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_path: Option<String>,
}

/// Per-account lifetime counters (§3 `stats`).
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AccountStats {
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default)]
    pub last_success_at: Option<u64>,
    #[serde(default)]
    pub last_failure_at: Option<u64>,
}

/// A single account in the pool.
///
/// `health_score` and `recommended` are derived fields, recomputed by the
/// pool on every state change — the credential store persists whatever
/// value the pool last wrote, but never computes it itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub email: String,
    pub source: CredentialSource,
    #[serde(default)]
    pub credential: CredentialMaterial,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,

    #[serde(default)]
    pub is_rate_limited: bool,
    #[serde(default)]
    pub rate_limit_reset_time: Option<u64>,

    #[serde(default)]
    pub is_invalid: bool,
    #[serde(default)]
    pub invalid_reason: Option<String>,
    #[serde(default)]
    pub invalid_at: Option<u64>,

    #[serde(default)]
    pub last_used: Option<u64>,

    #[serde(default)]
    pub stats: AccountStats,

    #[serde(default)]
    pub health_score: i32,
    #[serde(default)]
    pub recommended: bool,
}

impl Account {
    /// A freshly enrolled account: no usage history, not limited, not invalid.
    pub fn new(email: String, source: CredentialSource, credential: CredentialMaterial) -> Self {
        Self {
            email,
            source,
            credential,
            project_id: None,
            is_rate_limited: false,
            rate_limit_reset_time: None,
            is_invalid: false,
            invalid_reason: None,
            invalid_at: None,
            last_used: None,
            stats: AccountStats::default(),
            health_score: 30,
            recommended: false,
        }
    }

    /// §3: an account is available iff it is neither rate-limited nor invalid.
    pub fn is_available(&self) -> bool {
        !self.is_rate_limited && !self.is_invalid
    }
}

/// Pool-wide settings persisted alongside the accounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_duration_ms: u64,
}

fn default_cooldown_ms() -> u64 {
    5 * 60 * 60 * 1000
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            cooldown_duration_ms: default_cooldown_ms(),
        }
    }
}

/// The full document persisted by the Credential Store.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PoolDocument {
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub settings: PoolSettings,
    #[serde(default)]
    pub active_index: usize,
}

impl PoolDocument {
    /// Clamp `active_index` into range after a load (accounts may have been
    /// removed out-of-band, or the document predates the account list).
    fn normalize(mut self) -> Self {
        if self.accounts.is_empty() {
            self.active_index = 0;
        } else if self.active_index >= self.accounts.len() {
            self.active_index = 0;
        }
        self
    }
}

/// Thread-safe, disk-backed pool document.
pub struct CredentialStore {
    path: PathBuf,
    state: Mutex<PoolDocument>,
}

impl CredentialStore {
    /// Load the document from `path`. If the file doesn't exist, attempt the
    /// §4.1 cold-start fallback: hydrate a single default account from the
    /// local credential database. If that extraction also fails, start with
    /// an empty document — the pool is then empty until enrollment happens.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let doc = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            let doc: PoolDocument = serde_json::from_str::<PoolDocument>(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?
                .normalize();
            info!(path = %path.display(), accounts = doc.accounts.len(), "loaded credential store");
            doc
        } else {
            info!(path = %path.display(), "credential file not found, attempting cold-start fallback");
            let doc = cold_start_fallback().await;
            write_atomic(&path, &doc).await?;
            doc
        };

        Ok(Self {
            path,
            state: Mutex::new(doc),
        })
    }

    /// Snapshot the whole document (for the pool to read under its own lock).
    pub async fn snapshot(&self) -> PoolDocument {
        self.state.lock().await.clone()
    }

    /// Mutate the document under the write lock, then best-effort persist.
    ///
    /// `f` runs synchronously while the lock is held; it must not perform
    /// I/O. A save failure is logged and swallowed — callers never see it.
    pub async fn mutate<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut PoolDocument) -> R,
    {
        let mut guard = self.state.lock().await;
        let result = f(&mut guard);
        if let Err(e) = write_atomic(&self.path, &guard).await {
            warn!(error = %e, "best-effort credential store save failed");
        }
        result
    }

    /// Replace the whole document (used by admin restore).
    pub async fn replace(&self, doc: PoolDocument) -> Result<()> {
        let doc = doc.normalize();
        let mut guard = self.state.lock().await;
        *guard = doc;
        write_atomic(&self.path, &guard).await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// §4.1: try to hydrate a single default account from the local credential
/// database; fall back to an empty pool if the extraction fails (no binary,
/// no database file, no matching row).
async fn cold_start_fallback() -> PoolDocument {
    let db_path = default_database_path();
    match database::extract_access_token(&db_path, DEFAULT_ACCOUNT_EMAIL).await {
        Ok(_) => {
            info!(path = %db_path, "hydrated default account from local credential database");
            let account = Account::new(
                DEFAULT_ACCOUNT_EMAIL.to_string(),
                CredentialSource::Database,
                CredentialMaterial {
                    database_path: Some(db_path),
                    ..Default::default()
                },
            );
            PoolDocument {
                accounts: vec![account],
                ..Default::default()
            }
        }
        Err(e) => {
            warn!(error = %e, path = %db_path, "no local credential database fallback available, starting empty");
            PoolDocument::default()
        }
    }
}

fn default_database_path() -> String {
    std::env::var("HOME")
        .map(|home| format!("{home}/{DEFAULT_DATABASE_RELATIVE_PATH}"))
        .unwrap_or_else(|_| DEFAULT_DATABASE_RELATIVE_PATH.to_string())
}

/// Write the document atomically (temp file + rename), 0600 on unix.
async fn write_atomic(path: &Path, doc: &PoolDocument) -> Result<()> {
    let json = serde_json::to_string_pretty(doc)
        .map_err(|e| Error::CredentialParse(format!("serializing credential store: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| Error::Io(format!("creating credential directory: {e}")))?;

    let tmp_path = dir.join(format!(".credentials.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credential store");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_account(email: &str) -> Account {
        Account::new(
            email.to_string(),
            CredentialSource::Oauth,
            CredentialMaterial {
                refresh_token: Some(format!("rt_{email}")),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn roundtrip_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");

        let store = CredentialStore::load(path.clone()).await.unwrap();
        store
            .mutate(|doc| doc.accounts.push(test_account("a@example.com")))
            .await;

        let store2 = CredentialStore::load(path).await.unwrap();
        let doc = store2.snapshot().await;
        assert_eq!(doc.accounts.len(), 1);
        assert_eq!(doc.accounts[0].email, "a@example.com");
    }

    #[tokio::test]
    async fn cold_start_creates_empty_document_when_no_database_fallback_exists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");

        // No `~/.claude/credentials.db` in this test's environment, so the
        // §4.1 fallback extraction fails and the pool starts empty.
        assert!(!path.exists());
        let store = CredentialStore::load(path.clone()).await.unwrap();
        assert!(store.snapshot().await.accounts.is_empty());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn active_index_out_of_range_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        let doc = PoolDocument {
            accounts: vec![test_account("a@example.com")],
            settings: PoolSettings::default(),
            active_index: 99,
        };
        tokio::fs::write(&path, serde_json::to_string(&doc).unwrap())
            .await
            .unwrap();

        let store = CredentialStore::load(path).await.unwrap();
        assert_eq!(store.snapshot().await.active_index, 0);
    }

    #[tokio::test]
    async fn missing_optional_fields_hydrate_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        let minimal = serde_json::json!({
            "accounts": [{"email": "a@example.com", "source": "manual"}]
        });
        tokio::fs::write(&path, minimal.to_string()).await.unwrap();

        let store = CredentialStore::load(path).await.unwrap();
        let doc = store.snapshot().await;
        assert_eq!(doc.settings.cooldown_duration_ms, default_cooldown_ms());
        assert!(!doc.accounts[0].is_rate_limited);
        assert!(!doc.accounts[0].is_invalid);
        assert_eq!(doc.accounts[0].stats.success_count, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        let store = CredentialStore::load(path.clone()).await.unwrap();
        store
            .mutate(|doc| doc.accounts.push(test_account("a@example.com")))
            .await;

        let metadata = tokio::fs::metadata(&path).await.unwrap();
        let mode = metadata.permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "credential file must be 0600, got {mode:o}");
    }

    #[tokio::test]
    async fn concurrent_mutations_dont_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accounts.json");
        let store = std::sync::Arc::new(CredentialStore::load(path.clone()).await.unwrap());

        let mut handles = vec![];
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .mutate(|doc| doc.accounts.push(test_account(&format!("a{i}@example.com"))))
                    .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(store.snapshot().await.accounts.len(), 10);
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let doc: PoolDocument = serde_json::from_str(&contents).unwrap();
        assert_eq!(doc.accounts.len(), 10);
    }
}
