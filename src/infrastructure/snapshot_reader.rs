//! Snapshot Reader
//!
//! Polls the directory the terminal-side writer drops per-account JSON files
//! into, parses changed files and replaces the matching store record. A file
//! that fails to parse is logged and the previous record is kept.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::entities::account::{AccountRegistryEntry, Login};
use crate::domain::entities::snapshot::AccountSnapshot;
use crate::domain::errors::SnapshotError;
use crate::domain::repositories::terminal::AccountProbe;
use crate::domain::services::account_registry::AccountRegistry;
use crate::domain::services::snapshot_normalizer::parse_snapshot;
use crate::infrastructure::snapshot_store::SnapshotStore;

/// Placeholder replaced by the account login in the file pattern
pub const LOGIN_PLACEHOLDER: &str = "{login}";

/// Identity of a file version as seen by the poller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
}

/// Result of reading one account file
#[derive(Debug, Clone)]
pub enum ReadOutcome {
    Ingested(Arc<AccountSnapshot>),
    /// Same file version as the last read
    Unchanged,
    Missing,
    Empty,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
    pub ingested: usize,
    pub unchanged: usize,
    pub missing: usize,
    pub empty: usize,
    pub failed: usize,
}

pub struct SnapshotReader {
    dir: PathBuf,
    pattern: String,
    registry: Arc<AccountRegistry>,
    store: Arc<SnapshotStore>,
    stamps: Mutex<HashMap<Login, FileStamp>>,
    last_errors: Mutex<HashMap<Login, String>>,
}

impl SnapshotReader {
    pub fn new(
        dir: impl Into<PathBuf>,
        pattern: impl Into<String>,
        registry: Arc<AccountRegistry>,
        store: Arc<SnapshotStore>,
    ) -> Self {
        Self {
            dir: dir.into(),
            pattern: pattern.into(),
            registry,
            store,
            stamps: Mutex::new(HashMap::new()),
            last_errors: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File the writer produces for `login`
    pub fn path_for(&self, login: Login) -> PathBuf {
        self.dir
            .join(self.pattern.replace(LOGIN_PLACEHOLDER, &login.to_string()))
    }

    /// Read one account's file if it changed since the last read
    pub async fn read_account(
        &self,
        entry: &AccountRegistryEntry,
    ) -> Result<ReadOutcome, SnapshotError> {
        let path = self.path_for(entry.login);
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ReadOutcome::Missing),
            Err(source) => {
                return Err(SnapshotError::Read {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        if metadata.len() == 0 {
            return Ok(ReadOutcome::Empty);
        }

        let stamp = FileStamp {
            modified: metadata.modified().ok(),
            len: metadata.len(),
        };
        if self.stamps.lock().await.get(&entry.login) == Some(&stamp) {
            return Ok(ReadOutcome::Unchanged);
        }

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|source| SnapshotError::Read {
                path: path.display().to_string(),
                source,
            })?;
        // A broken version is not re-parsed until the writer replaces it
        self.stamps.lock().await.insert(entry.login, stamp);

        match parse_snapshot(&bytes, entry, Utc::now()) {
            Ok(snapshot) => {
                self.last_errors.lock().await.remove(&entry.login);
                let record = self.store.replace(snapshot).await;
                debug!(
                    "Ingested snapshot for account {} (balance {:.2}, {} positions)",
                    entry.login,
                    record.balance,
                    record.positions.len()
                );
                Ok(ReadOutcome::Ingested(record))
            }
            Err(source) => {
                self.last_errors
                    .lock()
                    .await
                    .insert(entry.login, source.to_string());
                Err(SnapshotError::Parse {
                    login: entry.login,
                    source,
                })
            }
        }
    }

    /// One poll tick over every registry entry
    pub async fn poll_once(&self) -> Result<PollReport, SnapshotError> {
        tokio::fs::metadata(&self.dir)
            .await
            .map_err(|source| SnapshotError::DirectoryUnavailable {
                path: self.dir.display().to_string(),
                source,
            })?;

        let mut report = PollReport::default();
        for entry in self.registry.entries() {
            match self.read_account(entry).await {
                Ok(ReadOutcome::Ingested(_)) => report.ingested += 1,
                Ok(ReadOutcome::Unchanged) => report.unchanged += 1,
                Ok(ReadOutcome::Missing) => report.missing += 1,
                Ok(ReadOutcome::Empty) => report.empty += 1,
                Err(e) => {
                    warn!("Keeping previous snapshot: {}", e);
                    report.failed += 1;
                }
            }
        }

        if report.ingested > 0 || report.failed > 0 {
            info!(
                "Snapshot poll: {} ingested, {} unchanged, {} missing, {} empty, {} failed",
                report.ingested, report.unchanged, report.missing, report.empty, report.failed
            );
        }
        Ok(report)
    }

    /// Last parse error per account, cleared on the next good read
    pub async fn last_errors(&self) -> HashMap<Login, String> {
        self.last_errors.lock().await.clone()
    }
}

#[async_trait]
impl AccountProbe for SnapshotReader {
    async fn probe(&self, account: &AccountRegistryEntry) -> Option<Arc<AccountSnapshot>> {
        if let Err(e) = self.read_account(account).await {
            debug!("Probe read failed for account {}: {}", account.login, e);
        }
        self.store.get(account.login).await
    }
}
