//! Download records and the stores that persist them.
//!
//! The download engine is the only writer. `JsonDownloadStore` keeps one JSON document per
//! record, written via temp file + rename, with the previous version kept as `.bak`.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::identity::PeerId;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DownloadId(Uuid);

impl DownloadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DownloadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DownloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for DownloadId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadStatus {
    Pending,
    InProgress,
    Paused,
    Failed,
    CompletedUnverified,
    Completed,
    CompletedIntegrityFailed,
    Deleted,
}

impl DownloadStatus {
    /// No further transfer can happen from this status. `Failed` is not terminal:
    /// a failed download still blocks a same-checksum queue until overridden.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::CompletedUnverified
                | Self::Completed
                | Self::CompletedIntegrityFailed
                | Self::Deleted
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRecord {
    pub id: DownloadId,
    pub remote_peer: PeerId,
    pub remote_file_id: u64,
    pub remote_checksum: String,
    pub remote_size: u64,
    pub offset: u64,
    pub status: DownloadStatus,
    pub path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to ensure directory '{}': {source}", path.display())]
    EnsureDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read directory '{}': {source}", path.display())]
    ReadDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to read '{}': {source}", path.display())]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write '{}': {source}", path.display())]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to copy '{}' to '{}': {source}", from.display(), to.display())]
    Copy {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to rename '{}' to '{}': {source}", from.display(), to.display())]
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to remove '{}': {source}", path.display())]
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize download record: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to parse '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Persistence boundary for download records.
#[async_trait]
pub trait DownloadStore: Send + Sync {
    async fn find_by_id(&self, id: DownloadId) -> Result<Option<DownloadRecord>>;

    /// Records with `checksum`; with `exclude_terminal`, only those that can still transfer.
    async fn find_by_checksum(
        &self,
        checksum: &str,
        exclude_terminal: bool,
    ) -> Result<Vec<DownloadRecord>>;

    async fn save(&self, record: &DownloadRecord) -> Result<()>;

    async fn delete(&self, id: DownloadId) -> Result<()>;

    async fn find_all(&self) -> Result<Vec<DownloadRecord>>;
}

fn checksum_matches(record: &DownloadRecord, checksum: &str, exclude_terminal: bool) -> bool {
    record.remote_checksum == checksum && !(exclude_terminal && record.status.is_terminal())
}

#[derive(Default)]
pub struct MemoryDownloadStore {
    records: Mutex<HashMap<DownloadId, DownloadRecord>>,
}

impl MemoryDownloadStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DownloadStore for MemoryDownloadStore {
    async fn find_by_id(&self, id: DownloadId) -> Result<Option<DownloadRecord>> {
        Ok(self.records.lock().await.get(&id).cloned())
    }

    async fn find_by_checksum(
        &self,
        checksum: &str,
        exclude_terminal: bool,
    ) -> Result<Vec<DownloadRecord>> {
        Ok(self
            .records
            .lock()
            .await
            .values()
            .filter(|r| checksum_matches(r, checksum, exclude_terminal))
            .cloned()
            .collect())
    }

    async fn save(&self, record: &DownloadRecord) -> Result<()> {
        self.records.lock().await.insert(record.id, record.clone());
        Ok(())
    }

    async fn delete(&self, id: DownloadId) -> Result<()> {
        self.records.lock().await.remove(&id);
        Ok(())
    }

    async fn find_all(&self) -> Result<Vec<DownloadRecord>> {
        Ok(self.records.lock().await.values().cloned().collect())
    }
}

const RECORD_EXT: &str = ".json";

pub struct JsonDownloadStore {
    dir: PathBuf,
    writes: Mutex<()>,
}

impl JsonDownloadStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| StoreError::EnsureDir {
                path: dir.clone(),
                source,
            })?;
        Ok(Self {
            dir,
            writes: Mutex::new(()),
        })
    }

    fn record_path(&self, id: DownloadId) -> PathBuf {
        self.dir.join(format!("{id}{RECORD_EXT}"))
    }

    async fn load_all(&self) -> Result<Vec<DownloadRecord>> {
        let mut out = Vec::new();
        let mut rd = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|source| StoreError::ReadDir {
                path: self.dir.clone(),
                source,
            })?;
        while let Some(entry) = rd
            .next_entry()
            .await
            .map_err(|source| StoreError::ReadDir {
                path: self.dir.clone(),
                source,
            })?
        {
            let path = entry.path();
            if !is_primary_record_file(&path) {
                continue;
            }
            match load_record_with_fallback(&path).await {
                Ok(record) => out.push(record),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping unreadable download record");
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl DownloadStore for JsonDownloadStore {
    async fn find_by_id(&self, id: DownloadId) -> Result<Option<DownloadRecord>> {
        let path = self.record_path(id);
        if !file_exists(&path).await? && !file_exists(&backup_path(&path)).await? {
            return Ok(None);
        }
        load_record_with_fallback(&path).await.map(Some)
    }

    async fn find_by_checksum(
        &self,
        checksum: &str,
        exclude_terminal: bool,
    ) -> Result<Vec<DownloadRecord>> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .filter(|r| checksum_matches(r, checksum, exclude_terminal))
            .collect())
    }

    async fn save(&self, record: &DownloadRecord) -> Result<()> {
        let _guard = self.writes.lock().await;
        save_record(&self.record_path(record.id), record).await
    }

    async fn delete(&self, id: DownloadId) -> Result<()> {
        let _guard = self.writes.lock().await;
        let path = self.record_path(id);
        for p in [backup_path(&path), path] {
            match tokio::fs::remove_file(&p).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(StoreError::Remove { path: p, source }),
            }
        }
        Ok(())
    }

    async fn find_all(&self) -> Result<Vec<DownloadRecord>> {
        self.load_all().await
    }
}

async fn file_exists(path: &Path) -> Result<bool> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|source| StoreError::ReadFile {
            path: path.to_path_buf(),
            source,
        })
}

async fn save_record(path: &Path, record: &DownloadRecord) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(record).map_err(StoreError::Serialize)?;

    if file_exists(path).await? {
        let bak = backup_path(path);
        tokio::fs::copy(path, &bak)
            .await
            .map_err(|source| StoreError::Copy {
                from: path.to_path_buf(),
                to: bak,
                source,
            })?;
    }

    let tmp = tmp_path(path);
    tokio::fs::write(&tmp, &bytes)
        .await
        .map_err(|source| StoreError::WriteFile {
            path: tmp.clone(),
            source,
        })?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|source| StoreError::Rename {
            from: tmp,
            to: path.to_path_buf(),
            source,
        })
}

async fn load_record(path: &Path) -> Result<DownloadRecord> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| StoreError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
    serde_json::from_slice(&bytes).map_err(|source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

async fn load_record_with_fallback(path: &Path) -> Result<DownloadRecord> {
    match load_record(path).await {
        Ok(record) => Ok(record),
        Err(primary_err) => {
            let bak = backup_path(path);
            if !file_exists(&bak).await.unwrap_or(false) {
                return Err(primary_err);
            }
            match load_record(&bak).await {
                Ok(record) => {
                    tracing::warn!(path = %path.display(), error = %primary_err, "loaded download record from backup");
                    Ok(record)
                }
                Err(_) => Err(primary_err),
            }
        }
    }
}

fn is_primary_record_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| name.ends_with(RECORD_EXT))
}

fn backup_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".bak");
    PathBuf::from(s)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".tmp");
    PathBuf::from(s)
}
