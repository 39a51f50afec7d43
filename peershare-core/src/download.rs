//! Resumable downloads: queue, run, pause, resume, delete.
//!
//! The persisted record is the source of truth for offset and status. The active table holds
//! one `DownloadState` per download that is running or paused in this process; pause only
//! flips that state and the running loop notices it at the next chunk.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};

use crate::events::{EventSink, NodeEvent};
use crate::identity::PeerId;
use crate::protocol::Message;
use crate::rpc::{ResponseStream, RpcEngine, RpcError};
use crate::store::{DownloadId, DownloadRecord, DownloadStatus, DownloadStore, StoreError};

/// Name used when the remote path has no usable file name.
const FALLBACK_FILE_NAME: &str = "download";

const MAX_NAME_ATTEMPTS: u32 = 10_000;

/// In-memory view of a download, sent as progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadState {
    pub id: DownloadId,
    pub offset: u64,
    pub size: u64,
    pub status: DownloadStatus,
    /// `floor(offset / size * 100)`; an empty file counts as 100.
    pub percentage: u8,
}

impl DownloadState {
    fn new(record: &DownloadRecord, status: DownloadStatus) -> Self {
        Self {
            id: record.id,
            offset: record.offset,
            size: record.remote_size,
            status,
            percentage: percentage(record.offset, record.remote_size),
        }
    }
}

pub fn percentage(offset: u64, size: u64) -> u8 {
    if size == 0 {
        return 100;
    }
    (offset.min(size) as u128 * 100 / size as u128) as u8
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("peer unreachable: {0}")]
    PeerUnreachable(#[source] RpcError),
    #[error("remote has no file {0}")]
    ResourceNotFound(u64),
    #[error("download {0} already fetches this content")]
    DownloadInProgress(DownloadId),
    #[error("download {id}: {reason}")]
    IllegalState { id: DownloadId, reason: String },
    #[error("unknown download {0}")]
    UnknownDownload(DownloadId),
    #[error("transfer failed: {0}")]
    Transfer(#[source] RpcError),
    #[error("remote error: {0}")]
    Remote(String),
    #[error("remote sent {got} bytes past the declared size {size}")]
    Overrun { got: u64, size: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

fn illegal(id: DownloadId, reason: impl Into<String>) -> DownloadError {
    DownloadError::IllegalState {
        id,
        reason: reason.into(),
    }
}

struct Active {
    state: DownloadState,
    /// A `run` loop currently owns the destination file.
    running: bool,
}

pub struct DownloadEngine {
    rpc: Arc<RpcEngine>,
    store: Arc<dyn DownloadStore>,
    events: Arc<dyn EventSink>,
    download_dir: PathBuf,
    active: Mutex<HashMap<DownloadId, Active>>,
    /// Serialises the checksum check and destination allocation of `queue`.
    queueing: Mutex<()>,
}

impl DownloadEngine {
    pub fn new(
        rpc: Arc<RpcEngine>,
        store: Arc<dyn DownloadStore>,
        events: Arc<dyn EventSink>,
        download_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            rpc,
            store,
            events,
            download_dir: download_dir.into(),
            active: Mutex::new(HashMap::new()),
            queueing: Mutex::new(()),
        }
    }

    /// Create a PENDING record for `remote_file_id` on `remote_peer`.
    pub async fn queue(
        &self,
        remote_peer: PeerId,
        remote_file_id: u64,
        override_existing: bool,
    ) -> Result<DownloadRecord, DownloadError> {
        let request = Message::GetFile {
            file_id: remote_file_id,
        };
        let response = self
            .rpc
            .request(&remote_peer, &request)
            .await
            .map_err(DownloadError::PeerUnreachable)?;
        let file = match response {
            Message::FileInfo { files } => files.into_iter().next(),
            _ => None,
        }
        .ok_or(DownloadError::ResourceNotFound(remote_file_id))?;

        let _queueing = self.queueing.lock().await;
        let existing = self.store.find_by_checksum(&file.checksum, true).await?;
        if let Some(first) = existing.first() {
            if !override_existing {
                return Err(DownloadError::DownloadInProgress(first.id));
            }
            for old in existing {
                tracing::info!(download = %old.id, "replacing existing download");
                self.delete(old.id, true).await?;
            }
        }

        tokio::fs::create_dir_all(&self.download_dir).await?;
        let path = self.unique_path(&local_file_name(&file.path)).await?;
        File::create(&path).await?;

        let record = DownloadRecord {
            id: DownloadId::new(),
            remote_peer,
            remote_file_id,
            remote_checksum: file.checksum,
            remote_size: file.size,
            offset: 0,
            status: DownloadStatus::Pending,
            path,
        };
        self.store.save(&record).await?;
        tracing::info!(download = %record.id, peer = %remote_peer, file = remote_file_id, path = %record.path.display(), "download queued");
        self.events.emit(NodeEvent::DownloadQueued {
            id: record.id,
            path: record.path.clone(),
        });
        Ok(record)
    }

    /// Pull content from the record's offset until the remote is done, a pause is observed,
    /// or the transfer fails. Progress snapshots go to `progress` whenever the percentage moves;
    /// the final snapshot is always sent and also returned.
    pub async fn run(
        &self,
        id: DownloadId,
        progress: &mpsc::UnboundedSender<DownloadState>,
    ) -> Result<DownloadState, DownloadError> {
        let mut record = self
            .store
            .find_by_id(id)
            .await?
            .ok_or(DownloadError::UnknownDownload(id))?;
        if !matches!(
            record.status,
            DownloadStatus::Pending | DownloadStatus::InProgress
        ) {
            return Err(illegal(id, format!("cannot run from {:?}", record.status)));
        }
        self.claim(&record).await?;
        record.status = DownloadStatus::InProgress;

        let failed = match self.transfer(&mut record, progress).await {
            Ok(()) => false,
            Err(err) => {
                tracing::warn!(download = %id, offset = record.offset, error = %err, "transfer stopped");
                self.events
                    .emit(NodeEvent::Monitor(format!("download {id} stopped: {err}")));
                true
            }
        };
        self.finish(record, failed, progress).await
    }

    /// Register `record` as running in the active table.
    async fn claim(&self, record: &DownloadRecord) -> Result<(), DownloadError> {
        let mut active = self.active.lock().await;
        let entry = active.entry(record.id).or_insert_with(|| Active {
            state: DownloadState::new(record, DownloadStatus::InProgress),
            running: false,
        });
        if entry.running {
            return Err(illegal(record.id, "already running"));
        }
        if entry.state.status != DownloadStatus::InProgress {
            return Err(illegal(
                record.id,
                format!("active state is {:?}", entry.state.status),
            ));
        }
        entry.running = true;
        entry.state = DownloadState::new(record, DownloadStatus::InProgress);
        Ok(())
    }

    async fn transfer(
        &self,
        record: &mut DownloadRecord,
        progress: &mpsc::UnboundedSender<DownloadState>,
    ) -> Result<(), DownloadError> {
        let mut file = open_destination(&record.path, &mut record.offset).await?;
        if let Some(start) = self.advance(record, true).await? {
            let _ = progress.send(start);
        }

        let request = Message::GetFileContent {
            file_id: record.remote_file_id,
            offset: record.offset,
        };
        let mut responses = self
            .rpc
            .request_stream(&record.remote_peer, &request)
            .await
            .map_err(DownloadError::PeerUnreachable)?;
        let copied = self
            .copy_chunks(record, &mut file, &mut responses, progress)
            .await;
        if let Err(err) = file.sync_data().await {
            tracing::warn!(download = %record.id, error = %err, "failed to sync destination file");
        }
        responses.close().await;
        copied
    }

    async fn copy_chunks(
        &self,
        record: &mut DownloadRecord,
        file: &mut File,
        responses: &mut ResponseStream,
        progress: &mpsc::UnboundedSender<DownloadState>,
    ) -> Result<(), DownloadError> {
        while let Some(item) = responses.next().await {
            let status = self.active_status(record.id).await;
            if status != Some(DownloadStatus::InProgress) {
                tracing::debug!(download = %record.id, ?status, offset = record.offset, "stopping at chunk boundary");
                return Ok(());
            }
            let content = match item.map_err(DownloadError::Transfer)? {
                Message::FileContent { content } => content,
                Message::Error { reason, .. } => return Err(DownloadError::Remote(reason)),
                other => {
                    return Err(DownloadError::Remote(format!(
                        "unexpected {:?} message in content stream",
                        other.kind()
                    )))
                }
            };
            let end = record.offset.saturating_add(content.len() as u64);
            if end > record.remote_size {
                return Err(DownloadError::Overrun {
                    got: end,
                    size: record.remote_size,
                });
            }
            file.write_all(&content).await?;
            record.offset = end;
            if let Some(snapshot) = self.advance(record, false).await? {
                let _ = progress.send(snapshot);
            }
        }
        Ok(())
    }

    /// Move the active offset to `record.offset`. When the percentage moved, or always with
    /// `force`, persist the record and return a snapshot. The save happens under the active
    /// lock so a concurrent `delete` either sees it or prevents it.
    async fn advance(
        &self,
        record: &DownloadRecord,
        force: bool,
    ) -> Result<Option<DownloadState>, DownloadError> {
        let mut active = self.active.lock().await;
        let Some(entry) = active.get_mut(&record.id) else {
            return Ok(None);
        };
        if entry.state.status == DownloadStatus::Deleted {
            return Ok(None);
        }
        entry.state.offset = record.offset;
        let pct = percentage(record.offset, entry.state.size);
        if pct == entry.state.percentage && !force {
            return Ok(None);
        }
        entry.state.percentage = pct;
        let snapshot = entry.state.clone();
        self.store.save(record).await?;
        Ok(Some(snapshot))
    }

    async fn active_status(&self, id: DownloadId) -> Option<DownloadStatus> {
        self.active.lock().await.get(&id).map(|a| a.state.status)
    }

    async fn finish(
        &self,
        mut record: DownloadRecord,
        failed: bool,
        progress: &mpsc::UnboundedSender<DownloadState>,
    ) -> Result<DownloadState, DownloadError> {
        let id = record.id;
        let mut active = self.active.lock().await;
        let observed = active.get(&id).map(|a| a.state.status);
        let status = match observed {
            None | Some(DownloadStatus::Deleted) => DownloadStatus::Deleted,
            _ if !failed && record.offset == record.remote_size => {
                DownloadStatus::CompletedUnverified
            }
            Some(DownloadStatus::Paused) => DownloadStatus::Paused,
            _ => DownloadStatus::Failed,
        };
        let snapshot = DownloadState::new(&record, status);
        match active.get_mut(&id) {
            Some(entry) if status == DownloadStatus::Paused => {
                entry.running = false;
                entry.state = snapshot.clone();
            }
            _ => {
                active.remove(&id);
            }
        }

        let saved = if status == DownloadStatus::Deleted {
            Ok(())
        } else {
            record.status = status;
            self.store.save(&record).await
        };
        drop(active);
        let _ = progress.send(snapshot.clone());

        match status {
            DownloadStatus::CompletedUnverified => {
                tracing::info!(download = %id, bytes = record.offset, "download complete")
            }
            DownloadStatus::Paused => {
                tracing::info!(download = %id, offset = record.offset, "download paused")
            }
            DownloadStatus::Failed => {
                tracing::warn!(download = %id, offset = record.offset, "download failed")
            }
            _ => tracing::info!(download = %id, "download removed while running"),
        }
        saved?;
        Ok(snapshot)
    }

    /// Ask a running download to stop at its next chunk.
    pub async fn pause(&self, id: DownloadId) -> Result<DownloadState, DownloadError> {
        let mut active = self.active.lock().await;
        let entry = active
            .get_mut(&id)
            .ok_or_else(|| illegal(id, "not active"))?;
        if entry.state.status != DownloadStatus::InProgress {
            return Err(illegal(
                id,
                format!("cannot pause from {:?}", entry.state.status),
            ));
        }
        entry.state.status = DownloadStatus::Paused;
        let snapshot = entry.state.clone();
        if !entry.running {
            // Resumed but never started: nothing will persist the pause for us.
            if let Some(mut record) = self.store.find_by_id(id).await? {
                record.status = DownloadStatus::Paused;
                self.store.save(&record).await?;
            }
        }
        tracing::info!(download = %id, offset = snapshot.offset, "pause requested");
        Ok(snapshot)
    }

    /// Re-activate a PAUSED download and ask for a new run.
    pub async fn resume(&self, id: DownloadId) -> Result<DownloadState, DownloadError> {
        let mut record = self
            .store
            .find_by_id(id)
            .await?
            .ok_or(DownloadError::UnknownDownload(id))?;
        if record.status != DownloadStatus::Paused {
            return Err(illegal(id, format!("cannot resume from {:?}", record.status)));
        }
        let mut active = self.active.lock().await;
        if active.get(&id).is_some_and(|a| a.running) {
            return Err(illegal(id, "previous run still winding down"));
        }
        record.status = DownloadStatus::InProgress;
        let state = DownloadState::new(&record, DownloadStatus::InProgress);
        active.insert(
            id,
            Active {
                state: state.clone(),
                running: false,
            },
        );
        if let Err(err) = self.store.save(&record).await {
            active.remove(&id);
            return Err(err.into());
        }
        drop(active);
        tracing::info!(download = %id, offset = record.offset, "download resumed");
        self.events.emit(NodeEvent::DownloadResumed(id));
        Ok(state)
    }

    /// Remove the record and, if asked, the local file. File removal failures are only logged.
    pub async fn delete(&self, id: DownloadId, also_from_filesystem: bool) -> Result<(), DownloadError> {
        let record = self
            .store
            .find_by_id(id)
            .await?
            .ok_or(DownloadError::UnknownDownload(id))?;
        {
            let mut active = self.active.lock().await;
            if let Some(entry) = active.get_mut(&id) {
                if entry.running {
                    entry.state.status = DownloadStatus::Deleted;
                } else {
                    active.remove(&id);
                }
            }
            self.store.delete(id).await?;
        }
        if also_from_filesystem {
            match tokio::fs::remove_file(&record.path).await {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    tracing::warn!(download = %id, path = %record.path.display(), error = %err, "failed to remove download file")
                }
            }
        }
        tracing::info!(download = %id, "download deleted");
        Ok(())
    }

    pub async fn get(&self, id: DownloadId) -> Result<Option<DownloadRecord>, DownloadError> {
        Ok(self.store.find_by_id(id).await?)
    }

    pub async fn list(&self) -> Result<Vec<DownloadRecord>, DownloadError> {
        Ok(self.store.find_all().await?)
    }

    /// Move IN_PROGRESS records left behind by a previous process to PAUSED, clamping their
    /// offset to what is actually on disk. Returns the recovered ids.
    pub async fn recover(&self) -> Result<Vec<DownloadId>, DownloadError> {
        let mut recovered = Vec::new();
        for mut record in self.store.find_all().await? {
            if record.status != DownloadStatus::InProgress
                || self.active.lock().await.contains_key(&record.id)
            {
                continue;
            }
            let on_disk = match tokio::fs::metadata(&record.path).await {
                Ok(meta) => meta.len(),
                Err(_) => 0,
            };
            record.offset = record.offset.min(on_disk);
            record.status = DownloadStatus::Paused;
            self.store.save(&record).await?;
            tracing::info!(download = %record.id, offset = record.offset, "recovered interrupted download as paused");
            recovered.push(record.id);
        }
        Ok(recovered)
    }

    async fn unique_path(&self, name: &str) -> Result<PathBuf, DownloadError> {
        let taken: Vec<PathBuf> = self
            .store
            .find_all()
            .await?
            .into_iter()
            .filter(|r| r.status != DownloadStatus::Deleted)
            .map(|r| r.path)
            .collect();
        for n in 0..MAX_NAME_ATTEMPTS {
            let candidate = self.download_dir.join(numbered_name(name, n));
            if !taken.contains(&candidate) && !tokio::fs::try_exists(&candidate).await? {
                return Ok(candidate);
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free file name for {name}"),
        )
        .into())
    }
}

/// Last path component of a remote path, never empty and never a traversal.
fn local_file_name(advertised: &str) -> String {
    advertised
        .rsplit(['/', '\\'])
        .find(|part| !part.is_empty())
        .filter(|part| *part != "." && *part != "..")
        .unwrap_or(FALLBACK_FILE_NAME)
        .to_string()
}

/// `name`, then `stem (1).ext`, `stem (2).ext`, ...
fn numbered_name(name: &str, n: u32) -> String {
    if n == 0 {
        return name.to_string();
    }
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(name);
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{stem} ({n}).{ext}"),
        None => format!("{stem} ({n})"),
    }
}

/// Open for writing at `offset`: truncate for a fresh start, otherwise append. Bytes past the
/// recorded offset are dropped; a shorter file pulls the offset back.
async fn open_destination(path: &Path, offset: &mut u64) -> io::Result<File> {
    if *offset == 0 {
        return OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await;
    }
    let file = OpenOptions::new().append(true).create(true).open(path).await?;
    let on_disk = file.metadata().await?.len();
    if on_disk > *offset {
        file.set_len(*offset).await?;
    } else if on_disk < *offset {
        tracing::warn!(path = %path.display(), recorded = *offset, on_disk, "destination shorter than recorded offset");
        *offset = on_disk;
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullSink;
    use crate::handlers::HandlerRegistry;
    use crate::memory::MemoryNetwork;
    use crate::store::MemoryDownloadStore;

    fn temp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("peershare-download-{tag}-{nanos}"));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn engine(dir: &Path) -> (DownloadEngine, Arc<MemoryDownloadStore>) {
        let net = MemoryNetwork::new();
        let rpc = Arc::new(RpcEngine::new(Arc::new(net.join()), HandlerRegistry::new()));
        let store = Arc::new(MemoryDownloadStore::new());
        let engine = DownloadEngine::new(rpc, store.clone(), Arc::new(NullSink), dir);
        (engine, store)
    }

    fn record(dir: &Path, status: DownloadStatus, offset: u64) -> DownloadRecord {
        DownloadRecord {
            id: DownloadId::new(),
            remote_peer: PeerId::generate(),
            remote_file_id: 5,
            remote_checksum: "abc123".into(),
            remote_size: 1024,
            offset,
            status,
            path: dir.join("foo.bin"),
        }
    }

    #[test]
    fn percentage_floors_and_handles_empty_files() {
        assert_eq!(percentage(0, 1024), 0);
        assert_eq!(percentage(511, 1024), 49);
        assert_eq!(percentage(512, 1024), 50);
        assert_eq!(percentage(1024, 1024), 100);
        assert_eq!(percentage(0, 0), 100);
        assert_eq!(percentage(u64::MAX, u64::MAX), 100);
    }

    #[test]
    fn remote_paths_become_safe_local_names() {
        assert_eq!(local_file_name("docs/report.pdf"), "report.pdf");
        assert_eq!(local_file_name("C:\\share\\a.txt"), "a.txt");
        assert_eq!(local_file_name("../../etc/passwd"), "passwd");
        assert_eq!(local_file_name("dir/"), "dir");
        assert_eq!(local_file_name(".."), FALLBACK_FILE_NAME);
        assert_eq!(local_file_name(""), FALLBACK_FILE_NAME);
        assert_eq!(numbered_name("report.pdf", 2), "report (2).pdf");
        assert_eq!(numbered_name("README", 1), "README (1)");
    }

    #[tokio::test]
    async fn unique_path_skips_files_and_records() {
        let dir = temp_dir("unique");
        let (engine, store) = engine(&dir);
        std::fs::write(dir.join("foo.bin"), b"").unwrap();
        let mut taken = record(&dir, DownloadStatus::Pending, 0);
        taken.path = dir.join("foo (1).bin");
        store.save(&taken).await.unwrap();
        assert_eq!(engine.unique_path("foo.bin").await.unwrap(), dir.join("foo (2).bin"));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn pause_requires_running_download() {
        let dir = temp_dir("pause");
        let (engine, store) = engine(&dir);
        let r = record(&dir, DownloadStatus::Pending, 0);
        store.save(&r).await.unwrap();
        assert!(matches!(
            engine.pause(r.id).await,
            Err(DownloadError::IllegalState { .. })
        ));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn resume_requires_paused_record() {
        let dir = temp_dir("resume");
        let (engine, store) = engine(&dir);
        let r = record(&dir, DownloadStatus::Failed, 0);
        store.save(&r).await.unwrap();
        assert!(matches!(
            engine.resume(r.id).await,
            Err(DownloadError::IllegalState { .. })
        ));
        assert!(matches!(
            engine.resume(DownloadId::new()).await,
            Err(DownloadError::UnknownDownload(_))
        ));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn pause_before_run_is_observed_by_run() {
        let dir = temp_dir("order");
        let (engine, store) = engine(&dir);
        let r = record(&dir, DownloadStatus::Paused, 0);
        store.save(&r).await.unwrap();

        engine.resume(r.id).await.unwrap();
        let paused = engine.pause(r.id).await.unwrap();
        assert_eq!(paused.status, DownloadStatus::Paused);
        assert_eq!(
            store.find_by_id(r.id).await.unwrap().unwrap().status,
            DownloadStatus::Paused
        );

        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            engine.run(r.id, &tx).await,
            Err(DownloadError::IllegalState { .. })
        ));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn unreachable_peer_fails_the_run() {
        let dir = temp_dir("unreachable");
        let (engine, store) = engine(&dir);
        let r = record(&dir, DownloadStatus::Pending, 0);
        store.save(&r).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let last = engine.run(r.id, &tx).await.unwrap();
        assert_eq!(last.status, DownloadStatus::Failed);
        let persisted = store.find_by_id(r.id).await.unwrap().unwrap();
        assert_eq!(persisted.status, DownloadStatus::Failed);
        assert_eq!(persisted.offset, 0);

        let mut snapshots = Vec::new();
        while let Ok(s) = rx.try_recv() {
            snapshots.push(s);
        }
        assert_eq!(snapshots.last(), Some(&last));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn recover_pauses_interrupted_runs_and_clamps_offset() {
        let dir = temp_dir("recover");
        let (engine, store) = engine(&dir);
        let interrupted = record(&dir, DownloadStatus::InProgress, 800);
        std::fs::write(&interrupted.path, vec![0u8; 600]).unwrap();
        let pending = record(&dir, DownloadStatus::Pending, 0);
        store.save(&interrupted).await.unwrap();
        store.save(&pending).await.unwrap();

        let ids = engine.recover().await.unwrap();
        assert_eq!(ids, vec![interrupted.id]);
        let after = store.find_by_id(interrupted.id).await.unwrap().unwrap();
        assert_eq!(after.status, DownloadStatus::Paused);
        assert_eq!(after.offset, 600);
        assert_eq!(
            store.find_by_id(pending.id).await.unwrap().unwrap().status,
            DownloadStatus::Pending
        );
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn delete_removes_record_and_file() {
        let dir = temp_dir("delete");
        let (engine, store) = engine(&dir);
        let r = record(&dir, DownloadStatus::Paused, 10);
        std::fs::write(&r.path, b"0123456789").unwrap();
        store.save(&r).await.unwrap();

        engine.delete(r.id, true).await.unwrap();
        assert!(store.find_by_id(r.id).await.unwrap().is_none());
        assert!(!r.path.exists());
        assert!(matches!(
            engine.delete(r.id, true).await,
            Err(DownloadError::UnknownDownload(_))
        ));
        std::fs::remove_dir_all(dir).unwrap();
    }
}
