//! Shared-directory scan: one catalog entry per regular file in `shared_dir`.

use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use peershare_core::{checksum_file, ContentId, SharedFile};
use tokio::io::AsyncReadExt;

/// Leading bytes handed to the content sniffer.
const SNIFF_LEN: u64 = 8192;
/// MIME type of anything the sniffer does not recognise.
const UNKNOWN_MIME: &str = "application/x-binary";

/// Scan `dir` (non-recursive). Ids are assigned from 1 in file-name order.
/// Unreadable files are skipped with a warning; a missing directory is created empty.
pub async fn scan(dir: &Path) -> io::Result<Vec<SharedFile>> {
    tokio::fs::create_dir_all(dir).await?;
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            paths.push(entry.path());
        }
    }
    paths.sort();

    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        match catalog_entry(&path, files.len() as u64 + 1).await {
            Ok(file) => files.push(file),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "skipping unreadable file")
            }
        }
    }
    tracing::info!(dir = %dir.display(), files = files.len(), "shared directory scanned");
    Ok(files)
}

async fn catalog_entry(path: &Path, id: u64) -> io::Result<SharedFile> {
    let meta = tokio::fs::metadata(path).await?;
    let checksum = checksum_file(path).await?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.clone());
    let mime = sniff_mime(path).await?;
    let updated_at = epoch_secs(meta.modified().ok());
    Ok(SharedFile {
        id,
        identifier: ContentId::from_name(&stem),
        path: path.to_path_buf(),
        mime: mime.to_string(),
        advertised_path: name,
        checksum: checksum.to_string(),
        size: meta.len(),
        valid: true,
        created_at: epoch_secs(meta.created().ok()).min(updated_at),
        updated_at,
    })
}

fn epoch_secs(t: Option<SystemTime>) -> u64 {
    t.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// MIME type from the file's leading bytes, not its name.
async fn sniff_mime(path: &Path) -> io::Result<&'static str> {
    let mut head = Vec::new();
    tokio::fs::File::open(path)
        .await?
        .take(SNIFF_LEN)
        .read_to_end(&mut head)
        .await?;
    Ok(infer::get(&head).map_or(UNKNOWN_MIME, |kind| kind.mime_type()))
}
