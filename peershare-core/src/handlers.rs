//! Request handlers and the registry that maps a message kind to its handler.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::cid::ContentId;
use crate::identity::PeerId;
use crate::protocol::{FileRecord, Message, MessageKind};

/// Chunk size used when streaming file content. Receivers must not rely on it.
pub const CONTENT_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("resource not found: file {0}")]
    ResourceNotFound(u64),
    #[error("no handler for {0}")]
    UnknownMessageHandler(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// A file this node shares, as known to the local catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedFile {
    pub id: u64,
    /// Discovery key the file is announced under.
    pub identifier: ContentId,
    /// Where the bytes live locally.
    pub path: PathBuf,
    /// Path shown to remote peers.
    pub advertised_path: String,
    pub mime: String,
    pub checksum: String,
    pub size: u64,
    /// Cleared by the catalog when the file is known to be broken.
    pub valid: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

impl SharedFile {
    pub fn to_record(&self) -> FileRecord {
        FileRecord {
            id: self.id,
            path: self.advertised_path.clone(),
            mime: self.mime.clone(),
            checksum: self.checksum.clone(),
            size: self.size,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Local file catalog, owned by whoever indexes the shared files.
#[async_trait]
pub trait FileCatalog: Send + Sync {
    async fn find_by_identifier(&self, identifier: &ContentId) -> Vec<SharedFile>;
    async fn find_by_id(&self, id: u64) -> Option<SharedFile>;
}

/// Lazily produced response frames.
#[async_trait]
pub trait ReplyStream: Send {
    /// `None` once the sequence is exhausted.
    async fn next(&mut self) -> Option<Result<Message, HandlerError>>;
}

/// What a handler answers with.
pub enum Reply {
    Single(Message),
    Stream(Box<dyn ReplyStream>),
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reply::Single(msg) => f.debug_tuple("Single").field(msg).finish(),
            Reply::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, remote: PeerId, msg: Message) -> Result<Reply, HandlerError>;
}

/// Maps a request kind to its handler.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<MessageKind, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry answering all three requests from `catalog`.
    pub fn with_catalog(catalog: Arc<dyn FileCatalog>) -> Self {
        let mut registry = Self::new();
        registry.register(
            MessageKind::FindFile,
            Arc::new(FindFileHandler::new(catalog.clone())),
        );
        registry.register(
            MessageKind::GetFile,
            Arc::new(GetFileHandler::new(catalog.clone())),
        );
        registry.register(
            MessageKind::GetFileContent,
            Arc::new(GetFileContentHandler::new(catalog)),
        );
        registry
    }

    pub fn register(&mut self, kind: MessageKind, handler: Arc<dyn MessageHandler>) {
        self.handlers.insert(kind, handler);
    }

    /// Find the handler for `msg` and run it. Responses are not dispatchable.
    pub async fn dispatch(&self, remote: PeerId, msg: Message) -> Result<Reply, HandlerError> {
        let handler = msg
            .is_request()
            .then(|| msg.kind())
            .flatten()
            .and_then(|kind| self.handlers.get(&kind))
            .ok_or_else(|| HandlerError::UnknownMessageHandler(describe(&msg)))?;
        handler.handle(remote, msg).await
    }
}

fn describe(msg: &Message) -> String {
    match (msg.kind(), msg.is_request()) {
        (Some(kind), true) => format!("{kind:?} request"),
        (Some(kind), false) => format!("{kind:?} response"),
        (None, _) => "untyped message".to_string(),
    }
}

async fn exists_on_disk(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

/// Catalog entry that is present, valid, and still on disk.
async fn available_file(catalog: &dyn FileCatalog, id: u64) -> Result<SharedFile, HandlerError> {
    let file = catalog
        .find_by_id(id)
        .await
        .filter(|file| file.valid)
        .ok_or(HandlerError::ResourceNotFound(id))?;
    if !exists_on_disk(&file.path).await {
        return Err(HandlerError::ResourceNotFound(id));
    }
    Ok(file)
}

/// `FindFile(query)`: files announced under the query's identifier that are still on disk.
pub struct FindFileHandler {
    catalog: Arc<dyn FileCatalog>,
}

impl FindFileHandler {
    pub fn new(catalog: Arc<dyn FileCatalog>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl MessageHandler for FindFileHandler {
    async fn handle(&self, remote: PeerId, msg: Message) -> Result<Reply, HandlerError> {
        let query = match msg {
            Message::FindFile { query } => query,
            other => return Err(HandlerError::UnknownMessageHandler(describe(&other))),
        };
        let identifier = ContentId::from_name(&query);
        let mut files = Vec::new();
        for file in self.catalog.find_by_identifier(&identifier).await {
            if exists_on_disk(&file.path).await {
                files.push(file.to_record());
            } else {
                tracing::debug!(file = file.id, path = %file.path.display(), "skipping stale catalog entry");
            }
        }
        tracing::debug!(peer = %remote, query = %query, found = files.len(), "find file");
        Ok(Reply::Single(Message::FoundFiles { files }))
    }
}

/// `GetFile(id)`: metadata of one file.
pub struct GetFileHandler {
    catalog: Arc<dyn FileCatalog>,
}

impl GetFileHandler {
    pub fn new(catalog: Arc<dyn FileCatalog>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl MessageHandler for GetFileHandler {
    async fn handle(&self, _remote: PeerId, msg: Message) -> Result<Reply, HandlerError> {
        let file_id = match msg {
            Message::GetFile { file_id } => file_id,
            other => return Err(HandlerError::UnknownMessageHandler(describe(&other))),
        };
        let file = available_file(self.catalog.as_ref(), file_id).await?;
        Ok(Reply::Single(Message::FileInfo {
            files: vec![file.to_record()],
        }))
    }
}

/// `GetFileContent(id, offset)`: the file's bytes from `offset` to end of file.
pub struct GetFileContentHandler {
    catalog: Arc<dyn FileCatalog>,
    chunk_size: usize,
}

impl GetFileContentHandler {
    pub fn new(catalog: Arc<dyn FileCatalog>) -> Self {
        Self {
            catalog,
            chunk_size: CONTENT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}

#[async_trait]
impl MessageHandler for GetFileContentHandler {
    async fn handle(&self, remote: PeerId, msg: Message) -> Result<Reply, HandlerError> {
        let (file_id, offset) = match msg {
            Message::GetFileContent { file_id, offset } => (file_id, offset),
            other => return Err(HandlerError::UnknownMessageHandler(describe(&other))),
        };
        let file = available_file(self.catalog.as_ref(), file_id).await?;
        let mut handle = tokio::fs::File::open(&file.path).await?;
        handle.seek(SeekFrom::Start(offset)).await?;
        tracing::debug!(peer = %remote, file = file_id, offset, "streaming file content");
        Ok(Reply::Stream(Box::new(FileChunks {
            file: Some(handle),
            buf: vec![0u8; self.chunk_size],
        })))
    }
}

/// Reads an open file to the end, one `FileContent` message per read.
struct FileChunks {
    file: Option<tokio::fs::File>,
    buf: Vec<u8>,
}

#[async_trait]
impl ReplyStream for FileChunks {
    async fn next(&mut self) -> Option<Result<Message, HandlerError>> {
        let file = self.file.as_mut()?;
        match file.read(&mut self.buf).await {
            Ok(0) => {
                self.file = None;
                None
            }
            Ok(n) => Some(Ok(Message::FileContent {
                content: self.buf[..n].to_vec(),
            })),
            Err(err) => {
                self.file = None;
                Some(Err(err.into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCatalog;

    fn temp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("peershare-handlers-{tag}-{nanos}"));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn shared(id: u64, name: &str, path: PathBuf, size: u64) -> SharedFile {
        SharedFile {
            id,
            identifier: ContentId::from_name(name),
            path,
            advertised_path: format!("{name}.bin"),
            mime: "application/octet-stream".into(),
            checksum: format!("sum-{id}"),
            size,
            valid: true,
            created_at: 0,
            updated_at: 0,
        }
    }

    async fn drain(reply: Reply) -> Vec<u8> {
        let Reply::Stream(mut stream) = reply else {
            panic!("expected a stream reply");
        };
        let mut out = Vec::new();
        while let Some(msg) = stream.next().await {
            match msg.unwrap() {
                Message::FileContent { content } => out.extend_from_slice(&content),
                other => panic!("unexpected {other:?}"),
            }
        }
        out
    }

    #[tokio::test]
    async fn find_file_drops_stale_entries() {
        let dir = temp_dir("find");
        let present = dir.join("present.bin");
        std::fs::write(&present, b"hello").unwrap();
        let catalog = MemoryCatalog::new(vec![
            shared(1, "foo", present, 5),
            shared(2, "foo", dir.join("gone.bin"), 5),
            shared(3, "bar", dir.join("other.bin"), 5),
        ]);
        let registry = HandlerRegistry::with_catalog(Arc::new(catalog));
        let reply = registry
            .dispatch(PeerId::generate(), Message::FindFile { query: "foo".into() })
            .await
            .unwrap();
        let Reply::Single(Message::FoundFiles { files }) = reply else {
            panic!("expected FoundFiles");
        };
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].id, 1);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn get_file_missing_or_invalid_is_not_found() {
        let dir = temp_dir("get");
        let path = dir.join("a.bin");
        std::fs::write(&path, b"abc").unwrap();
        let mut broken = shared(2, "b", path.clone(), 3);
        broken.valid = false;
        let registry = HandlerRegistry::with_catalog(Arc::new(MemoryCatalog::new(vec![
            shared(1, "a", path, 3),
            broken,
        ])));
        let peer = PeerId::generate();

        let ok = registry
            .dispatch(peer, Message::GetFile { file_id: 1 })
            .await
            .unwrap();
        assert!(matches!(ok, Reply::Single(Message::FileInfo { ref files }) if files.len() == 1));
        assert!(matches!(
            registry.dispatch(peer, Message::GetFile { file_id: 2 }).await,
            Err(HandlerError::ResourceNotFound(2))
        ));
        assert!(matches!(
            registry.dispatch(peer, Message::GetFile { file_id: 9 }).await,
            Err(HandlerError::ResourceNotFound(9))
        ));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn content_streams_from_offset_and_is_repeatable() {
        let dir = temp_dir("content");
        let path = dir.join("data.bin");
        let data: Vec<u8> = (0..1024u32).map(|i| (i % 256) as u8).collect();
        std::fs::write(&path, &data).unwrap();
        let catalog: Arc<dyn FileCatalog> =
            Arc::new(MemoryCatalog::new(vec![shared(5, "data", path, 1024)]));
        let handler = GetFileContentHandler::new(catalog).with_chunk_size(100);
        let peer = PeerId::generate();
        let req = Message::GetFileContent {
            file_id: 5,
            offset: 512,
        };

        let first = drain(handler.handle(peer, req.clone()).await.unwrap()).await;
        let second = drain(handler.handle(peer, req).await.unwrap()).await;
        assert_eq!(first, data[512..]);
        assert_eq!(first, second);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn unknown_kind_and_responses_are_rejected() {
        let registry = HandlerRegistry::new();
        let peer = PeerId::generate();
        assert!(matches!(
            registry.dispatch(peer, Message::GetFile { file_id: 1 }).await,
            Err(HandlerError::UnknownMessageHandler(_))
        ));
        let full = HandlerRegistry::with_catalog(Arc::new(MemoryCatalog::new(vec![])));
        assert!(matches!(
            full.dispatch(peer, Message::FoundFiles { files: vec![] }).await,
            Err(HandlerError::UnknownMessageHandler(_))
        ));
    }
}
