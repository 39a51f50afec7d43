//! In-process network: transports joined by `tokio::io::duplex` pipes, a shared provider
//! table, and a fixed file catalog. Used by tests and by embedders that run several nodes
//! in one process.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::cid::ContentId;
use crate::handlers::{FileCatalog, SharedFile};
use crate::identity::PeerId;
use crate::transport::{BoxedStream, ContentRouting, ProviderRecord, StreamHandler, Transport};

/// Bytes buffered in each direction of an in-process stream.
const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Default)]
struct NetworkState {
    handlers: HashMap<PeerId, HashMap<String, Arc<dyn StreamHandler>>>,
    providers: HashMap<Vec<u8>, Vec<PeerId>>,
}

/// Shared fabric. Cloning yields another handle to the same network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new peer with a fresh id.
    pub fn join(&self) -> MemoryTransport {
        let id = PeerId::generate();
        self.lock().handlers.entry(id).or_default();
        MemoryTransport {
            id,
            net: self.clone(),
        }
    }

    /// Take a peer off the network: dials to it fail and it stops providing anything.
    pub fn disconnect(&self, peer: &PeerId) {
        let mut state = self.lock();
        state.handlers.remove(peer);
        for providers in state.providers.values_mut() {
            providers.retain(|p| p != peer);
        }
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One peer's view of a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    id: PeerId,
    net: MemoryNetwork,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_peer(&self) -> PeerId {
        self.id
    }

    fn listen_addrs(&self) -> Vec<String> {
        vec![format!("/memory/{}", self.id)]
    }

    async fn dial(&self, peer: &PeerId, protocol: &str) -> io::Result<BoxedStream> {
        let handler = {
            let state = self.net.lock();
            let handlers = state.handlers.get(peer).ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotConnected, format!("unknown peer {peer}"))
            })?;
            handlers.get(protocol).cloned().ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("{peer} does not speak {protocol}"),
                )
            })?
        };
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let from = self.id;
        tokio::spawn(async move {
            handler.on_stream(from, Box::new(remote)).await;
        });
        Ok(Box::new(local))
    }

    fn handle(&self, protocol: &str, handler: Arc<dyn StreamHandler>) {
        self.net
            .lock()
            .handlers
            .entry(self.id)
            .or_default()
            .insert(protocol.to_string(), handler);
    }
}

#[async_trait]
impl ContentRouting for MemoryTransport {
    async fn provide(&self, key: &[u8]) -> io::Result<()> {
        let mut state = self.net.lock();
        if !state.handlers.contains_key(&self.id) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "peer has left the network",
            ));
        }
        let providers = state.providers.entry(key.to_vec()).or_default();
        if !providers.contains(&self.id) {
            providers.push(self.id);
        }
        Ok(())
    }

    async fn find_providers(&self, key: &[u8]) -> io::Result<mpsc::Receiver<ProviderRecord>> {
        let found: Vec<PeerId> = self
            .net
            .lock()
            .providers
            .get(key)
            .cloned()
            .unwrap_or_default();
        let (tx, rx) = mpsc::channel(found.len().max(1));
        for peer in found {
            let record = ProviderRecord {
                peer,
                addrs: vec![format!("/memory/{peer}")],
            };
            // Capacity covers every record, so this never waits.
            if tx.try_send(record).is_err() {
                break;
            }
        }
        Ok(rx)
    }
}

/// Catalog over a fixed list of shared files.
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    files: Vec<SharedFile>,
}

impl MemoryCatalog {
    pub fn new(files: Vec<SharedFile>) -> Self {
        Self { files }
    }

    pub fn files(&self) -> &[SharedFile] {
        &self.files
    }
}

#[async_trait]
impl FileCatalog for MemoryCatalog {
    async fn find_by_identifier(&self, identifier: &ContentId) -> Vec<SharedFile> {
        self.files
            .iter()
            .filter(|f| &f.identifier == identifier)
            .cloned()
            .collect()
    }

    async fn find_by_id(&self, id: u64) -> Option<SharedFile> {
        self.files.iter().find(|f| f.id == id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Upper;

    #[async_trait]
    impl StreamHandler for Upper {
        async fn on_stream(&self, _remote: PeerId, mut stream: BoxedStream) {
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            stream
                .write_all(&buf.to_ascii_uppercase())
                .await
                .unwrap();
            stream.shutdown().await.unwrap();
        }
    }

    #[tokio::test]
    async fn dial_reaches_registered_handler() {
        let net = MemoryNetwork::new();
        let a = net.join();
        let b = net.join();
        b.handle("/upper", Arc::new(Upper));

        let mut stream = a.dial(&b.local_peer(), "/upper").await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        stream.shutdown().await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"HELLO");

        assert!(a.dial(&b.local_peer(), "/other").await.is_err());
        assert!(a.dial(&PeerId::generate(), "/upper").await.is_err());
    }

    #[tokio::test]
    async fn providers_are_tracked_per_key() {
        let net = MemoryNetwork::new();
        let a = net.join();
        let b = net.join();
        b.provide(b"key").await.unwrap();
        b.provide(b"key").await.unwrap();

        let mut rx = a.find_providers(b"key").await.unwrap();
        assert_eq!(rx.recv().await.unwrap().peer, b.local_peer());
        assert!(rx.recv().await.is_none());
        assert!(a.find_providers(b"other").await.unwrap().recv().await.is_none());

        net.disconnect(&b.local_peer());
        assert!(a.find_providers(b"key").await.unwrap().recv().await.is_none());
        assert!(b.provide(b"key").await.is_err());
    }
}
