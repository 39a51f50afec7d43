//! Capabilities the core needs from the peer-to-peer networking layer.
//!
//! The core never dials sockets itself. It opens protocol streams to peer ids and asks a
//! routing layer who provides a key; everything below that (addresses, NAT, relays) belongs
//! to whatever implements these traits.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::identity::PeerId;

/// A bidirectional byte stream to one peer. Closing the write side is `shutdown()`.
pub trait PeerStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> PeerStream for T {}

pub type BoxedStream = Box<dyn PeerStream>;

/// Receives inbound streams opened by remote peers for a registered protocol.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn on_stream(&self, remote: PeerId, stream: BoxedStream);
}

/// Stream transport: dial out, accept in.
#[async_trait]
pub trait Transport: Send + Sync {
    fn local_peer(&self) -> PeerId;

    /// Addresses this node can be reached on, as opaque strings.
    fn listen_addrs(&self) -> Vec<String> {
        Vec::new()
    }

    async fn dial(&self, peer: &PeerId, protocol: &str) -> io::Result<BoxedStream>;

    /// Route every inbound stream for `protocol` to `handler`. Replaces any earlier handler.
    fn handle(&self, protocol: &str, handler: Arc<dyn StreamHandler>);
}

/// A peer that claimed to provide a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderRecord {
    pub peer: PeerId,
    pub addrs: Vec<String>,
}

/// Provider routing keyed by opaque bytes.
#[async_trait]
pub trait ContentRouting: Send + Sync {
    async fn provide(&self, key: &[u8]) -> io::Result<()>;

    /// Providers as they are found. The sender side closes when the lookup is exhausted;
    /// callers impose their own deadline.
    async fn find_providers(&self, key: &[u8]) -> io::Result<mpsc::Receiver<ProviderRecord>>;
}
