//! TCP stream transport: one connection per stream, opened with a protocol handshake.
//!
//! Dialer sends `<varint len><protocol id><16-byte peer id>`; the acceptor answers one byte
//! (`ACCEPTED`) if it has a handler for the protocol, otherwise closes the connection.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use peershare_core::transport::{BoxedStream, StreamHandler, Transport};
use peershare_core::wire::{decode_varint, encode_varint};
use peershare_core::PeerId;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;

const ACCEPTED: u8 = 1;
const MAX_PROTOCOL_LEN: u64 = 256;
const MAX_VARINT_LEN: usize = 10;

/// Last known transport address per peer, filled in by LAN discovery.
#[derive(Clone, Default)]
pub struct AddressBook {
    addrs: Arc<RwLock<HashMap<PeerId, SocketAddr>>>,
}

impl AddressBook {
    pub async fn insert(&self, peer: PeerId, addr: SocketAddr) {
        self.addrs.write().await.insert(peer, addr);
    }

    pub async fn get(&self, peer: &PeerId) -> Option<SocketAddr> {
        self.addrs.read().await.get(peer).copied()
    }

    pub async fn remove(&self, peer: &PeerId) {
        self.addrs.write().await.remove(peer);
    }
}

type Handlers = Arc<Mutex<HashMap<String, Arc<dyn StreamHandler>>>>;

pub struct TcpTransport {
    local: PeerId,
    listen_addr: SocketAddr,
    book: AddressBook,
    handlers: Handlers,
}

impl TcpTransport {
    pub fn new(local: PeerId, listen_addr: SocketAddr, book: AddressBook) -> Self {
        Self {
            local,
            listen_addr,
            book,
            handlers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn handler_for(&self, protocol: &str) -> Option<Arc<dyn StreamHandler>> {
        self.handlers.lock().ok()?.get(protocol).cloned()
    }

    /// Accept loop. Each connection is handshaken and handed to its protocol handler.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        loop {
            let (stream, from) = listener.accept().await?;
            let transport = self.clone();
            tokio::spawn(async move {
                if let Err(err) = transport.accept_stream(stream).await {
                    tracing::debug!(from = %from, error = %err, "inbound handshake failed");
                }
            });
        }
    }

    async fn accept_stream(&self, mut stream: TcpStream) -> io::Result<()> {
        let protocol = read_protocol(&mut stream).await?;
        let mut id = [0u8; 16];
        stream.read_exact(&mut id).await?;
        let remote = PeerId::from_bytes(id);
        let Some(handler) = self.handler_for(&protocol) else {
            tracing::debug!(peer = %remote, protocol = %protocol, "no handler for protocol");
            return Ok(());
        };
        stream.write_all(&[ACCEPTED]).await?;
        stream.set_nodelay(true)?;
        handler.on_stream(remote, Box::new(stream)).await;
        Ok(())
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    fn listen_addrs(&self) -> Vec<String> {
        vec![format!("/tcp/{}", self.listen_addr)]
    }

    async fn dial(&self, peer: &PeerId, protocol: &str) -> io::Result<BoxedStream> {
        let addr = self.book.get(peer).await.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no known address for {peer}"))
        })?;
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        stream.write_all(&handshake_bytes(protocol, &self.local)).await?;
        let mut ack = [0u8; 1];
        match stream.read_exact(&mut ack).await {
            Ok(_) if ack[0] == ACCEPTED => Ok(Box::new(stream)),
            Ok(_) => Err(io::Error::new(io::ErrorKind::InvalidData, "bad handshake reply")),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{peer} refused {protocol}"),
            )),
            Err(err) => Err(err),
        }
    }

    fn handle(&self, protocol: &str, handler: Arc<dyn StreamHandler>) {
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.insert(protocol.to_string(), handler);
        }
    }
}

fn handshake_bytes(protocol: &str, local: &PeerId) -> Vec<u8> {
    let mut out = Vec::with_capacity(MAX_VARINT_LEN + protocol.len() + 16);
    encode_varint(protocol.len() as u64, &mut out);
    out.extend_from_slice(protocol.as_bytes());
    out.extend_from_slice(local.as_bytes());
    out
}

async fn read_protocol(stream: &mut TcpStream) -> io::Result<String> {
    let mut prefix = Vec::with_capacity(MAX_VARINT_LEN);
    let len = loop {
        if prefix.len() >= MAX_VARINT_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "length prefix too long"));
        }
        prefix.push(stream.read_u8().await?);
        match decode_varint(&prefix) {
            Ok(Some((len, _))) => break len,
            Ok(None) => continue,
            Err(err) => return Err(io::Error::new(io::ErrorKind::InvalidData, err)),
        }
    };
    if len > MAX_PROTOCOL_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "protocol id too long"));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
