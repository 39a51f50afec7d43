//! Peer identity: opaque peer id and the descriptor handed out by discovery.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Peer ID (16 bytes). Opaque to the core; displayed and parsed as lowercase hex.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PeerId(#[serde(with = "bytes_16")] [u8; 16]);

mod bytes_16 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 16], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 16], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 16 bytes"))
    }
}

impl PeerId {
    /// Generate a new random peer id for a node that has none yet.
    pub fn generate() -> Self {
        PeerId(rand::random())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid peer id: {0}")]
pub struct ParsePeerIdError(String);

impl FromStr for PeerId {
    type Err = ParsePeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut out = [0u8; 16];
        hex::decode_to_slice(s, &mut out).map_err(|e| ParsePeerIdError(format!("{s}: {e}")))?;
        Ok(PeerId(out))
    }
}

/// A peer as seen by this node. Built fresh per discovery result or per "self" query; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDescriptor {
    pub id: PeerId,
    /// True only for the descriptor of this node.
    pub is_local: bool,
    pub reachable: bool,
    /// Whether the active connection to the peer goes through a relay.
    pub relayed: bool,
    /// Network addresses as reported by the routing layer (opaque strings).
    pub addrs: Vec<String>,
}

impl PeerDescriptor {
    /// Descriptor for this node.
    pub fn local(id: PeerId, addrs: Vec<String>) -> Self {
        Self {
            id,
            is_local: true,
            reachable: true,
            relayed: false,
            addrs,
        }
    }

    /// Descriptor for a remote peer known only by id (e.g. from a persisted download record).
    pub fn remote(id: PeerId) -> Self {
        Self {
            id,
            is_local: false,
            reachable: true,
            relayed: false,
            addrs: Vec::new(),
        }
    }
}
