//! Content identifiers: name-derived discovery keys and byte-derived checksums.
//!
//! Both are CIDv1 values over a SHA-256 multihash:
//! `<version-varint> <codec-varint> <hash-fn-varint> <digest-len-varint> <digest>`.
//! The name identifier hashes the JSON document `{"name": <name>}` under the json codec;
//! the checksum hashes raw bytes under the raw codec, so the two never compare equal.
//! The string form is the base16 multibase encoding (`f` + lowercase hex).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::wire::{decode_varint, encode_varint};

const CID_VERSION: u64 = 1;

/// Multicodec for JSON documents.
const JSON_CODEC: u64 = 0x0200;

/// Multicodec for raw bytes.
const RAW_CODEC: u64 = 0x55;

/// Multicodec for SHA2-256.
const SHA2_256: u64 = 0x12;

const DIGEST_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CidError {
    #[error("missing multibase prefix")]
    Multibase,
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("malformed cid: {0}")]
    Malformed(String),
    #[error("unexpected codec {found:#x} (expected {expected:#x})")]
    Codec { expected: u64, found: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Cid {
    codec: u64,
    digest: [u8; DIGEST_LEN],
}

impl Cid {
    fn to_bytes(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + DIGEST_LEN);
        encode_varint(CID_VERSION, &mut buf);
        encode_varint(self.codec, &mut buf);
        encode_varint(SHA2_256, &mut buf);
        encode_varint(DIGEST_LEN as u64, &mut buf);
        buf.extend_from_slice(&self.digest);
        buf
    }

    fn from_bytes(bytes: &[u8], expected_codec: u64) -> Result<Self, CidError> {
        let mut offset = 0;
        let mut next = |what: &str| -> Result<u64, CidError> {
            let (v, n) = decode_varint(&bytes[offset..])
                .map_err(|e| CidError::Malformed(format!("{what}: {e}")))?
                .ok_or_else(|| CidError::Malformed(format!("{what}: truncated")))?;
            offset += n;
            Ok(v)
        };
        let version = next("version")?;
        if version != CID_VERSION {
            return Err(CidError::Malformed(format!("unsupported version {version}")));
        }
        let codec = next("codec")?;
        if codec != expected_codec {
            return Err(CidError::Codec {
                expected: expected_codec,
                found: codec,
            });
        }
        if next("hash function")? != SHA2_256 {
            return Err(CidError::Malformed("unsupported hash function".into()));
        }
        if next("digest length")? != DIGEST_LEN as u64 {
            return Err(CidError::Malformed("unexpected digest length".into()));
        }
        let digest: [u8; DIGEST_LEN] = bytes[offset..]
            .try_into()
            .map_err(|_| CidError::Malformed("digest length mismatch".into()))?;
        Ok(Cid { codec, digest })
    }

    fn parse(s: &str, expected_codec: u64) -> Result<Self, CidError> {
        let digits = s.strip_prefix('f').ok_or(CidError::Multibase)?;
        Self::from_bytes(&hex::decode(digits)?, expected_codec)
    }

    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", hex::encode(self.to_bytes()))
    }
}

#[derive(Serialize)]
struct NameDocument<'a> {
    name: &'a str,
}

/// Discovery key derived from a human name. Same name, same identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentId(Cid);

impl ContentId {
    pub fn from_name(name: &str) -> Self {
        // A single string field cannot fail to serialize.
        let doc = serde_json::to_vec(&NameDocument { name }).unwrap_or_default();
        ContentId(Cid {
            codec: JSON_CODEC,
            digest: Sha256::digest(&doc).into(),
        })
    }

    /// Binary CID, the key handed to the routing layer.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CidError> {
        Cid::from_bytes(bytes, JSON_CODEC).map(ContentId)
    }

    pub fn digest(&self) -> &[u8; 32] {
        &self.0.digest
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ContentId {
    type Err = CidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Cid::parse(s, JSON_CODEC).map(ContentId)
    }
}

/// Digest over raw file bytes, used for dedup and integrity. Never a discovery key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentChecksum(Cid);

impl ContentChecksum {
    pub fn from_bytes(content: &[u8]) -> Self {
        let mut hasher = ChecksumHasher::new();
        hasher.update(content);
        hasher.finalize()
    }

    pub fn digest(&self) -> &[u8; 32] {
        &self.0.digest
    }
}

impl fmt::Display for ContentChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ContentChecksum {
    type Err = CidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Cid::parse(s, RAW_CODEC).map(ContentChecksum)
    }
}

/// Incremental checksum for files too large to hold in memory.
#[derive(Default)]
pub struct ChecksumHasher(Sha256);

impl ChecksumHasher {
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    pub fn finalize(self) -> ContentChecksum {
        ContentChecksum(Cid {
            codec: RAW_CODEC,
            digest: self.0.finalize().into(),
        })
    }
}

/// Checksum a file on disk, reading it in blocks.
pub async fn checksum_file(path: &std::path::Path) -> std::io::Result<ContentChecksum> {
    use tokio::io::AsyncReadExt;

    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = ChecksumHasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}
