//! PeerShare wire protocol: message types, envelope encoding and the protocol id.

use serde::{Deserialize, Serialize};

/// Protocol id announced to the stream transport.
pub const PROTOCOL_ID: &str = "/peershare/1.0.0";

/// Declared type of an exchange. Requests and their responses share the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    FindFile = 1,
    GetFile = 2,
    GetFileContent = 3,
}

impl MessageKind {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::FindFile),
            2 => Some(Self::GetFile),
            3 => Some(Self::GetFileContent),
            _ => None,
        }
    }

    /// True for exchanges answered by a sequence of frames rather than exactly one.
    pub fn is_streaming(self) -> bool {
        matches!(self, Self::GetFileContent)
    }
}

/// File metadata as advertised by the answering peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: u64,
    /// Path as the remote wants it shown; only its file name is used locally.
    pub path: String,
    pub mime: String,
    pub checksum: String,
    pub size: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

/// All protocol messages. One exchange = one request + zero or more responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    FindFile { query: String },
    GetFile { file_id: u64 },
    GetFileContent { file_id: u64, offset: u64 },
    /// Answer to `FindFile`.
    FoundFiles { files: Vec<FileRecord> },
    /// Answer to `GetFile`.
    FileInfo { files: Vec<FileRecord> },
    /// One chunk of a `GetFileContent` answer. Chunk sizes carry no meaning.
    FileContent { content: Vec<u8> },
    /// Protocol-level failure of the exchange. `kind` is absent when the request tag was unreadable.
    Error {
        kind: Option<MessageKind>,
        reason: String,
    },
}

impl Message {
    pub fn kind(&self) -> Option<MessageKind> {
        match self {
            Message::FindFile { .. } | Message::FoundFiles { .. } => Some(MessageKind::FindFile),
            Message::GetFile { .. } | Message::FileInfo { .. } => Some(MessageKind::GetFile),
            Message::GetFileContent { .. } | Message::FileContent { .. } => {
                Some(MessageKind::GetFileContent)
            }
            Message::Error { kind, .. } => *kind,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Message::FindFile { .. } | Message::GetFile { .. } | Message::GetFileContent { .. }
        )
    }

    pub fn error(kind: Option<MessageKind>, reason: impl Into<String>) -> Self {
        Message::Error {
            kind,
            reason: reason.into(),
        }
    }
}

/// Message could not be decoded: unknown tag, missing field, or bad bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed message: {0}")]
pub struct MalformedMessage(pub String);

/// Flat envelope as it goes over the wire. Absent fields encode as a single `None` byte.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Envelope {
    kind: u8,
    query: Option<String>,
    file_id: Option<u64>,
    offset: Option<u64>,
    files: Vec<FileRecord>,
    content: Option<Vec<u8>>,
    error: Option<String>,
}

impl From<&Message> for Envelope {
    fn from(msg: &Message) -> Self {
        let kind = msg.kind().map(|k| k as u8).unwrap_or(0);
        let mut env = Envelope {
            kind,
            ..Envelope::default()
        };
        match msg {
            Message::FindFile { query } => env.query = Some(query.clone()),
            Message::GetFile { file_id } => env.file_id = Some(*file_id),
            Message::GetFileContent { file_id, offset } => {
                env.file_id = Some(*file_id);
                env.offset = Some(*offset);
            }
            Message::FoundFiles { files } | Message::FileInfo { files } => {
                env.files = files.clone();
            }
            Message::FileContent { content } => env.content = Some(content.clone()),
            Message::Error { reason, .. } => env.error = Some(reason.clone()),
        }
        env
    }
}

impl Envelope {
    fn into_message(self) -> Result<Message, MalformedMessage> {
        let env = self;
        let kind = MessageKind::from_tag(env.kind);
        if let Some(reason) = env.error {
            return Ok(Message::Error { kind, reason });
        }
        let kind =
            kind.ok_or_else(|| MalformedMessage(format!("unknown message tag {}", env.kind)))?;
        let has_request_fields = env.query.is_some() || env.file_id.is_some();
        if has_request_fields && (!env.files.is_empty() || env.content.is_some()) {
            return Err(MalformedMessage(format!(
                "{kind:?} carries both request and response fields"
            )));
        }
        match kind {
            MessageKind::FindFile => match env.query {
                Some(query) => Ok(Message::FindFile { query }),
                None if env.file_id.is_none() => Ok(Message::FoundFiles { files: env.files }),
                None => Err(MalformedMessage("FindFile carries a file id".into())),
            },
            MessageKind::GetFile => match env.file_id {
                Some(file_id) => Ok(Message::GetFile { file_id }),
                None if env.query.is_none() => Ok(Message::FileInfo { files: env.files }),
                None => Err(MalformedMessage("GetFile carries a query".into())),
            },
            MessageKind::GetFileContent => match (env.file_id, env.content) {
                (Some(file_id), None) => Ok(Message::GetFileContent {
                    file_id,
                    offset: env.offset.unwrap_or(0),
                }),
                (None, Some(content)) => Ok(Message::FileContent { content }),
                _ => Err(MalformedMessage(
                    "GetFileContent needs either a file id or content".into(),
                )),
            },
        }
    }
}

/// Encode a message envelope (bincode). No length prefix; see the wire module.
pub fn encode(msg: &Message) -> Vec<u8> {
    // Envelope holds only owned plain data; bincode serialization into a Vec cannot fail.
    bincode::serialize(&Envelope::from(msg)).unwrap_or_default()
}

/// Decode one message envelope.
pub fn decode(bytes: &[u8]) -> Result<Message, MalformedMessage> {
    let env: Envelope =
        bincode::deserialize(bytes).map_err(|e| MalformedMessage(e.to_string()))?;
    env.into_message()
}
