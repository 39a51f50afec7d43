//! PeerShare core: content identifiers, the request/stream protocol over peer streams,
//! and the resumable download engine.
//! Networking, routing and the file catalog are supplied by the host through traits.

pub mod cid;
pub mod discovery;
pub mod download;
pub mod events;
pub mod handlers;
pub mod identity;
pub mod memory;
pub mod protocol;
pub mod rpc;
pub mod search;
pub mod store;
pub mod transport;
pub mod wire;

pub use cid::{checksum_file, ContentChecksum, ContentId};
pub use discovery::{DiscoveryGateway, Providers};
pub use download::{DownloadEngine, DownloadError, DownloadState};
pub use events::{ChannelSink, EventSink, NodeEvent, NullSink};
pub use handlers::{FileCatalog, HandlerError, HandlerRegistry, SharedFile};
pub use identity::{PeerDescriptor, PeerId};
pub use protocol::{FileRecord, Message, MessageKind, PROTOCOL_ID};
pub use rpc::{RpcEngine, RpcError};
pub use search::{ProviderOutcome, ProviderResult, Search, SearchConfig};
pub use store::{
    DownloadId, DownloadRecord, DownloadStatus, DownloadStore, JsonDownloadStore,
    MemoryDownloadStore,
};
pub use transport::{ContentRouting, Transport};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
