//! RPC engine: outbound request/response and streaming exchanges, inbound dispatch.
//!
//! One exchange per stream. The requester writes one frame and closes its write side;
//! the responder writes one or more frames and closes its write side.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::handlers::{HandlerRegistry, Reply};
use crate::identity::PeerId;
use crate::protocol::{Message, MessageKind, PROTOCOL_ID};
use crate::transport::{BoxedStream, StreamHandler, Transport};
use crate::wire::{self, FrameDecodeError, FrameReader};

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("peer unreachable: {0}")]
    PeerUnreachable(#[source] std::io::Error),
    #[error("stream closed before a response arrived")]
    NoResponse,
    #[error("more than one response to a single-response request")]
    TooManyResponses,
    #[error("remote error: {0}")]
    RemoteProtocolError(String),
    #[error("bad response stream: {0}")]
    Stream(#[from] FrameDecodeError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct RpcEngine {
    transport: Arc<dyn Transport>,
    registry: Arc<HandlerRegistry>,
}

impl RpcEngine {
    pub fn new(transport: Arc<dyn Transport>, registry: HandlerRegistry) -> Self {
        Self {
            transport,
            registry: Arc::new(registry),
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.transport.local_peer()
    }

    /// Start answering inbound streams on the PeerShare protocol id.
    pub fn register(self: &Arc<Self>) {
        let handler: Arc<dyn StreamHandler> = self.clone();
        self.transport.handle(PROTOCOL_ID, handler);
    }

    /// Dial, send `msg`, and close the write side.
    async fn open_exchange(&self, peer: &PeerId, msg: &Message) -> Result<BoxedStream, RpcError> {
        let mut stream = self
            .transport
            .dial(peer, PROTOCOL_ID)
            .await
            .map_err(RpcError::PeerUnreachable)?;
        wire::write_message(&mut stream, msg).await?;
        stream.shutdown().await?;
        Ok(stream)
    }

    /// Send `msg` and read exactly one response.
    pub async fn request(&self, peer: &PeerId, msg: &Message) -> Result<Message, RpcError> {
        let stream = self.open_exchange(peer, msg).await?;
        let mut reader = FrameReader::new(stream);
        let response = reader.next_message().await?.ok_or(RpcError::NoResponse)?;
        match reader.next_message().await {
            Ok(None) => {}
            Ok(Some(_)) | Err(FrameDecodeError::Truncated) => {
                return Err(RpcError::TooManyResponses)
            }
            Err(err) => return Err(err.into()),
        }
        match response {
            Message::Error { reason, .. } => Err(RpcError::RemoteProtocolError(reason)),
            other => Ok(other),
        }
    }

    /// Send `msg` and read responses until the remote closes its write side.
    pub async fn request_stream(
        &self,
        peer: &PeerId,
        msg: &Message,
    ) -> Result<ResponseStream, RpcError> {
        let stream = self.open_exchange(peer, msg).await?;
        Ok(ResponseStream {
            reader: FrameReader::new(stream),
            done: false,
        })
    }

    async fn serve_stream(&self, remote: PeerId, stream: BoxedStream) {
        let mut reader = FrameReader::new(stream);
        let request = match reader.next_message().await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => {
                tracing::debug!(peer = %remote, "stream closed before a request arrived");
                return;
            }
            Err(err) => Err(err),
        };
        let mut stream = reader.into_inner();
        let outcome = match request {
            Ok(msg) => self.answer(remote, msg, &mut stream).await,
            Err(err) => {
                tracing::debug!(peer = %remote, error = %err, "unreadable request");
                wire::write_message(&mut stream, &Message::error(None, err.to_string())).await
            }
        };
        if let Err(err) = outcome {
            tracing::debug!(peer = %remote, error = %err, "failed to write response");
        }
        let _ = stream.shutdown().await;
    }

    async fn answer(
        &self,
        remote: PeerId,
        msg: Message,
        stream: &mut BoxedStream,
    ) -> std::io::Result<()> {
        let kind = msg.kind();
        match self.registry.dispatch(remote, msg).await {
            Ok(Reply::Single(response)) => wire::write_message(stream, &response).await,
            Ok(Reply::Stream(_)) if !kind.is_some_and(MessageKind::is_streaming) => {
                tracing::warn!(peer = %remote, kind = ?kind, "handler streamed a single-response request");
                write_error(stream, kind, "handler produced a stream for a single-response request".into())
                    .await
            }
            Ok(Reply::Stream(mut responses)) => {
                while let Some(item) = responses.next().await {
                    match item {
                        Ok(response) => wire::write_message(stream, &response).await?,
                        Err(err) => {
                            tracing::warn!(peer = %remote, error = %err, "response stream failed");
                            return write_error(stream, kind, err.to_string()).await;
                        }
                    }
                }
                Ok(())
            }
            Err(err) => {
                tracing::debug!(peer = %remote, error = %err, "request rejected");
                write_error(stream, kind, err.to_string()).await
            }
        }
    }
}

async fn write_error(
    stream: &mut BoxedStream,
    kind: Option<MessageKind>,
    reason: String,
) -> std::io::Result<()> {
    wire::write_message(stream, &Message::error(kind, reason)).await
}

#[async_trait]
impl StreamHandler for RpcEngine {
    async fn on_stream(&self, remote: PeerId, stream: BoxedStream) {
        self.serve_stream(remote, stream).await;
    }
}

/// Responses of a streaming exchange, decoded one frame at a time.
pub struct ResponseStream {
    reader: FrameReader<BoxedStream>,
    done: bool,
}

impl ResponseStream {
    /// Next response, or `None` once the remote has closed its write side.
    pub async fn next(&mut self) -> Option<Result<Message, RpcError>> {
        if self.done {
            return None;
        }
        match self.reader.next_message().await {
            Ok(Some(msg)) => Some(Ok(msg)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err.into()))
            }
        }
    }

    /// Release the stream, drained or not.
    pub async fn close(mut self) {
        let _ = self.reader.get_mut().shutdown().await;
    }
}
