//! Framing: unsigned varint length prefix + encoded message.
//!
//! `decode_frame` works on whatever bytes have arrived so far and reports `NeedMore`
//! until a whole frame is buffered, so a stream never has to be read to the end first.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::{self, MalformedMessage, Message};

/// Longest accepted frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024; // 16 MiB

/// A u64 never needs more than ten LEB128 bytes.
const MAX_VARINT_LEN: usize = 10;

/// Append `value` as an unsigned varint (LEB128).
pub fn encode_varint(mut value: u64, buf: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decode an unsigned varint from the front of `data`.
/// `Ok(None)` means the varint is not complete yet.
pub fn decode_varint(data: &[u8]) -> Result<Option<(u64, usize)>, FrameDecodeError> {
    let mut value: u64 = 0;
    for (i, &byte) in data.iter().enumerate().take(MAX_VARINT_LEN) {
        value |= ((byte & 0x7F) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if data.len() >= MAX_VARINT_LEN {
        return Err(FrameDecodeError::BadLength);
    }
    Ok(None)
}

/// Encode a message into a single frame: varint length + envelope.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = protocol::encode(msg);
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(MAX_VARINT_LEN + payload.len());
    encode_varint(payload.len() as u64, &mut out);
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a message into a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the message and the number of bytes consumed.
/// Call with a partial buffer; `NeedMore` means try again after more data arrives.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    let (body, consumed) = split_frame(bytes)?.ok_or(FrameDecodeError::NeedMore)?;
    let msg = protocol::decode(body)?;
    Ok((msg, consumed))
}

/// Locate the first complete frame body without decoding it.
fn split_frame(bytes: &[u8]) -> Result<Option<(&[u8], usize)>, FrameDecodeError> {
    let Some((len, prefix)) = decode_varint(bytes)? else {
        return Ok(None);
    };
    let len = usize::try_from(len).map_err(|_| FrameDecodeError::TooLarge)?;
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < prefix + len {
        return Ok(None);
    }
    Ok(Some((&bytes[prefix..prefix + len], prefix + len)))
}

/// Error decoding a frame (need more bytes, bad prefix, too large, or bad envelope).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("invalid length prefix")]
    BadLength,
    #[error("frame too large")]
    TooLarge,
    #[error(transparent)]
    Malformed(#[from] MalformedMessage),
    #[error("stream ended inside a frame")]
    Truncated,
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Pulls frames off a byte stream one at a time, keeping any bytes read past the current frame.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    scratch: Box<[u8]>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            scratch: vec![0u8; 64 * 1024].into_boxed_slice(),
        }
    }

    /// Next decoded message. `Ok(None)` when the remote closed its write side on a frame boundary.
    pub async fn next_message(&mut self) -> Result<Option<Message>, FrameDecodeError> {
        loop {
            if let Some((body, consumed)) = split_frame(&self.buf)? {
                let decoded = protocol::decode(body);
                self.buf.drain(..consumed);
                return Ok(Some(decoded?));
            }
            let n = self.inner.read(&mut self.scratch).await?;
            if n == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(FrameDecodeError::Truncated)
                };
            }
            self.buf.extend_from_slice(&self.scratch[..n]);
        }
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Frame and write one message, then flush.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Message,
) -> std::io::Result<()> {
    let frame = encode_frame(msg)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(&frame).await?;
    writer.flush().await
}
