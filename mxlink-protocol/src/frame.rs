//! Length-prefixed framing.
//!
//! ```text
//! [length: u32 BE][kind: u8][id: u64 BE][payload: length - 9 bytes]
//! ```
//!
//! `id` is the correlation ID for requests and responses, the listener ID
//! for notifications, and zero for handshake and close frames. The payload
//! is an opaque blob produced by a [`PayloadCodec`](crate::PayloadCodec).
//!
//! Before the first frame the client writes a 4-byte channel token
//! ([`CHANNEL_TOKEN`]) so a multi-protocol listener can recognize this
//! transport.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, ProtocolResult};

/// Channel identifier written by the client before any frame ("MXLK").
pub const CHANNEL_TOKEN: u32 = 0x4D58_4C4B;

/// Size of the kind + id header counted in the length prefix.
pub const HEADER_LEN: usize = 9;

/// Default upper bound on a frame's length prefix.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Message kind discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    Handshake = 0,
    Request = 1,
    Response = 2,
    Notification = 3,
    Close = 4,
}

impl FrameKind {
    pub fn from_byte(byte: u8) -> ProtocolResult<Self> {
        match byte {
            0 => Ok(Self::Handshake),
            1 => Ok(Self::Request),
            2 => Ok(Self::Response),
            3 => Ok(Self::Notification),
            4 => Ok(Self::Close),
            kind => Err(ProtocolError::UnknownFrameKind { kind }),
        }
    }
}

/// One framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub id: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: FrameKind, id: u64, payload: Vec<u8>) -> Self {
        Self { kind, id, payload }
    }

    pub fn request(correlation_id: u64, payload: Vec<u8>) -> Self {
        Self::new(FrameKind::Request, correlation_id, payload)
    }

    pub fn response(correlation_id: u64, payload: Vec<u8>) -> Self {
        Self::new(FrameKind::Response, correlation_id, payload)
    }

    pub fn notification(listener_id: u64, payload: Vec<u8>) -> Self {
        Self::new(FrameKind::Notification, listener_id, payload)
    }

    pub fn close() -> Self {
        Self::new(FrameKind::Close, 0, Vec::new())
    }

    /// Value of the length prefix: header plus payload.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Fails with [`ProtocolError::FrameTooLarge`] if a reader bounded by
    /// `limit` would reject this frame.
    pub fn check_size(&self, limit: usize) -> ProtocolResult<()> {
        let size = self.wire_len();
        if size > limit {
            return Err(ProtocolError::FrameTooLarge { size, limit });
        }
        Ok(())
    }

    /// Encodes the frame into one contiguous buffer, so a single
    /// `write_all` puts it on the wire.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let size = self.wire_len();
        let length = u32::try_from(size).map_err(|_| ProtocolError::FrameTooLarge {
            size,
            limit: u32::MAX as usize,
        })?;
        let mut buf = Vec::with_capacity(4 + size);
        buf.extend_from_slice(&length.to_be_bytes());
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }
}

/// Reads one frame. A frame whose length prefix exceeds `max_frame_size`
/// is rejected before its body is read.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> ProtocolResult<Frame>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let length = reader.read_u32().await? as usize;
    if length < HEADER_LEN {
        return Err(ProtocolError::Truncated { length });
    }
    if length > max_frame_size {
        return Err(ProtocolError::FrameTooLarge {
            size: length,
            limit: max_frame_size,
        });
    }
    let kind = FrameKind::from_byte(reader.read_u8().await?)?;
    let id = reader.read_u64().await?;
    let mut payload = vec![0u8; length - HEADER_LEN];
    reader.read_exact(&mut payload).await?;
    Ok(Frame { kind, id, payload })
}

/// Writes one frame and flushes. Nothing is written if the frame cannot be
/// encoded.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let buf = frame.encode()?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Writes the channel token.
pub async fn write_channel_token<W>(writer: &mut W) -> ProtocolResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_u32(CHANNEL_TOKEN).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads and checks the channel token.
pub async fn read_channel_token<R>(reader: &mut R) -> ProtocolResult<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let found = reader.read_u32().await?;
    if found != CHANNEL_TOKEN {
        return Err(ProtocolError::BadChannelToken { found });
    }
    Ok(())
}
