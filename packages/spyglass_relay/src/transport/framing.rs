//! Frame codec for the engine link.
//!
//! Wire format: 4-byte big-endian payload length, 1-byte frame kind, payload.
//! Display updates are carried opaquely in `Message` frames; the relay never
//! looks past the 16-byte session-id prefix.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransportError;

/// Upper bound on a single frame payload. Full-screen updates are large but
/// the engine chunks anything bigger than this.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Relay -> engine, first frame after dialing.
    Hello = 0x01,
    /// Engine -> relay, answers `Hello` with the engine's serializer name.
    HelloAck = 0x02,
    Ping = 0x03,
    Pong = 0x04,
    /// Relay -> engine instruction expecting exactly one `Response`.
    Request = 0x05,
    Response = 0x06,
    /// Engine -> relay published display message, session-id prefixed.
    Message = 0x07,
}

impl FrameKind {
    fn from_byte(byte: u8) -> Result<Self, TransportError> {
        match byte {
            0x01 => Ok(FrameKind::Hello),
            0x02 => Ok(FrameKind::HelloAck),
            0x03 => Ok(FrameKind::Ping),
            0x04 => Ok(FrameKind::Pong),
            0x05 => Ok(FrameKind::Request),
            0x06 => Ok(FrameKind::Response),
            0x07 => Ok(FrameKind::Message),
            other => Err(TransportError::UnknownFrameKind(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: Vec<u8>) -> Self {
        Frame { kind, payload }
    }

    pub fn empty(kind: FrameKind) -> Self {
        Frame {
            kind,
            payload: Vec::new(),
        }
    }
}

pub async fn write_frame<S>(stream: &mut S, frame: &Frame) -> Result<(), TransportError>
where
    S: AsyncWrite + Unpin,
{
    if frame.payload.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: frame.payload.len(),
            limit: MAX_FRAME_SIZE,
        });
    }

    let len = frame.payload.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&[frame.kind as u8]).await?;
    stream.write_all(&frame.payload).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn read_frame<S>(stream: &mut S) -> Result<Frame, TransportError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await?;

    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: len,
            limit: MAX_FRAME_SIZE,
        });
    }
    let kind = FrameKind::from_byte(header[4])?;

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(Frame { kind, payload })
}
