//! Length-prefixed framing for the worker link.
//!
//! Each frame is a big-endian `u32` byte count followed by a JSON-encoded
//! [`RoutedMessage`].

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransportError;
use crate::routed::RoutedMessage;

/// Largest accepted frame payload in bytes.
pub const MAX_FRAME_LEN: usize = 1_048_576;

/// Parses a big-endian 4-byte length prefix.
fn parse_frame_len(len_buf: [u8; 4]) -> usize {
    u32::from_be_bytes(len_buf) as usize
}

/// Validates a frame size against [`MAX_FRAME_LEN`].
fn ensure_frame_len(len: usize) -> Result<(), TransportError> {
    if len > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(len));
    }
    Ok(())
}

/// Reads one frame. Returns `Ok(None)` when the peer closed cleanly between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = parse_frame_len(len_buf);
    ensure_frame_len(len)?;

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Writes one frame and flushes.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    ensure_frame_len(payload.len())?;
    writer
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads and decodes one routed message.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<RoutedMessage>, TransportError>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader).await? {
        Some(bytes) => RoutedMessage::decode(&bytes)
            .map(Some)
            .map_err(|e| TransportError::InvalidFrame(e.to_string())),
        None => Ok(None),
    }
}

/// Encodes and writes one routed message.
pub async fn write_message<W>(writer: &mut W, message: &RoutedMessage) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = message
        .encode()
        .map_err(|e| TransportError::InvalidFrame(e.to_string()))?;
    write_frame(writer, &bytes).await
}
