//! Message framing for length-prefixed protocol
//!
//! Format: [4 bytes little-endian length][JSON payload]

use std::io;
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::game::constants::net::MAX_MESSAGE_SIZE;
use crate::net::protocol::{encode, CodecError};

/// Errors that can occur during message framing
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {0} bytes (max {1})")]
    MessageTooLarge(usize, usize),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Read a length-prefixed message from a stream
pub async fn read_message<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>, FramingError> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(FramingError::ConnectionClosed);
        }
        Err(e) => return Err(FramingError::Io(e)),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(FramingError::MessageTooLarge(len, MAX_MESSAGE_SIZE));
    }
    if len == 0 {
        return Ok(Vec::new());
    }

    let mut buf = vec![0u8; len];
    match stream.read_exact(&mut buf).await {
        Ok(_) => Ok(buf),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(FramingError::ConnectionClosed),
        Err(e) => Err(FramingError::Io(e)),
    }
}

/// Write a length-prefixed message to a stream
pub async fn write_message<W: AsyncWrite + Unpin>(
    stream: &mut W,
    data: &[u8],
) -> Result<(), FramingError> {
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(FramingError::MessageTooLarge(data.len(), MAX_MESSAGE_SIZE));
    }
    stream.write_all(&(data.len() as u32).to_le_bytes()).await?;
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(())
}

/// Encode a message into a complete frame (prefix included), ready to be
/// shared across outbound queues and written with one `write_all`.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Arc<[u8]>, FramingError> {
    let payload = encode(message)?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(FramingError::MessageTooLarge(payload.len(), MAX_MESSAGE_SIZE));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame.into())
}

/// Write a frame produced by [`encode_frame`]
pub async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, frame: &[u8]) -> Result<(), FramingError> {
    stream.write_all(frame).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::{decode, ServerMessage};
    use std::io::Cursor;

    fn prefixed(payload: &[u8]) -> Vec<u8> {
        let mut buf = (payload.len() as u32).to_le_bytes().to_vec();
        buf.extend_from_slice(payload);
        buf
    }

    #[tokio::test]
    async fn test_read_write_message() {
        let mut buffer = Vec::new();
        write_message(&mut buffer, b"hello").await.unwrap();
        assert_eq!(buffer, prefixed(b"hello"));

        let mut cursor = Cursor::new(buffer);
        assert_eq!(read_message(&mut cursor).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_read_split_across_reads() {
        let frame = prefixed(b"{\"event\":\"leave\"}");
        let mut mock = tokio_test::io::Builder::new()
            .read(&frame[..2])
            .read(&frame[2..7])
            .read(&frame[7..])
            .build();
        let payload = read_message(&mut mock).await.unwrap();
        assert_eq!(payload, b"{\"event\":\"leave\"}");
    }

    #[tokio::test]
    async fn test_write_to_mock_stream() {
        let mut mock = tokio_test::io::Builder::new()
            .write(&5u32.to_le_bytes())
            .write(b"abcde")
            .build();
        write_message(&mut mock, b"abcde").await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_message() {
        let mut buffer = Vec::new();
        write_message(&mut buffer, b"").await.unwrap();
        let mut cursor = Cursor::new(buffer);
        assert!(read_message(&mut cursor).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_rejected() {
        let large = vec![0u8; MAX_MESSAGE_SIZE + 1];
        let mut buffer = Vec::new();
        let result = write_message(&mut buffer, &large).await;
        assert!(matches!(result, Err(FramingError::MessageTooLarge(_, _))));

        let header = ((MAX_MESSAGE_SIZE + 1) as u32).to_le_bytes();
        let mut mock = tokio_test::io::Builder::new().read(&header).build();
        let result = read_message(&mut mock).await;
        assert!(matches!(result, Err(FramingError::MessageTooLarge(n, _)) if n == MAX_MESSAGE_SIZE + 1));
    }

    #[tokio::test]
    async fn test_truncated_frames() {
        let mut cursor = Cursor::new(vec![0u8; 2]);
        assert!(matches!(
            read_message(&mut cursor).await,
            Err(FramingError::ConnectionClosed)
        ));

        let mut buffer = 10u32.to_le_bytes().to_vec();
        buffer.extend_from_slice(&[1, 2, 3]);
        let mut cursor = Cursor::new(buffer);
        assert!(matches!(
            read_message(&mut cursor).await,
            Err(FramingError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_encode_frame_reads_back() {
        let message = ServerMessage::ReadyTimerElapsed;
        let frame = encode_frame(&message).unwrap();

        let mut buffer = Vec::new();
        write_frame(&mut buffer, &frame).await.unwrap();
        let mut cursor = Cursor::new(buffer);
        let payload = read_message(&mut cursor).await.unwrap();
        assert_eq!(decode::<ServerMessage>(&payload).unwrap(), message);
    }
}
