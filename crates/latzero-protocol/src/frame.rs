// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for LatZero stream framing.
//!
//! Each frame on the wire is:
//! - 4 bytes: payload length (big-endian)
//! - N bytes: UTF-8 JSON message payload
//!
//! A `binary_frame` message is followed by `binary_size` raw bytes outside
//! of any frame; see [`read_binary_body`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (16 MiB). Oversized frames terminate the connection.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame header size (4-byte length prefix)
pub const HEADER_SIZE: usize = 4;

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("empty frame")]
    EmptyFrame,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

/// A framed payload as it travels on the wire
#[derive(Debug, Clone)]
pub struct Frame {
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame from a serializable message
    pub fn new<M: Serialize>(msg: &M) -> Result<Self, FrameError> {
        let payload = serde_json::to_vec(msg)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(payload.len()));
        }
        Ok(Self {
            payload: Bytes::from(payload),
        })
    }

    /// Create a frame from raw payload bytes
    pub fn from_payload(payload: Bytes) -> Result<Self, FrameError> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(payload.len()));
        }
        Ok(Self { payload })
    }

    /// Decode the payload as a JSON message
    pub fn decode<M: DeserializeOwned>(&self) -> Result<M, FrameError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Encode the frame to bytes for wire transmission
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.payload.len() as u32);
        buf.put(self.payload.clone());
        buf.freeze()
    }

    /// Decode a frame from a contiguous byte buffer
    pub fn decode_from_bytes(mut bytes: Bytes) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame header",
            )));
        }

        let length = bytes.get_u32() as usize;
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(length));
        }
        if bytes.len() < length {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame payload",
            )));
        }

        let payload = bytes.split_to(length);
        Ok(Self { payload })
    }
}

/// Write a frame to an async writer
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    let encoded = frame.encode();
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a frame from an async reader
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes(header) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(length));
    }
    if length == 0 {
        return Err(FrameError::EmptyFrame);
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(Frame {
        payload: Bytes::from(payload),
    })
}

/// Read the raw body following a `binary_frame` envelope.
///
/// The declared size is bounded by [`MAX_FRAME_SIZE`] just like a framed
/// payload.
pub async fn read_binary_body<R: AsyncRead + Unpin>(
    reader: &mut R,
    declared_size: u64,
) -> Result<Bytes, FrameError> {
    let size = declared_size as usize;
    if size > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(size));
    }
    let mut body = vec![0u8; size];
    reader.read_exact(&mut body).await?;
    Ok(Bytes::from(body))
}

/// Framed codec for reading/writing messages on a stream
pub struct FramedStream<S> {
    stream: S,
}

impl<S> FramedStream<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }
}

impl<S: AsyncRead + Unpin> FramedStream<S> {
    /// Read the next frame from the stream
    pub async fn read_frame(&mut self) -> Result<Frame, FrameError> {
        read_frame(&mut self.stream).await
    }

    /// Read and decode the next message
    pub async fn read_message<M: DeserializeOwned>(&mut self) -> Result<M, FrameError> {
        self.read_frame().await?.decode()
    }
}

impl<S: AsyncWrite + Unpin> FramedStream<S> {
    /// Write a frame to the stream
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), FrameError> {
        write_frame(&mut self.stream, frame).await
    }

    /// Encode and write a message
    pub async fn write_message<M: Serialize>(&mut self, msg: &M) -> Result<(), FrameError> {
        let frame = Frame::new(msg)?;
        self.write_frame(&frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[test]
    fn test_frame_encode_decode() {
        let msg = serde_json::json!({"type": "emit", "trigger": "tick", "payload": {}});
        let frame = Frame::new(&msg).unwrap();
        let encoded = frame.encode();
        let decoded = Frame::decode_from_bytes(encoded).unwrap();
        assert_eq!(frame.payload, decoded.payload);
    }

    #[test]
    fn test_frame_rejects_oversized_payload() {
        let blob = vec![0x20u8; MAX_FRAME_SIZE + 1];
        let err = Frame::from_payload(Bytes::from(blob)).unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge(_)));
    }

    #[test]
    fn test_decode_from_bytes_truncated() {
        let msg = serde_json::json!({"type": "emit", "trigger": "tick", "payload": {}});
        let frame = Frame::new(&msg).unwrap();
        let mut encoded = frame.encode();
        let truncated = encoded.split_to(encoded.len() - 2);
        assert!(Frame::decode_from_bytes(truncated).is_err());
    }

    #[tokio::test]
    async fn test_read_write_round_trip() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut writer = FramedStream::new(client);
        let mut reader = FramedStream::new(server);

        let msg = serde_json::json!({"type": "emit", "trigger": "tick", "payload": {"n": 1}});
        writer.write_message(&msg).await.unwrap();

        let got: serde_json::Value = reader.read_message().await.unwrap();
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn test_read_frame_rejects_forged_length() {
        let (mut client, server) = tokio::io::duplex(1024);
        // Declare a length one byte past the cap; reader must bail before
        // attempting to buffer it.
        let declared = (MAX_FRAME_SIZE as u32) + 1;
        client.write_all(&declared.to_be_bytes()).await.unwrap();

        let mut reader = FramedStream::new(server);
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge(_)));
    }

    #[tokio::test]
    async fn test_read_frame_eof_maps_to_connection_closed() {
        let (client, server) = tokio::io::duplex(16);
        drop(client);
        let mut reader = FramedStream::new(server);
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_binary_body_read() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(b"hello raw bytes").await.unwrap();
        let body = read_binary_body(&mut server, 15).await.unwrap();
        assert_eq!(&body[..], b"hello raw bytes");
    }

    #[tokio::test]
    async fn test_typed_message_round_trip() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FramedStream::new(client);
        let mut reader = FramedStream::new(server);

        let msg = Message::Emit(crate::message::Emit {
            trigger: "tick".to_string(),
            payload: serde_json::json!({"n": 2}),
            pool: None,
        });
        writer.write_message(&msg).await.unwrap();
        let got: Message = reader.read_message().await.unwrap();
        assert_eq!(got, msg);
    }
}
