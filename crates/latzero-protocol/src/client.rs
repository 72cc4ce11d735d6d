// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! TCP client for the LatZero protocol.
//!
//! A thin, sequential client used by SDKs and the end-to-end test suite:
//! it owns one framed connection and exposes typed send/recv plus a
//! handshake convenience.

use std::net::SocketAddr;

use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

use crate::frame::{FrameError, FramedStream};
use crate::message::{Handshake, HandshakeAck, Message, PROTOCOL_VERSION};

/// Errors surfaced by [`LatZeroClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect error: {0}")]
    Connect(#[from] std::io::Error),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("unexpected message kind '{0}'")]
    UnexpectedMessage(&'static str),

    #[error("handshake refused: {0}")]
    HandshakeRefused(String),
}

/// A framed TCP connection to a LatZero server.
pub struct LatZeroClient {
    stream: FramedStream<TcpStream>,
}

impl LatZeroClient {
    /// Connect to a server.
    pub async fn connect(addr: SocketAddr) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        debug!(%addr, "connected");
        Ok(Self {
            stream: FramedStream::new(stream),
        })
    }

    /// Send one message.
    pub async fn send(&mut self, msg: &Message) -> Result<(), ClientError> {
        Ok(self.stream.write_message(msg).await?)
    }

    /// Receive the next message.
    pub async fn recv(&mut self) -> Result<Message, ClientError> {
        Ok(self.stream.read_message().await?)
    }

    /// Register this connection under `app_id` and wait for the ack.
    ///
    /// Empty `pools` and `triggers` request rehydration of a previously
    /// cached registration.
    pub async fn handshake(
        &mut self,
        app_id: &str,
        pools: Vec<String>,
        triggers: Vec<String>,
    ) -> Result<HandshakeAck, ClientError> {
        let msg = Message::Handshake(Handshake {
            id: Some(uuid::Uuid::new_v4().to_string()),
            app_id: app_id.to_string(),
            pools,
            triggers,
            metadata: serde_json::Map::new(),
            protocol_version: Some(PROTOCOL_VERSION.to_string()),
        });
        self.send(&msg).await?;

        match self.recv().await? {
            Message::HandshakeAck(ack) => Ok(ack),
            Message::Error(err) => Err(ClientError::HandshakeRefused(err.error)),
            other => Err(ClientError::UnexpectedMessage(other.kind())),
        }
    }

    /// Tear down the connection.
    pub async fn close(self) -> Result<(), ClientError> {
        use tokio::io::AsyncWriteExt;
        let mut stream = self.stream.into_inner();
        stream.shutdown().await?;
        Ok(())
    }
}
