// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! TCP transport for latzero-core.
//!
//! Accepts connections, assembles frames, and dispatches parsed messages
//! into the core. Each connection gets a monotonically increasing id, a
//! reader task, and a writer task fed by an unbounded channel so a slow
//! consumer never stalls the read path of other connections.
//!
//! Codec failures on messages that carried an `id` produce a wire `error`
//! reply; severe framing errors (oversize, malformed frame without an id)
//! close the connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::Result;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use latzero_protocol::frame::{FrameError, read_frame, write_frame};
use latzero_protocol::{
    Assigned, ErrorCode, Frame, HandshakeAck, Message, Status, error_message,
};

use crate::error::CoreError;
use crate::handlers::{handle_admin, handle_memory};
use crate::runtime::CoreState;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Writable handle to a live connection.
///
/// Cloned into the registry while the connection is bound; sending enqueues
/// onto the connection's writer task and fails once the peer is gone.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: u64,
    tx: mpsc::UnboundedSender<Message>,
    closed: CancellationToken,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a message for the peer.
    pub fn send(&self, msg: Message) -> Result<(), CoreError> {
        self.tx.send(msg).map_err(|_| CoreError::Routing {
            reason: format!("connection {} is closed", self.id),
        })
    }

    /// Ask the transport to close this connection.
    pub fn shutdown(&self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
impl ConnectionHandle {
    /// Handle plus the receiving end of its channel, for tests that assert
    /// on delivered messages.
    pub fn pair(id: u64) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id,
                tx,
                closed: CancellationToken::new(),
            },
            rx,
        )
    }

    /// Handle whose sends go nowhere, for tests that never deliver.
    pub fn loopback(id: u64) -> Self {
        let (handle, rx) = Self::pair(id);
        // Keep the channel open for the lifetime of the test.
        std::mem::forget(rx);
        handle
    }
}

/// Run the accept loop until `shutdown` fires.
#[instrument(skip(listener, state, shutdown))]
pub async fn run_server(
    listener: TcpListener,
    state: Arc<CoreState>,
    shutdown: CancellationToken,
) -> Result<()> {
    let semaphore = Arc::new(Semaphore::new(state.config.max_connections));
    info!(
        addr = %listener.local_addr()?,
        max_connections = state.config.max_connections,
        "server listening"
    );

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("accept loop stopping");
                break;
            }

            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("failed to accept connection: {}", e);
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!(%remote, "connection ceiling reached, refusing");
                        drop(stream);
                        continue;
                    }
                };

                let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
                let state = state.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    debug!(conn_id, %remote, "connection accepted");
                    handle_connection(stream, conn_id, state.clone(), shutdown).await;
                    state.handle_disconnect(conn_id).await;
                    debug!(conn_id, "connection closed");
                });
            }
        }
    }

    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    conn_id: u64,
    state: Arc<CoreState>,
    shutdown: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(conn_id, "failed to set nodelay: {}", e);
    }
    let (read_half, write_half) = stream.into_split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let conn = ConnectionHandle {
        id: conn_id,
        tx,
        closed: CancellationToken::new(),
    };
    state.connection_opened();

    // Writer task: owns the write half, drains the queue until every
    // sender is gone or the connection is told to close. Messages already
    // queued at close time are flushed before the socket goes down.
    let closed = conn.closed.clone();
    let writer = tokio::spawn(async move {
        let mut writer = BufWriter::new(write_half);
        loop {
            let msg = tokio::select! {
                biased;

                maybe = rx.recv() => match maybe {
                    Some(msg) => msg,
                    None => break,
                },

                _ = closed.cancelled() => {
                    while let Ok(msg) = rx.try_recv() {
                        if write_message(conn_id, &mut writer, &msg).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
            };
            if write_message(conn_id, &mut writer, &msg).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    read_loop(read_half, &conn, &state, &shutdown).await;

    state.connection_closed();
    conn.shutdown();
    drop(conn);
    if tokio::time::timeout(std::time::Duration::from_secs(1), writer)
        .await
        .is_err()
    {
        debug!(conn_id, "writer did not flush in time");
    }
}

async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    conn_id: u64,
    writer: &mut W,
    msg: &Message,
) -> std::result::Result<(), ()> {
    let frame = match Frame::new(msg) {
        Ok(frame) => frame,
        Err(e) => {
            error!(conn_id, "failed to encode outbound message: {}", e);
            return Ok(());
        }
    };
    match write_frame(writer, &frame).await {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!(conn_id, "write failed, closing writer: {}", e);
            Err(())
        }
    }
}

async fn read_loop(
    read_half: tokio::net::tcp::OwnedReadHalf,
    conn: &ConnectionHandle,
    state: &Arc<CoreState>,
    shutdown: &CancellationToken,
) {
    let mut reader = BufReader::new(read_half);
    let rate_cap = state.config.max_messages_per_sec;
    let mut window_start = Instant::now();
    let mut window_count: u32 = 0;

    loop {
        let frame = tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,
            _ = conn.closed.cancelled() => break,
            frame = read_frame(&mut reader) => frame,
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(FrameError::ConnectionClosed) => break,
            Err(FrameError::FrameTooLarge(size)) => {
                warn!(conn = conn.id(), size, "oversized frame, closing connection");
                break;
            }
            Err(e) => {
                warn!(conn = conn.id(), "framing error, closing connection: {}", e);
                break;
            }
        };

        if rate_cap > 0 {
            if window_start.elapsed().as_secs() >= 1 {
                window_start = Instant::now();
                window_count = 0;
            }
            window_count += 1;
            if window_count > rate_cap {
                let _ = conn.send(error_message(
                    None,
                    ErrorCode::TooManyRequests,
                    "per-connection message rate exceeded",
                ));
                continue;
            }
        }

        let msg: Message = match frame.decode() {
            Ok(msg) => msg,
            Err(e) => {
                // Best effort: pull an id out of the raw payload so the
                // error can be correlated; close otherwise.
                let id = serde_json::from_slice::<serde_json::Value>(&frame.payload)
                    .ok()
                    .and_then(|v| v.get("id").and_then(|id| id.as_str().map(str::to_string)));
                match id {
                    Some(id) => {
                        let _ = conn.send(error_message(
                            Some(&id),
                            ErrorCode::ValidationError,
                            format!("malformed message: {e}"),
                        ));
                        continue;
                    }
                    None => {
                        warn!(conn = conn.id(), "unparseable frame, closing connection: {}", e);
                        break;
                    }
                }
            }
        };

        if let Err(e) = msg.validate() {
            match msg.id() {
                Some(id) => {
                    let _ = conn.send(error_message(
                        Some(id),
                        ErrorCode::ValidationError,
                        e.to_string(),
                    ));
                    continue;
                }
                None => {
                    warn!(conn = conn.id(), "invalid message without id, closing: {}", e);
                    break;
                }
            }
        }

        dispatch(state, conn, msg).await;
    }
}

/// Route one parsed, validated message into the core.
pub async fn dispatch(state: &Arc<CoreState>, conn: &ConnectionHandle, msg: Message) {
    match msg {
        Message::Handshake(handshake) => {
            let correlation = handshake
                .id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            match state.registry.handle_handshake(conn, handshake).await {
                Ok(outcome) => {
                    if let Some(superseded) = &outcome.superseded {
                        let _ = superseded.send(error_message(
                            None,
                            ErrorCode::HandshakeError,
                            "registration superseded by a newer connection",
                        ));
                        superseded.shutdown();
                    }
                    let ack = Message::HandshakeAck(HandshakeAck {
                        id: uuid::Uuid::new_v4().to_string(),
                        correlation_id: correlation,
                        status: Status::Success,
                        assigned: Some(Assigned {
                            app_id: outcome.app_id,
                            pools: outcome.pools,
                            triggers: outcome.triggers,
                            rehydrated: outcome.rehydrated,
                        }),
                        error: None,
                    });
                    let _ = conn.send(ack);
                }
                Err(e) => {
                    let _ = conn.send(e.to_wire(Some(&correlation)));
                }
            }
        }

        Message::Trigger(trigger) => {
            state.router.handle_trigger(conn, trigger).await;
        }

        Message::Response(response) => {
            state.router.handle_response(response).await;
        }

        Message::Error(err) => match err.correlation_id {
            Some(correlation) => {
                state
                    .router
                    .handle_error(&correlation, err.error, err.error_code)
                    .await;
            }
            None => {
                warn!(conn = conn.id(), code = ?err.error_code, "uncorrelated error from peer: {}", err.error);
            }
        },

        Message::Emit(emit) => {
            state.router.handle_emit(conn, emit).await;
        }

        Message::Memory(request) => {
            handle_memory(state, conn, request).await;
        }

        Message::Admin(request) => {
            handle_admin(state, conn, request).await;
        }

        Message::HandshakeAck(_) => {
            warn!(conn = conn.id(), "unexpected handshake_ack from client");
        }

        Message::BinaryFrame(header) => {
            // The envelope parses everywhere; the bulk path is feature
            // gated and not wired into the trigger path.
            let _ = conn.send(error_message(
                header.id.as_deref(),
                ErrorCode::ValidationError,
                "binary frames are not enabled on this server",
            ));
        }
    }
}
