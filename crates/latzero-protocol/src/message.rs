// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The LatZero message catalog.
//!
//! Every frame payload is one of the kinds below, discriminated by the
//! `type` field. The same schemas are used in both directions; the server
//! builds its replies out of the same types it parses.
//!
//! Input compatibility: `process` is accepted as an alias for `trigger`, and
//! `in_reply_to` as an alias for `correlation_id`. Both are normalized on
//! first parse and never re-emitted.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::validate::{
    validate_app_id, validate_block_id, validate_pool_name, validate_trigger_name, validate_uuid,
};

/// Protocol version advertised in handshakes.
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Stable error codes returned on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    HandshakeError,
    AccessDenied,
    NotFound,
    Timeout,
    TooManyRequests,
    RoutingError,
    ShortCircuitNotImplemented,
    OutOfBounds,
    InternalError,
}

/// Success/failure discriminator used by acks and responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    Error,
}

/// A parsed wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Handshake(Handshake),
    HandshakeAck(HandshakeAck),
    #[serde(alias = "process")]
    Trigger(Trigger),
    Response(Response),
    Emit(Emit),
    Error(ErrorMessage),
    Memory(MemoryRequest),
    Admin(AdminRequest),
    BinaryFrame(BinaryFrameHeader),
}

/// Client registration. Empty `pools` and `triggers` with cached prior state
/// requests rehydration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub app_id: String,
    #[serde(default)]
    pub pools: Vec<String>,
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<String>,
}

/// Server reply to a handshake. `assigned` echoes the effective registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub id: String,
    pub correlation_id: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned: Option<Assigned>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Server-resolved registration values echoed in a handshake ack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assigned {
    pub app_id: String,
    pub pools: Vec<String>,
    pub triggers: Vec<String>,
    pub rehydrated: bool,
}

/// A request routed to a trigger handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    pub origin: String,
    pub trigger: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    /// Requested TTL in milliseconds. Clamped server-side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// A handler's reply, correlated back to the originating trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(
        default,
        alias = "in_reply_to",
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    /// The in-flight record this response correlates to, preferring the
    /// explicit correlation field over the message's own id.
    pub fn correlation(&self) -> Option<&str> {
        self.correlation_id.as_deref().or(self.id.as_deref())
    }
}

/// Fire-and-forget delivery to every matching handler. No response tracked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Emit {
    pub trigger: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
}

/// Terminal error reply for a pending request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    #[serde(
        default,
        alias = "in_reply_to",
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,
    pub error: String,
    pub error_code: ErrorCode,
}

/// Memory-block operation verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryOp {
    Create,
    Attach,
    Detach,
    Read,
    Write,
    #[serde(alias = "cas")]
    CompareAndSwap,
    Lock,
    Unlock,
    Remove,
}

/// Memory block classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Shared,
    Persistent,
    Encrypted,
    Temporary,
    Json,
    Binary,
    Stream,
}

impl BlockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockType::Shared => "shared",
            BlockType::Persistent => "persistent",
            BlockType::Encrypted => "encrypted",
            BlockType::Temporary => "temporary",
            BlockType::Json => "json",
            BlockType::Binary => "binary",
            BlockType::Stream => "stream",
        }
    }
}

/// Advisory lock modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    Read,
    Write,
    Exclusive,
}

/// A memory-block operation. The per-operation sub-schema is enforced by
/// [`Message::validate`]; raw bytes travel base64-encoded in `data` and
/// `expected`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub operation: MemoryOp,
    pub block_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_type: Option<BlockType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<HashMap<String, Vec<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<LockMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_id: Option<String>,
}

/// Introspection verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminOp {
    Ping,
    Stats,
    ListApps,
    ListPools,
    ListBlocks,
}

/// Introspection request. Read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub operation: AdminOp,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub args: Value,
}

/// Envelope announcing `binary_size` raw bytes to follow on the stream.
/// Used for bulk memory transfer; gated behind the `binary-frames` feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryFrameHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub binary_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

impl Message {
    /// Kind name as it appears in the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Handshake(_) => "handshake",
            Message::HandshakeAck(_) => "handshake_ack",
            Message::Trigger(_) => "trigger",
            Message::Response(_) => "response",
            Message::Emit(_) => "emit",
            Message::Error(_) => "error",
            Message::Memory(_) => "memory",
            Message::Admin(_) => "admin",
            Message::BinaryFrame(_) => "binary_frame",
        }
    }

    /// The message's own id, when the kind carries one.
    pub fn id(&self) -> Option<&str> {
        match self {
            Message::Handshake(m) => m.id.as_deref(),
            Message::HandshakeAck(m) => Some(&m.id),
            Message::Trigger(m) => Some(&m.id),
            Message::Response(m) => m.id.as_deref(),
            Message::Emit(_) => None,
            Message::Error(_) => None,
            Message::Memory(m) => m.id.as_deref(),
            Message::Admin(m) => m.id.as_deref(),
            Message::BinaryFrame(m) => m.id.as_deref(),
        }
    }

    /// Enforce the per-kind schema beyond what serde shape-checking gives:
    /// identifier character classes, length limits, UUID forms, and the
    /// memory per-operation field requirements.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            Message::Handshake(m) => {
                validate_app_id(&m.app_id)?;
                if let Some(id) = &m.id {
                    validate_uuid(id)?;
                }
                for pool in &m.pools {
                    validate_pool_name(pool)?;
                }
                for trigger in &m.triggers {
                    validate_trigger_name(trigger)?;
                }
                Ok(())
            }
            Message::HandshakeAck(m) => {
                validate_uuid(&m.id)?;
                validate_uuid(&m.correlation_id)?;
                Ok(())
            }
            Message::Trigger(m) => {
                validate_uuid(&m.id)?;
                validate_app_id(&m.origin)?;
                validate_trigger_name(&m.trigger)?;
                if let Some(pool) = &m.pool {
                    validate_pool_name(pool)?;
                }
                if let Some(destination) = &m.destination {
                    validate_app_id(destination)?;
                }
                Ok(())
            }
            Message::Response(m) => {
                let correlation = m.correlation().ok_or(ProtocolError::MissingField {
                    kind: "response",
                    field: "correlation_id",
                })?;
                validate_uuid(correlation)
            }
            Message::Emit(m) => {
                validate_trigger_name(&m.trigger)?;
                if let Some(pool) = &m.pool {
                    validate_pool_name(pool)?;
                }
                Ok(())
            }
            Message::Error(m) => {
                if let Some(correlation) = &m.correlation_id {
                    validate_uuid(correlation)?;
                }
                Ok(())
            }
            Message::Memory(m) => {
                validate_block_id(&m.block_id)?;
                if let Some(id) = &m.id {
                    validate_uuid(id)?;
                }
                if let Some(pool) = &m.pool {
                    validate_pool_name(pool)?;
                }
                match m.operation {
                    MemoryOp::Create => {
                        match m.size {
                            None => Err(ProtocolError::MissingField {
                                kind: "memory",
                                field: "size",
                            }),
                            Some(0) => Err(ProtocolError::InvalidValue {
                                field: "size",
                                reason: "must be a positive number of bytes",
                            }),
                            Some(_) => Ok(()),
                        }
                    }
                    MemoryOp::Write => {
                        if m.data.is_none() {
                            return Err(ProtocolError::MissingField {
                                kind: "memory",
                                field: "data",
                            });
                        }
                        if m.offset.is_none() {
                            return Err(ProtocolError::MissingField {
                                kind: "memory",
                                field: "offset",
                            });
                        }
                        Ok(())
                    }
                    MemoryOp::CompareAndSwap => {
                        if m.expected.is_none() {
                            return Err(ProtocolError::MissingField {
                                kind: "memory",
                                field: "expected",
                            });
                        }
                        if m.data.is_none() {
                            return Err(ProtocolError::MissingField {
                                kind: "memory",
                                field: "data",
                            });
                        }
                        Ok(())
                    }
                    MemoryOp::Lock => match m.mode {
                        Some(_) => Ok(()),
                        None => Err(ProtocolError::MissingField {
                            kind: "memory",
                            field: "mode",
                        }),
                    },
                    MemoryOp::Unlock => match m.lock_id {
                        Some(_) => Ok(()),
                        None => Err(ProtocolError::MissingField {
                            kind: "memory",
                            field: "lock_id",
                        }),
                    },
                    MemoryOp::Attach | MemoryOp::Detach | MemoryOp::Read | MemoryOp::Remove => {
                        Ok(())
                    }
                }
            }
            Message::Admin(_) => Ok(()),
            Message::BinaryFrame(m) => {
                if m.binary_size as usize > crate::frame::MAX_FRAME_SIZE {
                    return Err(ProtocolError::InvalidValue {
                        field: "binary_size",
                        reason: "exceeds the maximum frame size",
                    });
                }
                Ok(())
            }
        }
    }
}

/// Build a success response correlated to `correlation_id`.
pub fn success_response(correlation_id: &str, result: Value) -> Message {
    Message::Response(Response {
        id: Some(uuid::Uuid::new_v4().to_string()),
        correlation_id: Some(correlation_id.to_string()),
        status: Status::Success,
        result: Some(result),
        error: None,
    })
}

/// Build a wire error, optionally correlated to a pending request.
pub fn error_message(
    correlation_id: Option<&str>,
    code: ErrorCode,
    error: impl Into<String>,
) -> Message {
    Message::Error(ErrorMessage {
        correlation_id: correlation_id.map(str::to_string),
        error: error.into(),
        error_code: code,
    })
}
