// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! LatZero Protocol - framed JSON communication layer
//!
//! This crate provides the wire protocol spoken between applications and
//! the LatZero orchestration server.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    latzero-protocol                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Message catalog: handshake / trigger / response / emit /   │
//! │                   error / memory / admin                    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: JSON (serde), schema + identifier checks    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Framing: 4-byte big-endian length prefix over TCP          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use latzero_protocol::{LatZeroClient, Message};
//!
//! let mut client = LatZeroClient::connect("127.0.0.1:45227".parse()?).await?;
//! let ack = client
//!     .handshake("myApp", vec!["default".into()], vec!["echo".into()])
//!     .await?;
//! assert_eq!(ack.assigned.unwrap().app_id, "myApp");
//! ```

pub mod client;
pub mod error;
pub mod frame;
pub mod message;
pub mod validate;

pub use client::{ClientError, LatZeroClient};
pub use error::ProtocolError;
pub use frame::{Frame, FrameError, FramedStream, MAX_FRAME_SIZE, read_frame, write_frame};
pub use message::{
    AdminOp, AdminRequest, Assigned, BinaryFrameHeader, BlockType, Emit, ErrorCode, ErrorMessage,
    Handshake, HandshakeAck, LockMode, MemoryOp, MemoryRequest, Message, PROTOCOL_VERSION,
    Response, Status, Trigger, error_message, success_response,
};
pub use validate::{
    MAX_APP_ID_LEN, MAX_BLOCK_ID_LEN, MAX_POOL_NAME_LEN, MAX_TRIGGER_NAME_LEN, validate_app_id,
    validate_block_id, validate_pool_name, validate_trigger_name, validate_uuid,
};
