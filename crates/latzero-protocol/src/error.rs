// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Codec-level error types.

use thiserror::Error;

use crate::frame::FrameError;

/// Errors raised while validating or decoding a message.
///
/// The transport converts these into wire `error` replies when the offending
/// message carried an `id`, and closes the connection otherwise.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("missing required field '{field}' for '{kind}' message")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },

    #[error("invalid {what} '{value}': {reason}")]
    InvalidIdentifier {
        what: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("invalid value for '{field}': {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),
}
