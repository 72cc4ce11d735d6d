// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for latzero-core.
//!
//! Provides a unified error type that maps onto the stable wire error codes.

use thiserror::Error;

use latzero_protocol::{ErrorCode, Message, error_message};

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur during request processing.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Malformed message, bad identifier, or bad size.
    #[error("validation error for '{field}': {message}")]
    Validation { field: String, message: String },

    /// Registration refused.
    #[error("handshake refused: {reason}")]
    Handshake { reason: String },

    /// Permission or pool-membership failure.
    #[error("access denied for '{app_id}' on {resource}")]
    AccessDenied { app_id: String, resource: String },

    /// No handler, or no such pool/block/app.
    #[error("{what} '{name}' not found")]
    NotFound { what: &'static str, name: String },

    /// TTL expired before a response arrived.
    #[error("trigger '{id}' timed out")]
    Timeout { id: String },

    /// In-flight cap hit.
    #[error("in-flight trigger limit of {limit} reached")]
    TooManyRequests { limit: usize },

    /// Send failure, destination became inactive, or disconnect mid-flight.
    #[error("routing failed: {reason}")]
    Routing { reason: String },

    /// Intra-app trigger; local dispatch is not supported.
    #[error("intra-app trigger for '{app_id}' is not supported")]
    ShortCircuit { app_id: String },

    /// Memory operation exceeds the block bounds.
    #[error(
        "range [{offset}, {offset}+{length}) exceeds block '{block_id}' of {size} bytes"
    )]
    OutOfBounds {
        block_id: String,
        offset: u64,
        length: u64,
        size: u64,
    },

    /// Durable store failure.
    #[error("storage error during '{operation}': {details}")]
    Storage { operation: String, details: String },

    /// Catch-all; should be rare in steady state.
    #[error("internal error: {details}")]
    Internal { details: String },
}

impl CoreError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn storage(operation: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            details: details.into(),
        }
    }

    /// The stable code returned on the wire for this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Validation { .. } => ErrorCode::ValidationError,
            Self::Handshake { .. } => ErrorCode::HandshakeError,
            Self::AccessDenied { .. } => ErrorCode::AccessDenied,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::TooManyRequests { .. } => ErrorCode::TooManyRequests,
            Self::Routing { .. } => ErrorCode::RoutingError,
            Self::ShortCircuit { .. } => ErrorCode::ShortCircuitNotImplemented,
            Self::OutOfBounds { .. } => ErrorCode::OutOfBounds,
            Self::Storage { .. } | Self::Internal { .. } => ErrorCode::InternalError,
        }
    }

    /// Convert to a wire `error` message, optionally correlated to a pending
    /// request.
    pub fn to_wire(&self, correlation_id: Option<&str>) -> Message {
        error_message(correlation_id, self.error_code(), self.to_string())
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::Storage {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Storage {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<latzero_protocol::ProtocolError> for CoreError {
    fn from(err: latzero_protocol::ProtocolError) -> Self {
        CoreError::Validation {
            field: "message".to_string(),
            message: err.to_string(),
        }
    }
}
