// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Identifier validation shared by the codec and the server.
//!
//! AppIDs, pool names, and trigger names share one character class
//! (`[A-Za-z0-9._-]`) and differ only in their length limits. Message ids
//! must be universally unique identifiers in the conventional
//! 8-4-4-4-12 hex form.

use crate::error::ProtocolError;

/// Maximum AppID length in bytes.
pub const MAX_APP_ID_LEN: usize = 128;
/// Maximum pool-name length in bytes.
pub const MAX_POOL_NAME_LEN: usize = 64;
/// Maximum trigger-name length in bytes.
pub const MAX_TRIGGER_NAME_LEN: usize = 128;
/// Maximum memory block id length in bytes.
pub const MAX_BLOCK_ID_LEN: usize = 256;

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

fn validate_name(
    what: &'static str,
    value: &str,
    max_len: usize,
) -> Result<(), ProtocolError> {
    if value.is_empty() {
        return Err(ProtocolError::InvalidIdentifier {
            what,
            value: value.to_string(),
            reason: "must not be empty",
        });
    }
    if value.len() > max_len {
        return Err(ProtocolError::InvalidIdentifier {
            what,
            value: value.to_string(),
            reason: "exceeds maximum length",
        });
    }
    if !value.chars().all(is_name_char) {
        return Err(ProtocolError::InvalidIdentifier {
            what,
            value: value.to_string(),
            reason: "contains characters outside [A-Za-z0-9._-]",
        });
    }
    Ok(())
}

/// Validate an AppID (`[A-Za-z0-9._-]`, 1-128 chars).
pub fn validate_app_id(value: &str) -> Result<(), ProtocolError> {
    validate_name("app_id", value, MAX_APP_ID_LEN)
}

/// Validate a pool name (`[A-Za-z0-9._-]`, 1-64 chars).
pub fn validate_pool_name(value: &str) -> Result<(), ProtocolError> {
    validate_name("pool", value, MAX_POOL_NAME_LEN)
}

/// Validate a trigger name (`[A-Za-z0-9._-]`, 1-128 chars).
pub fn validate_trigger_name(value: &str) -> Result<(), ProtocolError> {
    validate_name("trigger", value, MAX_TRIGGER_NAME_LEN)
}

/// Validate a memory block id. Block ids are opaque but still bounded and
/// printable.
pub fn validate_block_id(value: &str) -> Result<(), ProtocolError> {
    if value.is_empty() || value.len() > MAX_BLOCK_ID_LEN {
        return Err(ProtocolError::InvalidIdentifier {
            what: "block_id",
            value: value.to_string(),
            reason: "must be 1-256 bytes",
        });
    }
    if !value.chars().all(|c| c.is_ascii_graphic()) {
        return Err(ProtocolError::InvalidIdentifier {
            what: "block_id",
            value: value.to_string(),
            reason: "must be printable ASCII",
        });
    }
    Ok(())
}

/// Validate a message id: lowercase-insensitive hex in the conventional
/// hyphenated 8-4-4-4-12 layout.
pub fn validate_uuid(value: &str) -> Result<(), ProtocolError> {
    const GROUPS: [usize; 5] = [8, 4, 4, 4, 12];

    let err = || ProtocolError::InvalidIdentifier {
        what: "id",
        value: value.to_string(),
        reason: "must be a UUID in 8-4-4-4-12 hex form",
    };

    let parts: Vec<&str> = value.split('-').collect();
    if parts.len() != GROUPS.len() {
        return Err(err());
    }
    for (part, expected) in parts.iter().zip(GROUPS) {
        if part.len() != expected || !part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(err());
        }
    }
    Ok(())
}
