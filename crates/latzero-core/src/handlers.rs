// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire handlers for memory and admin operations.
//!
//! These translate between the message catalog and the managers: base64
//! payload decoding, per-operation argument extraction, and the success /
//! error reply envelope correlated to the request id.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};
use tracing::instrument;

use latzero_protocol::{
    AdminOp, AdminRequest, LockMode, MemoryOp, MemoryRequest, PROTOCOL_VERSION, success_response,
};

use crate::error::CoreError;
use crate::memory::CreateBlock;
use crate::runtime::CoreState;
use crate::server::ConnectionHandle;

fn decode_bytes(field: &'static str, encoded: &str) -> Result<Vec<u8>, CoreError> {
    BASE64
        .decode(encoded)
        .map_err(|_| CoreError::validation(field, "must be base64-encoded bytes"))
}

/// Process a `memory` message and reply on the same connection.
#[instrument(skip(state, conn, request), fields(operation = ?request.operation, block_id = %request.block_id))]
pub async fn handle_memory(state: &Arc<CoreState>, conn: &ConnectionHandle, request: MemoryRequest) {
    let correlation = request.id.clone();
    match memory_op(state, conn, request).await {
        Ok(result) => {
            if let Some(id) = correlation {
                let _ = conn.send(success_response(&id, result));
            }
        }
        Err(e) => {
            let _ = conn.send(e.to_wire(correlation.as_deref()));
        }
    }
}

async fn memory_op(
    state: &Arc<CoreState>,
    conn: &ConnectionHandle,
    request: MemoryRequest,
) -> Result<Value, CoreError> {
    let app_id = state
        .registry
        .app_of_conn(conn.id())
        .await
        .ok_or_else(|| CoreError::validation("origin", "connection is not bound"))?;

    let block_id = request.block_id;
    match request.operation {
        MemoryOp::Create => {
            let record = state
                .memory
                .create(
                    &app_id,
                    CreateBlock {
                        block_id,
                        name: None,
                        pool: request.pool,
                        // Presence is enforced by message validation.
                        size: request.size.unwrap_or(0),
                        block_type: request.block_type.map(|t| t.as_str().to_string()),
                        persistent: request.persistent.unwrap_or(false)
                            || request.block_type == Some(latzero_protocol::BlockType::Persistent),
                        encrypted: request.block_type
                            == Some(latzero_protocol::BlockType::Encrypted),
                        permissions: request.permissions.unwrap_or_default(),
                    },
                )
                .await?;
            Ok(json!({
                "block_id": record.block_id,
                "pool": record.pool,
                "size": record.size,
                "version": record.version,
            }))
        }

        MemoryOp::Attach => {
            let mode = request.mode.unwrap_or(LockMode::Read);
            let version = state.memory.attach(&app_id, &block_id, mode).await?;
            Ok(json!({ "block_id": block_id, "version": version }))
        }

        MemoryOp::Detach => {
            state.memory.detach(&app_id, &block_id).await?;
            Ok(json!({ "block_id": block_id }))
        }

        MemoryOp::Read => {
            let (bytes, version) = state
                .memory
                .read(&app_id, &block_id, request.offset.unwrap_or(0), request.length)
                .await?;
            Ok(json!({
                "block_id": block_id,
                "data": BASE64.encode(&bytes),
                "version": version,
            }))
        }

        MemoryOp::Write => {
            let data = decode_bytes("data", request.data.as_deref().unwrap_or_default())?;
            let version = state
                .memory
                .write(&app_id, &block_id, request.offset.unwrap_or(0), &data)
                .await?;
            Ok(json!({ "block_id": block_id, "version": version }))
        }

        MemoryOp::CompareAndSwap => {
            let expected =
                decode_bytes("expected", request.expected.as_deref().unwrap_or_default())?;
            let data = decode_bytes("data", request.data.as_deref().unwrap_or_default())?;
            let (swapped, previous, version) = state
                .memory
                .compare_and_swap(
                    &app_id,
                    &block_id,
                    request.offset.unwrap_or(0),
                    &expected,
                    &data,
                )
                .await?;
            Ok(json!({
                "block_id": block_id,
                "swapped": swapped,
                "previous": BASE64.encode(&previous),
                "version": version,
            }))
        }

        MemoryOp::Lock => {
            let mode = request.mode.unwrap_or(LockMode::Exclusive);
            let lock = state
                .memory
                .lock(&app_id, &block_id, mode, request.timeout_ms)
                .await?;
            Ok(json!({
                "block_id": block_id,
                "lock_id": lock.lock_id,
                "mode": serde_json::to_value(lock.mode)?,
            }))
        }

        MemoryOp::Unlock => {
            let lock_id = request
                .lock_id
                .ok_or_else(|| CoreError::validation("lock_id", "required for unlock"))?;
            state.memory.unlock(&app_id, &block_id, &lock_id).await?;
            Ok(json!({ "block_id": block_id }))
        }

        MemoryOp::Remove => {
            state.memory.remove(&app_id, &block_id).await?;
            Ok(json!({ "block_id": block_id, "removed": true }))
        }
    }
}

/// Process an `admin` introspection message and reply on the connection.
#[instrument(skip(state, conn, request), fields(operation = ?request.operation))]
pub async fn handle_admin(state: &Arc<CoreState>, conn: &ConnectionHandle, request: AdminRequest) {
    let correlation = request
        .id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    match admin_op(state, request).await {
        Ok(result) => {
            let _ = conn.send(success_response(&correlation, result));
        }
        Err(e) => {
            let _ = conn.send(e.to_wire(Some(&correlation)));
        }
    }
}

async fn admin_op(state: &Arc<CoreState>, request: AdminRequest) -> Result<Value, CoreError> {
    match request.operation {
        AdminOp::Ping => Ok(json!({
            "pong": true,
            "protocol_version": PROTOCOL_VERSION,
        })),

        AdminOp::Stats => {
            let router = state.router.stats();
            Ok(json!({
                "uptime_ms": state.started_at.elapsed().as_millis() as u64,
                "connections": state.connection_count(),
                "bound_apps": state.registry.list_bound().await.len(),
                "cached_apps": state.registry.cached_count().await,
                "pools": state.pools.list().await.len(),
                "blocks": state.memory.block_count().await,
                "inflight": state.router.inflight_count(),
                "triggers": {
                    "dispatched": router.dispatched,
                    "completed": router.completed,
                    "timed_out": router.timed_out,
                    "failed": router.failed,
                    "emitted": router.emitted,
                    "avg_response_ms": router.avg_response_ms,
                },
            }))
        }

        AdminOp::ListApps => {
            let apps: Vec<Value> = state
                .registry
                .list_bound()
                .await
                .into_iter()
                .map(|app| {
                    json!({
                        "app_id": app.app_id,
                        "pools": app.pools,
                        "triggers": app.triggers,
                        "rehydrated": app.rehydrated,
                        "registered_at": app.registered_at.to_rfc3339(),
                        "last_seen_at": app.last_seen_at.to_rfc3339(),
                    })
                })
                .collect();
            Ok(json!({ "apps": apps }))
        }

        AdminOp::ListPools => {
            let mut pools = Vec::new();
            for record in state.pools.list().await {
                let members = state.pools.members(&record.name).await;
                pools.push(json!({
                    "name": record.name,
                    "type": record.pool_type,
                    "encrypted": record.encrypted,
                    "members": members,
                }));
            }
            Ok(json!({ "pools": pools }))
        }

        AdminOp::ListBlocks => {
            let blocks: Vec<Value> = state
                .memory
                .list()
                .await
                .into_iter()
                .map(|info| {
                    json!({
                        "block_id": info.record.block_id,
                        "pool": info.record.pool,
                        "size": info.record.size,
                        "type": info.record.block_type,
                        "version": info.record.version,
                        "persistent": info.record.persistent,
                        "attachments": info.attachments,
                        "locks": info.lock_count,
                    })
                })
                .collect();
            Ok(json!({ "blocks": blocks }))
        }
    }
}
