// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! E2E tests for the handshake lifecycle: registration, update,
//! supersession, validation, and rehydration.

mod common;

use common::*;
use latzero_protocol::{ErrorCode, Handshake, Message, PROTOCOL_VERSION};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handshake_ack_echoes_assigned_values() {
    let ctx = TestContext::new().await;

    let mut client = ctx.client().await;
    let ack = client
        .handshake("myApp", vec!["default".into()], vec!["echo".into()])
        .await
        .unwrap();

    let assigned = ack.assigned.expect("ack should carry assigned values");
    assert_eq!(assigned.app_id, "myApp");
    assert_eq!(assigned.pools, vec!["default".to_string()]);
    assert_eq!(assigned.triggers, vec!["echo".to_string()]);
    assert!(!assigned.rehydrated);

    ctx.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_app_id_is_rejected_without_closing() {
    let ctx = TestContext::new().await;
    let mut client = ctx.client().await;

    // 129 characters crosses the AppID limit.
    let msg = Message::Handshake(Handshake {
        id: Some(uuid::Uuid::new_v4().to_string()),
        app_id: "a".repeat(129),
        pools: vec![],
        triggers: vec![],
        metadata: serde_json::Map::new(),
        protocol_version: Some(PROTOCOL_VERSION.to_string()),
    });
    client.send(&msg).await.unwrap();

    let Message::Error(err) = client.recv().await.unwrap() else {
        panic!("expected error");
    };
    assert_eq!(err.error_code, ErrorCode::ValidationError);

    // The connection survives and can register properly.
    let ack = client.handshake("valid", vec![], vec![]).await.unwrap();
    assert_eq!(ack.assigned.unwrap().app_id, "valid");

    ctx.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_pool_is_handshake_error() {
    let ctx = TestContext::new().await;
    let mut client = ctx.client().await;

    let err = client
        .handshake("app", vec!["no-such-pool".into()], vec![])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no-such-pool"));

    ctx.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rehandshake_updates_registration() {
    let ctx = TestContext::new().await;
    let mut client = ctx.client().await;

    client
        .handshake("app", vec!["default".into()], vec!["t1".into()])
        .await
        .unwrap();
    let ack = client
        .handshake("app", vec!["default".into()], vec!["t2".into()])
        .await
        .unwrap();

    assert_eq!(ack.assigned.unwrap().triggers, vec!["t2".to_string()]);
    assert!(ctx.state.registry.handlers_for("t1").await.is_empty());
    assert_eq!(
        ctx.state.registry.handlers_for("t2").await,
        vec!["app".to_string()]
    );

    ctx.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_app_id_supersedes_old_connection() {
    let ctx = TestContext::new().await;

    let mut first = ctx.client().await;
    first
        .handshake("app", vec!["default".into()], vec!["echo".into()])
        .await
        .unwrap();

    let mut second = ctx.client().await;
    second
        .handshake("app", vec!["default".into()], vec!["echo".into()])
        .await
        .unwrap();

    // The superseded connection is told why and then closed.
    let Message::Error(err) = first.recv().await.unwrap() else {
        panic!("expected supersession error");
    };
    assert_eq!(err.error_code, ErrorCode::HandshakeError);
    assert!(first.recv().await.is_err(), "old connection should close");

    // Exactly one BOUND connection remains.
    assert!(ctx.state.registry.is_bound("app").await);
    assert_eq!(ctx.state.registry.list_bound().await.len(), 1);

    ctx.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rehydration_restores_pools_and_triggers() {
    let ctx = TestContext::new().await;
    ctx.state
        .pools
        .create("p1", "local", false, serde_json::Map::new())
        .await
        .unwrap();

    // Full registration, then disconnect.
    let client = ctx
        .registered_client("A", &["p1"], &["t1", "t2"])
        .await;
    client.close().await.unwrap();

    // Give the server a beat to run disconnect cleanup.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(!ctx.state.registry.is_bound("A").await);
    assert_eq!(ctx.state.registry.cached_count().await, 1);

    // Minimal handshake restores the prior registration.
    let mut reconnect = ctx.client().await;
    let ack = reconnect.handshake("A", vec![], vec![]).await.unwrap();
    let assigned = ack.assigned.unwrap();
    assert!(assigned.rehydrated);
    assert_eq!(assigned.pools, vec!["p1".to_string()]);
    assert_eq!(
        assigned.triggers,
        vec!["t1".to_string(), "t2".to_string()]
    );

    // Trigger-index entries are back.
    assert_eq!(
        ctx.state.registry.handlers_for("t1").await,
        vec!["A".to_string()]
    );
    assert_eq!(
        ctx.state.registry.handlers_for("t2").await,
        vec!["A".to_string()]
    );

    ctx.stop().await;
}
