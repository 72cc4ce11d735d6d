// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Serialization laws for the message catalog: any valid message serialized
//! and parsed equals the original, structurally and order-independently.

use latzero_protocol::{
    AdminOp, AdminRequest, Assigned, Emit, ErrorCode, ErrorMessage, Handshake, HandshakeAck,
    LockMode, MemoryOp, MemoryRequest, Message, PROTOCOL_VERSION, Response, Status, Trigger,
};
use serde_json::json;

fn round_trip(msg: &Message) {
    msg.validate().expect("fixture should validate");
    let encoded = serde_json::to_string(msg).unwrap();
    let decoded: Message = serde_json::from_str(&encoded).unwrap();
    assert_eq!(&decoded, msg, "round trip changed {}", msg.kind());
}

fn fresh_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[test]
fn round_trip_every_kind() {
    let handshake = Message::Handshake(Handshake {
        id: Some(fresh_id()),
        app_id: "myApp".into(),
        pools: vec!["default".into()],
        triggers: vec!["echo".into()],
        metadata: serde_json::Map::new(),
        protocol_version: Some(PROTOCOL_VERSION.into()),
    });

    let ack = Message::HandshakeAck(HandshakeAck {
        id: fresh_id(),
        correlation_id: fresh_id(),
        status: Status::Success,
        assigned: Some(Assigned {
            app_id: "myApp".into(),
            pools: vec!["default".into()],
            triggers: vec!["echo".into()],
            rehydrated: false,
        }),
        error: None,
    });

    let trigger = Message::Trigger(Trigger {
        id: fresh_id(),
        origin: "myApp".into(),
        trigger: "echo".into(),
        payload: json!({"x": 1}),
        pool: Some("default".into()),
        destination: Some("other".into()),
        ttl: Some(30_000),
        flags: None,
        timestamp: Some(1_700_000_000_000),
    });

    let response = Message::Response(Response {
        id: Some(fresh_id()),
        correlation_id: Some(fresh_id()),
        status: Status::Success,
        result: Some(json!({"x": 1})),
        error: None,
    });

    let emit = Message::Emit(Emit {
        trigger: "tick".into(),
        payload: json!({"seq": 9}),
        pool: None,
    });

    let error = Message::Error(ErrorMessage {
        correlation_id: Some(fresh_id()),
        error: "no handler registered".into(),
        error_code: ErrorCode::NotFound,
    });

    let memory = Message::Memory(MemoryRequest {
        id: Some(fresh_id()),
        operation: MemoryOp::Lock,
        block_id: "scratch-1".into(),
        pool: Some("default".into()),
        size: None,
        block_type: None,
        persistent: None,
        permissions: None,
        data: None,
        offset: None,
        length: None,
        expected: None,
        mode: Some(LockMode::Write),
        timeout_ms: Some(5_000),
        lock_id: None,
    });

    let admin = Message::Admin(AdminRequest {
        id: Some(fresh_id()),
        operation: AdminOp::Stats,
        args: serde_json::Value::Null,
    });

    for msg in [
        handshake, ack, trigger, response, emit, error, memory, admin,
    ] {
        round_trip(&msg);
    }
}

#[test]
fn identifier_boundaries() {
    let at = |len: usize| "a".repeat(len);

    // AppID: 128 accepted, 129 rejected.
    let mut hs = Handshake {
        id: None,
        app_id: at(128),
        pools: vec![],
        triggers: vec![],
        metadata: serde_json::Map::new(),
        protocol_version: None,
    };
    assert!(Message::Handshake(hs.clone()).validate().is_ok());
    hs.app_id = at(129);
    assert!(Message::Handshake(hs.clone()).validate().is_err());

    // Pool: 64 accepted, 65 rejected.
    hs.app_id = "app".into();
    hs.pools = vec![at(64)];
    assert!(Message::Handshake(hs.clone()).validate().is_ok());
    hs.pools = vec![at(65)];
    assert!(Message::Handshake(hs.clone()).validate().is_err());

    // Trigger: 128 accepted, 129 rejected.
    hs.pools = vec![];
    hs.triggers = vec![at(128)];
    assert!(Message::Handshake(hs.clone()).validate().is_ok());
    hs.triggers = vec![at(129)];
    assert!(Message::Handshake(hs).validate().is_err());
}

#[test]
fn unknown_type_is_rejected() {
    let raw = r#"{"type":"warp","payload":{}}"#;
    assert!(serde_json::from_str::<Message>(raw).is_err());
}

#[test]
fn missing_required_fields_are_rejected_by_serde() {
    // trigger without origin
    let raw = format!(
        r#"{{"type":"trigger","id":"{}","trigger":"echo","payload":{{}}}}"#,
        uuid::Uuid::new_v4()
    );
    assert!(serde_json::from_str::<Message>(&raw).is_err());

    // handshake without app_id
    let raw = r#"{"type":"handshake"}"#;
    assert!(serde_json::from_str::<Message>(raw).is_err());
}
