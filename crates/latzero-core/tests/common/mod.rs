// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for latzero-core E2E tests.
//!
//! Provides a TestContext that boots a server on an OS-assigned port with a
//! throwaway data directory, plus helpers for driving clients through
//! handshake/trigger/response flows.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use tempfile::TempDir;

use latzero_core::config::Config;
use latzero_core::runtime::{CoreState, Runtime};
use latzero_protocol::{LatZeroClient, Message, Trigger};

/// Test context that manages the server and its data directory.
pub struct TestContext {
    pub addr: SocketAddr,
    pub state: Arc<CoreState>,
    runtime: Option<Runtime>,
    _data_dir: TempDir,
}

impl TestContext {
    /// Boot a server with a fresh data directory and fast maintenance
    /// cadence.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Boot a server after applying `adjust` to the default test config.
    pub async fn with_config(adjust: impl FnOnce(&mut Config)) -> Self {
        let data_dir = TempDir::new().expect("failed to create test data dir");

        let mut config = Config {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            data_dir: data_dir.path().to_path_buf(),
            default_ttl_ms: 5_000,
            max_ttl_ms: 10_000,
            sweep_interval_ms: 1_000,
            max_backups: 2,
            ..Default::default()
        };
        adjust(&mut config);

        let runtime = Runtime::start(config).await.expect("server failed to start");
        let addr = runtime.local_addr();
        let state = runtime.state();

        Self {
            addr,
            state,
            runtime: Some(runtime),
            _data_dir: data_dir,
        }
    }

    /// Connect a raw client.
    pub async fn client(&self) -> LatZeroClient {
        LatZeroClient::connect(self.addr)
            .await
            .expect("failed to connect test client")
    }

    /// Connect and handshake in one step.
    pub async fn registered_client(
        &self,
        app_id: &str,
        pools: &[&str],
        triggers: &[&str],
    ) -> LatZeroClient {
        let mut client = self.client().await;
        let ack = client
            .handshake(
                app_id,
                pools.iter().map(|s| s.to_string()).collect(),
                triggers.iter().map(|s| s.to_string()).collect(),
            )
            .await
            .expect("handshake failed");
        assert_eq!(
            ack.assigned.as_ref().map(|a| a.app_id.as_str()),
            Some(app_id)
        );
        client
    }

    /// Gracefully stop the server.
    pub async fn stop(mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.stop().await.expect("shutdown failed");
        }
    }
}

/// Build a well-formed trigger message.
pub fn trigger(origin: &str, name: &str, payload: serde_json::Value) -> Trigger {
    Trigger {
        id: uuid::Uuid::new_v4().to_string(),
        origin: origin.to_string(),
        trigger: name.to_string(),
        payload,
        pool: None,
        destination: None,
        ttl: None,
        flags: None,
        timestamp: None,
    }
}

/// Receive messages until one matches `pred`, panicking on anything else
/// unexpected after a few tries.
pub async fn recv_until(
    client: &mut LatZeroClient,
    mut pred: impl FnMut(&Message) -> bool,
) -> Message {
    for _ in 0..8 {
        let msg = client.recv().await.expect("connection closed while waiting");
        if pred(&msg) {
            return msg;
        }
    }
    panic!("expected message never arrived");
}
