// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trigger routing.
//!
//! The router resolves handlers, selects a destination, correlates
//! responses back to originators, and enforces TTLs. Every in-flight
//! request is a record in the table below; a record is removed exactly
//! once, by response, by timeout, or by disconnect cleanup.
//!
//! Record state machine:
//! `PENDING -> DISPATCHED -> (COMPLETED | TIMED_OUT | FAILED)`; terminal
//! states delete the record. Each record owns a cancellation token; its
//! expiry task fires at `created_at + ttl` unless the token is cancelled
//! first. A periodic sweeper reaps stragglers.
//!
//! Ordering: the record is inserted into the table before the trigger is
//! written to the destination socket, so a response racing the dispatch
//! can never miss its record.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use latzero_protocol::{Emit, ErrorCode, Message, Response, Status, Trigger, error_message};

use crate::config::{Config, RoutingPolicy};
use crate::error::CoreError;
use crate::persistence::{Persistence, TriggerRecordRow};
use crate::pools::{DEFAULT_POOL, PoolManager};
use crate::registry::AppRegistry;
use crate::server::ConnectionHandle;

/// Router tuning, extracted from the server [`Config`].
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub max_inflight: usize,
    pub default_ttl_ms: u64,
    pub max_ttl_ms: u64,
    pub policy: RoutingPolicy,
    pub ema_alpha: f64,
}

impl From<&Config> for RouterConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_inflight: config.max_inflight,
            default_ttl_ms: config.default_ttl_ms,
            max_ttl_ms: config.max_ttl_ms,
            policy: config.routing_policy,
            ema_alpha: config.response_ema_alpha,
        }
    }
}

/// Lifecycle state of an in-flight record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Pending,
    Dispatched,
}

/// One in-flight trigger request.
#[derive(Debug)]
struct TriggerRecord {
    id: String,
    origin: String,
    destination: String,
    pool: String,
    trigger: String,
    created_at: DateTime<Utc>,
    created_instant: Instant,
    ttl: Duration,
    state: RecordState,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RouterInner {
    inflight: HashMap<String, TriggerRecord>,
    /// Per-trigger round-robin cursors.
    cursors: HashMap<String, usize>,
}

/// Counters and the response-time moving average.
#[derive(Debug, Clone, Default)]
pub struct RouterStats {
    pub dispatched: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub failed: u64,
    pub emitted: u64,
    pub avg_response_ms: f64,
}

/// Routes triggers and correlates responses.
pub struct TriggerRouter {
    inner: Mutex<RouterInner>,
    stats: Mutex<RouterStats>,
    config: RouterConfig,
    registry: Arc<AppRegistry>,
    pools: Arc<PoolManager>,
    persistence: Arc<dyn Persistence>,
}

impl TriggerRouter {
    pub fn new(
        config: RouterConfig,
        registry: Arc<AppRegistry>,
        pools: Arc<PoolManager>,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        Self {
            inner: Mutex::new(RouterInner::default()),
            stats: Mutex::new(RouterStats::default()),
            config,
            registry,
            pools,
            persistence,
        }
    }

    pub fn inflight_count(&self) -> usize {
        self.inner.lock().expect("router lock").inflight.len()
    }

    pub fn stats(&self) -> RouterStats {
        self.stats.lock().expect("stats lock").clone()
    }

    fn count_failed(&self) {
        self.stats.lock().expect("stats lock").failed += 1;
    }

    /// Process a `trigger` request arriving on `conn`.
    ///
    /// Every rejection is replied to the originating connection as an
    /// `error` correlated to the trigger id.
    #[instrument(skip(self, conn, msg), fields(id = %msg.id, trigger = %msg.trigger))]
    pub async fn handle_trigger(self: &Arc<Self>, conn: &ConnectionHandle, msg: Trigger) {
        if let Err(e) = self.route_trigger(conn, &msg).await {
            self.count_failed();
            debug!(id = msg.id, error = %e, "trigger rejected");
            let _ = conn.send(e.to_wire(Some(&msg.id)));
        }
    }

    async fn route_trigger(
        self: &Arc<Self>,
        conn: &ConnectionHandle,
        msg: &Trigger,
    ) -> Result<(), CoreError> {
        // 1. The origin connection must be bound, and to the claimed AppID.
        let origin = self
            .registry
            .app_of_conn(conn.id())
            .await
            .ok_or_else(|| CoreError::validation("origin", "connection is not bound"))?;
        if origin != msg.origin {
            return Err(CoreError::validation(
                "origin",
                "origin does not match the connection's registration",
            ));
        }

        // 2. Resolve the pool.
        let pool = msg.pool.clone().unwrap_or_else(|| DEFAULT_POOL.to_string());
        if !self.pools.pool_exists(&pool).await {
            return Err(CoreError::NotFound {
                what: "pool",
                name: pool,
            });
        }

        // 3. The origin must be allowed to trigger inside the pool.
        self.pools.access_check(&origin, &pool, "trigger").await?;

        // 4-5. Resolve candidate handlers.
        let candidates = match &msg.destination {
            Some(destination) => {
                self.validate_routing(&origin, destination, &msg.trigger).await?;
                vec![destination.clone()]
            }
            None => {
                let mut candidates = Vec::new();
                for handler in self.registry.handlers_for(&msg.trigger).await {
                    if self.registry.is_bound(&handler).await
                        && self.pools.validate_membership(&handler, &pool).await
                    {
                        candidates.push(handler);
                    }
                }
                candidates
            }
        };

        // 6. Nothing can service the trigger.
        if candidates.is_empty() {
            return Err(CoreError::NotFound {
                what: "handler",
                name: msg.trigger.clone(),
            });
        }

        // 7. Pick one destination.
        let destination = self.select_destination(&msg.trigger, &candidates);

        // Intra-app calls are explicitly unsupported.
        if destination == origin {
            return Err(CoreError::ShortCircuit { app_id: origin });
        }

        let destination_conn = self
            .registry
            .connection_of(&destination)
            .await
            .ok_or_else(|| CoreError::Routing {
                reason: format!("destination '{destination}' is not active"),
            })?;

        // 8-9. Create and insert the record before anything touches the
        // socket.
        let ttl = Duration::from_millis(
            msg.ttl
                .unwrap_or(self.config.default_ttl_ms)
                .min(self.config.max_ttl_ms),
        );
        let cancel = CancellationToken::new();
        let record = TriggerRecord {
            id: msg.id.clone(),
            origin: origin.clone(),
            destination: destination.clone(),
            pool: pool.clone(),
            trigger: msg.trigger.clone(),
            created_at: Utc::now(),
            created_instant: Instant::now(),
            ttl,
            state: RecordState::Pending,
            cancel: cancel.clone(),
        };

        {
            let mut inner = self.inner.lock().expect("router lock");
            if inner.inflight.len() >= self.config.max_inflight {
                return Err(CoreError::TooManyRequests {
                    limit: self.config.max_inflight,
                });
            }
            if inner.inflight.contains_key(&msg.id) {
                return Err(CoreError::validation("id", "trigger id already in flight"));
            }
            inner.inflight.insert(msg.id.clone(), record);
        }

        if let Err(e) = self
            .persistence
            .put_trigger_record(&TriggerRecordRow {
                id: msg.id.clone(),
                origin: origin.clone(),
                destination: Some(destination.clone()),
                pool,
                trigger: msg.trigger.clone(),
                created_at: Utc::now(),
                ttl_ms: ttl.as_millis() as u64,
                dispatched_to: Some(destination.clone()),
                state: "pending".to_string(),
            })
            .await
        {
            warn!(id = msg.id, error = %e, "failed to mirror trigger record");
        }

        self.spawn_expiry(msg.id.clone(), ttl, cancel);

        // 10. Dispatch. A write failure fails the record immediately.
        if let Err(e) = destination_conn.send(Message::Trigger(msg.clone())) {
            self.remove_record(&msg.id).await;
            return Err(CoreError::Routing {
                reason: format!("send to '{destination}' failed: {e}"),
            });
        }

        {
            let mut inner = self.inner.lock().expect("router lock");
            if let Some(record) = inner.inflight.get_mut(&msg.id) {
                record.state = RecordState::Dispatched;
            }
        }
        self.stats.lock().expect("stats lock").dispatched += 1;
        debug!(id = msg.id, destination, "trigger dispatched");
        Ok(())
    }

    /// Explicit-destination check: the destination must register the
    /// trigger and share at least one pool with the origin.
    pub async fn validate_routing(
        &self,
        origin: &str,
        destination: &str,
        trigger: &str,
    ) -> Result<(), CoreError> {
        if !self.registry.is_bound(destination).await
            || !self.registry.advertises(destination, trigger).await
        {
            return Err(CoreError::NotFound {
                what: "handler",
                name: trigger.to_string(),
            });
        }
        let origin_pools = self.pools.pools_of_app(origin).await;
        let shares_pool = {
            let mut shared = false;
            for pool in &origin_pools {
                if self.pools.validate_membership(destination, pool).await {
                    shared = true;
                    break;
                }
            }
            shared
        };
        if !shares_pool {
            return Err(CoreError::AccessDenied {
                app_id: origin.to_string(),
                resource: format!("destination '{destination}'"),
            });
        }
        Ok(())
    }

    /// Pick one destination out of a non-empty candidate set, per the
    /// configured policy. Ties break by insertion order.
    fn select_destination(&self, trigger: &str, candidates: &[String]) -> String {
        let index = match self.config.policy {
            // Load-balanced falls back to round-robin until per-handler
            // load metrics exist.
            RoutingPolicy::RoundRobin | RoutingPolicy::LoadBalanced => {
                let mut inner = self.inner.lock().expect("router lock");
                let cursor = inner.cursors.entry(trigger.to_string()).or_insert(0);
                let index = *cursor % candidates.len();
                *cursor = cursor.wrapping_add(1);
                index
            }
            RoutingPolicy::Random => rand::thread_rng().gen_range(0..candidates.len()),
            RoutingPolicy::FirstAvailable => 0,
        };
        candidates[index].clone()
    }

    fn spawn_expiry(self: &Arc<Self>, id: String, ttl: Duration, cancel: CancellationToken) {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {}

                _ = tokio::time::sleep(ttl) => {
                    router.expire(&id).await;
                }
            }
        });
    }

    /// Fire the timeout path for a record, if it is still in flight.
    async fn expire(self: &Arc<Self>, id: &str) {
        let Some(record) = self.take_record(id) else {
            return;
        };
        self.delete_mirror(id).await;
        self.stats.lock().expect("stats lock").timed_out += 1;
        info!(id, trigger = record.trigger, "trigger timed out");

        let timeout = CoreError::Timeout { id: id.to_string() };
        if let Some(conn) = self.registry.connection_of(&record.origin).await {
            let _ = conn.send(timeout.to_wire(Some(id)));
        }
    }

    /// Process a `response` correlated to an in-flight record. Responses
    /// for unknown records (e.g. after a timeout) are dropped.
    #[instrument(skip(self, msg), fields(correlation = msg.correlation()))]
    pub async fn handle_response(&self, msg: Response) {
        let Some(correlation) = msg.correlation().map(str::to_string) else {
            warn!("response without correlation id dropped");
            return;
        };
        let Some(record) = self.take_record(&correlation) else {
            warn!(correlation, "response for unknown record dropped");
            return;
        };
        self.delete_mirror(&correlation).await;

        let elapsed_ms = record.created_instant.elapsed().as_secs_f64() * 1000.0;
        {
            let mut stats = self.stats.lock().expect("stats lock");
            stats.completed += 1;
            stats.avg_response_ms = if stats.avg_response_ms == 0.0 {
                elapsed_ms
            } else {
                self.config.ema_alpha * elapsed_ms
                    + (1.0 - self.config.ema_alpha) * stats.avg_response_ms
            };
        }

        // Responses route to the originator by correlation only; any
        // `destination` on the original trigger is irrelevant here.
        match self.registry.connection_of(&record.origin).await {
            Some(conn) => {
                let _ = conn.send(Message::Response(msg));
            }
            None => {
                debug!(correlation, origin = record.origin, "originator gone, response dropped");
            }
        }
    }

    /// A wire `error` carrying an in-flight correlation id terminates the
    /// record exactly like an error-status response.
    pub async fn handle_error(&self, correlation_id: &str, error: String, code: ErrorCode) {
        let Some(record) = self.take_record(correlation_id) else {
            warn!(correlation_id, "error for unknown record dropped");
            return;
        };
        self.delete_mirror(correlation_id).await;
        self.stats.lock().expect("stats lock").completed += 1;

        if let Some(conn) = self.registry.connection_of(&record.origin).await {
            let _ = conn.send(error_message(Some(correlation_id), code, error));
        }
    }

    /// Fire-and-forget delivery to every active handler of the trigger in
    /// the pool. No record is created and no response is tracked.
    #[instrument(skip(self, conn, msg), fields(trigger = %msg.trigger))]
    pub async fn handle_emit(&self, conn: &ConnectionHandle, msg: Emit) {
        let Some(origin) = self.registry.app_of_conn(conn.id()).await else {
            let _ = conn.send(
                CoreError::validation("origin", "connection is not bound").to_wire(None),
            );
            return;
        };

        let pool = msg.pool.clone().unwrap_or_else(|| DEFAULT_POOL.to_string());
        if !self.pools.pool_exists(&pool).await {
            return;
        }
        if self.pools.access_check(&origin, &pool, "trigger").await.is_err() {
            return;
        }

        let mut delivered = 0;
        for handler in self.registry.handlers_for(&msg.trigger).await {
            if !self.pools.validate_membership(&handler, &pool).await {
                continue;
            }
            if let Some(handler_conn) = self.registry.connection_of(&handler).await
                && handler_conn.send(Message::Emit(msg.clone())).is_ok()
            {
                delivered += 1;
            }
        }
        self.stats.lock().expect("stats lock").emitted += 1;
        debug!(trigger = msg.trigger, delivered, "emit fanned out");
    }

    /// Fail every record anchored on `app_id`, as origin or destination.
    /// Originators that are still live receive a `ROUTING_ERROR`.
    pub async fn fail_for_app(&self, app_id: &str) {
        let affected: Vec<TriggerRecord> = {
            let mut inner = self.inner.lock().expect("router lock");
            let ids: Vec<String> = inner
                .inflight
                .values()
                .filter(|r| r.origin == app_id || r.destination == app_id)
                .map(|r| r.id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| inner.inflight.remove(&id))
                .collect()
        };

        if affected.is_empty() {
            return;
        }
        info!(app_id, count = affected.len(), "failing in-flight records for app");

        for record in affected {
            record.cancel.cancel();
            self.delete_mirror(&record.id).await;
            self.stats.lock().expect("stats lock").failed += 1;

            if record.origin != app_id
                && let Some(conn) = self.registry.connection_of(&record.origin).await
            {
                let error = CoreError::Routing {
                    reason: format!("destination '{app_id}' disconnected mid-flight"),
                };
                let _ = conn.send(error.to_wire(Some(&record.id)));
            }
        }
    }

    /// Reap records whose individual timers failed to fire. Invoked
    /// periodically by the runtime.
    pub async fn sweep(self: &Arc<Self>) -> usize {
        let expired: Vec<String> = {
            let inner = self.inner.lock().expect("router lock");
            inner
                .inflight
                .values()
                .filter(|r| r.created_instant.elapsed() >= r.ttl)
                .map(|r| r.id.clone())
                .collect()
        };
        let count = expired.len();
        for id in expired {
            self.expire(&id).await;
        }
        if count > 0 {
            warn!(count, "sweeper reaped straggler records");
        }
        count
    }

    /// Drain the table during shutdown: every remaining record times out.
    pub async fn drain(self: &Arc<Self>) {
        let ids: Vec<String> = {
            let inner = self.inner.lock().expect("router lock");
            inner.inflight.keys().cloned().collect()
        };
        for id in ids {
            self.expire(&id).await;
        }
    }

    fn take_record(&self, id: &str) -> Option<TriggerRecord> {
        let mut inner = self.inner.lock().expect("router lock");
        let record = inner.inflight.remove(id)?;
        record.cancel.cancel();
        Some(record)
    }

    async fn remove_record(&self, id: &str) {
        if let Some(record) = self.take_record(id) {
            record.cancel.cancel();
        }
        self.delete_mirror(id).await;
    }

    async fn delete_mirror(&self, id: &str) {
        if let Err(e) = self.persistence.delete_trigger_record(id).await {
            warn!(id, error = %e, "failed to delete trigger mirror row");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryPersistence;
    use crate::security::AllowAllSecurity;
    use latzero_protocol::Handshake;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        router: Arc<TriggerRouter>,
        registry: Arc<AppRegistry>,
        pools: Arc<PoolManager>,
    }

    async fn fixture(policy: RoutingPolicy) -> Fixture {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let pools = Arc::new(
            PoolManager::load(persistence.clone(), Arc::new(AllowAllSecurity))
                .await
                .unwrap(),
        );
        let registry = Arc::new(
            AppRegistry::load(persistence.clone(), pools.clone())
                .await
                .unwrap(),
        );
        let router = Arc::new(TriggerRouter::new(
            RouterConfig {
                max_inflight: 4,
                default_ttl_ms: 30_000,
                max_ttl_ms: 60_000,
                policy,
                ema_alpha: 0.1,
            },
            registry.clone(),
            pools.clone(),
            persistence,
        ));
        Fixture {
            router,
            registry,
            pools,
        }
    }

    async fn bind(
        fixture: &Fixture,
        conn_id: u64,
        app_id: &str,
        triggers: &[&str],
    ) -> (ConnectionHandle, UnboundedReceiver<Message>) {
        let (conn, rx) = ConnectionHandle::pair(conn_id);
        fixture
            .registry
            .handle_handshake(
                &conn,
                Handshake {
                    id: Some(uuid::Uuid::new_v4().to_string()),
                    app_id: app_id.to_string(),
                    pools: vec![DEFAULT_POOL.to_string()],
                    triggers: triggers.iter().map(|s| s.to_string()).collect(),
                    metadata: serde_json::Map::new(),
                    protocol_version: None,
                },
            )
            .await
            .unwrap();
        (conn, rx)
    }

    fn trigger_msg(id: &str, origin: &str, trigger: &str) -> Trigger {
        Trigger {
            id: id.to_string(),
            origin: origin.to_string(),
            trigger: trigger.to_string(),
            payload: serde_json::json!({"x": 1}),
            pool: None,
            destination: None,
            ttl: None,
            flags: None,
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn test_dispatch_and_response_round_trip() {
        let f = fixture(RoutingPolicy::RoundRobin).await;
        let (_handler_conn, mut handler_rx) = bind(&f, 1, "handler", &["echo"]).await;
        let (caller_conn, mut caller_rx) = bind(&f, 2, "caller", &[]).await;

        let id = uuid::Uuid::new_v4().to_string();
        f.router
            .handle_trigger(&caller_conn, trigger_msg(&id, "caller", "echo"))
            .await;

        // Handler received the original trigger.
        let Message::Trigger(received) = handler_rx.recv().await.unwrap() else {
            panic!("expected trigger");
        };
        assert_eq!(received.id, id);
        assert_eq!(f.router.inflight_count(), 1);

        // Handler responds; the record resolves to the caller.
        f.router
            .handle_response(Response {
                id: None,
                correlation_id: Some(id.clone()),
                status: Status::Success,
                result: Some(serde_json::json!({"x": 1})),
                error: None,
            })
            .await;

        let Message::Response(resp) = caller_rx.recv().await.unwrap() else {
            panic!("expected response");
        };
        assert_eq!(resp.correlation(), Some(id.as_str()));
        assert_eq!(f.router.inflight_count(), 0);
        assert_eq!(f.router.stats().completed, 1);
        assert!(f.router.stats().avg_response_ms >= 0.0);
    }

    #[tokio::test]
    async fn test_no_handler_yields_not_found() {
        let f = fixture(RoutingPolicy::RoundRobin).await;
        let (caller_conn, mut caller_rx) = bind(&f, 1, "caller", &[]).await;

        let id = uuid::Uuid::new_v4().to_string();
        f.router
            .handle_trigger(&caller_conn, trigger_msg(&id, "caller", "ghost"))
            .await;

        let Message::Error(err) = caller_rx.recv().await.unwrap() else {
            panic!("expected error");
        };
        assert_eq!(err.error_code, ErrorCode::NotFound);
        assert_eq!(err.correlation_id.as_deref(), Some(id.as_str()));
        assert_eq!(f.router.inflight_count(), 0);
        assert_eq!(f.router.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_ttl_expiry_times_out() {
        let f = fixture(RoutingPolicy::RoundRobin).await;
        let (_handler_conn, _handler_rx) = bind(&f, 1, "handler", &["slow"]).await;
        let (caller_conn, mut caller_rx) = bind(&f, 2, "caller", &[]).await;

        let id = uuid::Uuid::new_v4().to_string();
        let mut msg = trigger_msg(&id, "caller", "slow");
        msg.ttl = Some(50);
        f.router.handle_trigger(&caller_conn, msg).await;
        assert_eq!(f.router.inflight_count(), 1);

        let Message::Error(err) = caller_rx.recv().await.unwrap() else {
            panic!("expected timeout error");
        };
        assert_eq!(err.error_code, ErrorCode::Timeout);
        assert_eq!(f.router.inflight_count(), 0);
        assert_eq!(f.router.stats().timed_out, 1);

        // A late response is dropped silently.
        f.router
            .handle_response(Response {
                id: None,
                correlation_id: Some(id),
                status: Status::Success,
                result: None,
                error: None,
            })
            .await;
        assert_eq!(f.router.stats().completed, 0);
    }

    #[tokio::test]
    async fn test_zero_ttl_times_out_immediately() {
        let f = fixture(RoutingPolicy::RoundRobin).await;
        let (_handler_conn, _handler_rx) = bind(&f, 1, "handler", &["x"]).await;
        let (caller_conn, mut caller_rx) = bind(&f, 2, "caller", &[]).await;

        let id = uuid::Uuid::new_v4().to_string();
        let mut msg = trigger_msg(&id, "caller", "x");
        msg.ttl = Some(0);
        f.router.handle_trigger(&caller_conn, msg).await;

        let Message::Error(err) = caller_rx.recv().await.unwrap() else {
            panic!("expected timeout error");
        };
        assert_eq!(err.error_code, ErrorCode::Timeout);
    }

    #[tokio::test]
    async fn test_disconnect_fails_records_for_destination() {
        let f = fixture(RoutingPolicy::RoundRobin).await;
        let (_handler_conn, _handler_rx) = bind(&f, 1, "handler", &["x"]).await;
        let (caller_conn, mut caller_rx) = bind(&f, 2, "caller", &[]).await;

        let id = uuid::Uuid::new_v4().to_string();
        f.router
            .handle_trigger(&caller_conn, trigger_msg(&id, "caller", "x"))
            .await;
        assert_eq!(f.router.inflight_count(), 1);

        f.registry.disconnect(1).await.unwrap();
        f.router.fail_for_app("handler").await;

        let Message::Error(err) = caller_rx.recv().await.unwrap() else {
            panic!("expected routing error");
        };
        assert_eq!(err.error_code, ErrorCode::RoutingError);
        assert_eq!(f.router.inflight_count(), 0);
    }

    #[tokio::test]
    async fn test_short_circuit_rejected() {
        let f = fixture(RoutingPolicy::RoundRobin).await;
        let (conn, mut rx) = bind(&f, 1, "solo", &["self-call"]).await;

        let id = uuid::Uuid::new_v4().to_string();
        f.router
            .handle_trigger(&conn, trigger_msg(&id, "solo", "self-call"))
            .await;

        let Message::Error(err) = rx.recv().await.unwrap() else {
            panic!("expected error");
        };
        assert_eq!(err.error_code, ErrorCode::ShortCircuitNotImplemented);
        assert_eq!(f.router.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_inflight_cap() {
        let f = fixture(RoutingPolicy::RoundRobin).await;
        let (_handler_conn, _handler_rx) = bind(&f, 1, "handler", &["x"]).await;
        let (caller_conn, mut caller_rx) = bind(&f, 2, "caller", &[]).await;

        for _ in 0..4 {
            let id = uuid::Uuid::new_v4().to_string();
            f.router
                .handle_trigger(&caller_conn, trigger_msg(&id, "caller", "x"))
                .await;
        }
        assert_eq!(f.router.inflight_count(), 4);

        let id = uuid::Uuid::new_v4().to_string();
        f.router
            .handle_trigger(&caller_conn, trigger_msg(&id, "caller", "x"))
            .await;

        let Message::Error(err) = caller_rx.recv().await.unwrap() else {
            panic!("expected error");
        };
        assert_eq!(err.error_code, ErrorCode::TooManyRequests);
    }

    #[tokio::test]
    async fn test_round_robin_rotates_in_insertion_order() {
        let f = fixture(RoutingPolicy::RoundRobin).await;
        let candidates = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let picks: Vec<String> = (0..4)
            .map(|_| f.router.select_destination("t", &candidates))
            .collect();
        assert_eq!(picks, ["a", "b", "c", "a"]);
    }

    #[tokio::test]
    async fn test_first_available_sticks_to_head() {
        let f = fixture(RoutingPolicy::FirstAvailable).await;
        let candidates = vec!["a".to_string(), "b".to_string()];
        for _ in 0..3 {
            assert_eq!(f.router.select_destination("t", &candidates), "a");
        }
    }

    #[tokio::test]
    async fn test_explicit_destination_requires_shared_pool_and_trigger() {
        let f = fixture(RoutingPolicy::RoundRobin).await;
        f.pools
            .create("island", "local", false, serde_json::Map::new())
            .await
            .unwrap();
        let (_h, _hrx) = bind(&f, 1, "handler", &["x"]).await;
        let (caller_conn, mut caller_rx) = bind(&f, 2, "caller", &[]).await;

        // Destination does not advertise the trigger.
        let id = uuid::Uuid::new_v4().to_string();
        let mut msg = trigger_msg(&id, "caller", "y");
        msg.destination = Some("handler".to_string());
        f.router.handle_trigger(&caller_conn, msg).await;
        let Message::Error(err) = caller_rx.recv().await.unwrap() else {
            panic!("expected error");
        };
        assert_eq!(err.error_code, ErrorCode::NotFound);

        // Destination valid: explicit routing succeeds.
        let id = uuid::Uuid::new_v4().to_string();
        let mut msg = trigger_msg(&id, "caller", "x");
        msg.destination = Some("handler".to_string());
        f.router.handle_trigger(&caller_conn, msg).await;
        assert_eq!(f.router.inflight_count(), 1);
    }

    #[tokio::test]
    async fn test_emit_fans_out_without_records() {
        let f = fixture(RoutingPolicy::RoundRobin).await;
        let (_h1, mut rx1) = bind(&f, 1, "h1", &["tick"]).await;
        let (_h2, mut rx2) = bind(&f, 2, "h2", &["tick"]).await;
        let (caller_conn, _caller_rx) = bind(&f, 3, "caller", &[]).await;

        f.router
            .handle_emit(
                &caller_conn,
                Emit {
                    trigger: "tick".to_string(),
                    payload: serde_json::json!({"n": 1}),
                    pool: None,
                },
            )
            .await;

        assert!(matches!(rx1.recv().await.unwrap(), Message::Emit(_)));
        assert!(matches!(rx2.recv().await.unwrap(), Message::Emit(_)));
        assert_eq!(f.router.inflight_count(), 0);
        assert_eq!(f.router.stats().emitted, 1);
    }

    #[tokio::test]
    async fn test_sweeper_reaps_stragglers() {
        let f = fixture(RoutingPolicy::RoundRobin).await;
        let (_handler_conn, _handler_rx) = bind(&f, 1, "handler", &["x"]).await;
        let (caller_conn, _caller_rx) = bind(&f, 2, "caller", &[]).await;

        let id = uuid::Uuid::new_v4().to_string();
        let mut msg = trigger_msg(&id, "caller", "x");
        msg.ttl = Some(10);
        f.router.handle_trigger(&caller_conn, msg).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        // Whether the timer or the sweeper got there first, the table ends
        // empty.
        f.router.sweep().await;
        assert_eq!(f.router.inflight_count(), 0);
    }
}
