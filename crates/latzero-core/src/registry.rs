// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Application registry.
//!
//! Maintains the live map of AppID -> registration and the index
//! trigger name -> handler AppIDs, processes handshakes (full registration,
//! in-place update, rehydration), and retains disconnected registrations in
//! a rehydration cache until their max age.
//!
//! Per-AppID critical sections serialize handshake/update/disconnect for a
//! given AppID; the inner map lock is never held across persistence I/O.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, instrument, warn};

use latzero_protocol::Handshake;

use crate::error::CoreError;
use crate::persistence::{AppRecord, Persistence};
use crate::pools::{DEFAULT_POOL, PoolManager};
use crate::server::ConnectionHandle;

/// A BOUND application registration.
#[derive(Debug, Clone)]
pub struct AppRegistration {
    pub app_id: String,
    pub pools: Vec<String>,
    pub triggers: Vec<String>,
    pub metadata: serde_json::Map<String, Value>,
    pub protocol_version: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub rehydrated: bool,
    /// Present exactly while the app is BOUND.
    pub connection: Option<ConnectionHandle>,
}

/// Offline registration state retained for rehydration.
#[derive(Debug, Clone)]
pub struct CachedRegistration {
    pub pools: Vec<String>,
    pub triggers: Vec<String>,
    pub metadata: serde_json::Map<String, Value>,
    pub protocol_version: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl From<AppRecord> for CachedRegistration {
    fn from(record: AppRecord) -> Self {
        Self {
            pools: record.pools,
            triggers: record.triggers,
            metadata: record.metadata,
            protocol_version: record.protocol_version,
            registered_at: record.registered_at,
            last_seen_at: record.last_seen_at,
        }
    }
}

/// Result of a processed handshake, echoed back in the ack.
#[derive(Debug)]
pub struct HandshakeOutcome {
    pub app_id: String,
    pub pools: Vec<String>,
    pub triggers: Vec<String>,
    pub rehydrated: bool,
    /// True when this handshake replaced a registration already BOUND.
    pub updated: bool,
    /// A previous connection superseded by this handshake, to be notified
    /// and closed by the transport.
    pub superseded: Option<ConnectionHandle>,
}

#[derive(Default)]
struct RegistryInner {
    /// BOUND apps only.
    apps: HashMap<String, AppRegistration>,
    /// trigger name -> handler AppIDs, insertion ordered.
    trigger_index: HashMap<String, Vec<String>>,
    /// connection id -> AppID.
    bindings: HashMap<u64, String>,
    rehydration: HashMap<String, CachedRegistration>,
}

fn index_remove_app(index: &mut HashMap<String, Vec<String>>, app_id: &str) {
    index.retain(|_, handlers| {
        handlers.retain(|h| h != app_id);
        !handlers.is_empty()
    });
}

fn index_add_app(index: &mut HashMap<String, Vec<String>>, app_id: &str, triggers: &[String]) {
    for trigger in triggers {
        let handlers = index.entry(trigger.clone()).or_default();
        if !handlers.iter().any(|h| h == app_id) {
            handlers.push(app_id.to_string());
        }
    }
}

/// Owns registrations, the trigger index, and the rehydration cache.
pub struct AppRegistry {
    inner: RwLock<RegistryInner>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    persistence: Arc<dyn Persistence>,
    pools: Arc<PoolManager>,
}

impl AppRegistry {
    /// Load the rehydration cache from the durable store.
    pub async fn load(
        persistence: Arc<dyn Persistence>,
        pools: Arc<PoolManager>,
    ) -> Result<Self, CoreError> {
        let mut inner = RegistryInner::default();
        for record in persistence.list_apps().await? {
            inner
                .rehydration
                .insert(record.app_id.clone(), record.into());
        }
        debug!(cached = inner.rehydration.len(), "registrations loaded");

        Ok(Self {
            inner: RwLock::new(inner),
            locks: Mutex::new(HashMap::new()),
            persistence,
            pools,
        })
    }

    /// Acquire the critical section for one AppID. Handshake, update, and
    /// disconnect for a given AppID are linearized through this lock.
    pub async fn app_lock(&self, app_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(app_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Process a handshake on `conn`.
    ///
    /// Classification: "rehydration" when the handshake carries no triggers
    /// and no pools and cached state exists; "full" otherwise. A handshake
    /// for an AppID already BOUND is treated as an update and supersedes
    /// the prior connection.
    #[instrument(skip(self, conn, handshake), fields(app_id = %handshake.app_id, conn = conn.id()))]
    pub async fn handle_handshake(
        &self,
        conn: &ConnectionHandle,
        handshake: Handshake,
    ) -> Result<HandshakeOutcome, CoreError> {
        let app_id = handshake.app_id.clone();
        let _guard = self.app_lock(&app_id).await;

        // Cached state comes from the in-memory cache first, falling back
        // to the durable store (cache misses after a server restart are
        // served from disk).
        let cached = {
            let inner = self.inner.read().await;
            inner.rehydration.get(&app_id).cloned()
        };
        let cached = match cached {
            Some(cached) => Some(cached),
            None => self.persistence.get_app(&app_id).await?.map(Into::into),
        };

        let wants_rehydration = handshake.triggers.is_empty() && handshake.pools.is_empty();
        let rehydration = wants_rehydration && cached.is_some();

        let previous = {
            let inner = self.inner.read().await;
            inner.apps.get(&app_id).cloned()
        };
        let updated = previous.is_some();
        let superseded = previous.as_ref().and_then(|prev| {
            prev.connection
                .as_ref()
                .filter(|existing| existing.id() != conn.id())
                .cloned()
        });

        let now = Utc::now();
        let (pools, triggers, metadata, registered_at) = if rehydration {
            let cached = cached.expect("rehydration requires cached state");
            (
                cached.pools,
                cached.triggers,
                cached.metadata,
                cached.registered_at,
            )
        } else {
            let pools = if handshake.pools.is_empty() {
                vec![DEFAULT_POOL.to_string()]
            } else {
                handshake.pools
            };
            let registered_at = previous
                .as_ref()
                .map(|p| p.registered_at)
                .or_else(|| cached.as_ref().map(|c| c.registered_at))
                .unwrap_or(now);
            (pools, handshake.triggers, handshake.metadata, registered_at)
        };

        // Pools must exist before membership is granted.
        for pool in &pools {
            if !self.pools.pool_exists(pool).await {
                return Err(CoreError::Handshake {
                    reason: format!("pool '{pool}' does not exist"),
                });
            }
        }

        let registration = AppRegistration {
            app_id: app_id.clone(),
            pools: pools.clone(),
            triggers: triggers.clone(),
            metadata,
            protocol_version: handshake.protocol_version,
            registered_at,
            last_seen_at: now,
            rehydrated: rehydration,
            connection: Some(conn.clone()),
        };

        // Durability first; the live maps are only touched once the row is
        // safely down.
        self.persistence
            .put_app(&AppRecord {
                app_id: app_id.clone(),
                pools: pools.clone(),
                triggers: triggers.clone(),
                metadata: registration.metadata.clone(),
                protocol_version: registration.protocol_version.clone(),
                registered_at,
                last_seen_at: now,
            })
            .await?;

        // Membership: drop pools no longer listed, join the listed ones.
        if let Some(prev) = &previous {
            for pool in &prev.pools {
                if !pools.contains(pool) {
                    self.pools.remove_app_from_pool(&app_id, pool).await;
                }
            }
        }
        for pool in &pools {
            self.pools.add_app_to_pool(&app_id, pool).await?;
        }

        {
            let mut inner = self.inner.write().await;
            if let Some(prev) = &previous
                && let Some(old_conn) = &prev.connection
            {
                inner.bindings.remove(&old_conn.id());
            }
            index_remove_app(&mut inner.trigger_index, &app_id);
            index_add_app(&mut inner.trigger_index, &app_id, &triggers);
            inner.bindings.insert(conn.id(), app_id.clone());
            inner.rehydration.remove(&app_id);
            inner.apps.insert(app_id.clone(), registration);
        }

        if updated {
            info!(app_id, "app updated");
        } else {
            info!(app_id, rehydrated = rehydration, "app registered");
        }

        Ok(HandshakeOutcome {
            app_id,
            pools,
            triggers,
            rehydrated: rehydration,
            updated,
            superseded,
        })
    }

    /// Handle a connection close. Moves any bound registration into the
    /// rehydration cache, drops its trigger-index entries and pool
    /// memberships, and returns the AppID that was bound, if any.
    ///
    /// Callers hold the AppID critical section (via [`Self::app_lock`])
    /// around this call and the router cleanup that follows.
    pub async fn disconnect(&self, conn_id: u64) -> Result<Option<String>, CoreError> {
        let app_id = {
            let inner = self.inner.read().await;
            match inner.bindings.get(&conn_id) {
                Some(app_id) => app_id.clone(),
                None => return Ok(None),
            }
        };

        let now = Utc::now();
        let registration = {
            let mut inner = self.inner.write().await;
            // The binding may have been superseded while we waited.
            if inner.bindings.get(&conn_id) != Some(&app_id) {
                return Ok(None);
            }
            inner.bindings.remove(&conn_id);
            let Some(registration) = inner.apps.remove(&app_id) else {
                return Ok(None);
            };
            index_remove_app(&mut inner.trigger_index, &app_id);
            inner.rehydration.insert(
                app_id.clone(),
                CachedRegistration {
                    pools: registration.pools.clone(),
                    triggers: registration.triggers.clone(),
                    metadata: registration.metadata.clone(),
                    protocol_version: registration.protocol_version.clone(),
                    registered_at: registration.registered_at,
                    last_seen_at: now,
                },
            );
            registration
        };

        self.pools.remove_app_from_all(&app_id).await;

        if let Err(e) = self
            .persistence
            .put_app(&AppRecord {
                app_id: app_id.clone(),
                pools: registration.pools,
                triggers: registration.triggers,
                metadata: registration.metadata,
                protocol_version: registration.protocol_version,
                registered_at: registration.registered_at,
                last_seen_at: now,
            })
            .await
        {
            warn!(app_id, error = %e, "failed to persist registration on disconnect");
        }

        info!(app_id, conn_id, "app disconnected, registration cached");
        Ok(Some(app_id))
    }

    /// The AppID bound to a connection, if any.
    pub async fn app_of_conn(&self, conn_id: u64) -> Option<String> {
        self.inner.read().await.bindings.get(&conn_id).cloned()
    }

    /// The live connection of a BOUND app.
    pub async fn connection_of(&self, app_id: &str) -> Option<ConnectionHandle> {
        self.inner
            .read()
            .await
            .apps
            .get(app_id)
            .and_then(|r| r.connection.clone())
    }

    pub async fn is_bound(&self, app_id: &str) -> bool {
        self.inner.read().await.apps.contains_key(app_id)
    }

    /// Handler AppIDs registered for a trigger, in insertion order.
    pub async fn handlers_for(&self, trigger: &str) -> Vec<String> {
        self.inner
            .read()
            .await
            .trigger_index
            .get(trigger)
            .cloned()
            .unwrap_or_default()
    }

    /// Does the BOUND app advertise this trigger?
    pub async fn advertises(&self, app_id: &str, trigger: &str) -> bool {
        self.inner
            .read()
            .await
            .apps
            .get(app_id)
            .is_some_and(|r| r.triggers.iter().any(|t| t == trigger))
    }

    /// Snapshot of a BOUND registration.
    pub async fn registration(&self, app_id: &str) -> Option<AppRegistration> {
        self.inner.read().await.apps.get(app_id).cloned()
    }

    /// Snapshot of all BOUND registrations, for introspection.
    pub async fn list_bound(&self) -> Vec<AppRegistration> {
        let inner = self.inner.read().await;
        let mut apps: Vec<_> = inner.apps.values().cloned().collect();
        apps.sort_by(|a, b| a.app_id.cmp(&b.app_id));
        apps
    }

    /// Number of entries in the rehydration cache.
    pub async fn cached_count(&self) -> usize {
        self.inner.read().await.rehydration.len()
    }

    /// Purge rehydration-cache entries older than `max_age_ms`, deleting
    /// their durable rows. Returns the number purged.
    pub async fn purge_rehydration_cache(&self, max_age_ms: u64) -> usize {
        let cutoff = Utc::now() - ChronoDuration::milliseconds(max_age_ms as i64);
        let expired: Vec<String> = {
            let inner = self.inner.read().await;
            inner
                .rehydration
                .iter()
                .filter(|(_, cached)| cached.last_seen_at < cutoff)
                .map(|(app_id, _)| app_id.clone())
                .collect()
        };

        let mut purged = 0;
        for app_id in expired {
            let _guard = self.app_lock(&app_id).await;
            if let Err(e) = self.persistence.delete_app(&app_id).await {
                warn!(app_id, error = %e, "failed to delete expired registration");
                continue;
            }
            let mut inner = self.inner.write().await;
            if inner.rehydration.remove(&app_id).is_some() {
                purged += 1;
                debug!(app_id, "expired registration purged");
            }
        }
        purged
    }

    /// Persist every BOUND registration. Called during graceful shutdown.
    pub async fn persist_all(&self) -> Result<(), CoreError> {
        let registrations = self.list_bound().await;
        let now = Utc::now();
        for registration in registrations {
            self.persistence
                .put_app(&AppRecord {
                    app_id: registration.app_id,
                    pools: registration.pools,
                    triggers: registration.triggers,
                    metadata: registration.metadata,
                    protocol_version: registration.protocol_version,
                    registered_at: registration.registered_at,
                    last_seen_at: now,
                })
                .await?;
        }
        Ok(())
    }
}
