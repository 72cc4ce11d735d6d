// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pool lifecycle and membership.
//!
//! The pool manager owns pool metadata and the bidirectional app<->pool
//! membership index, and enforces per-pool access policy for pool-scoped
//! operations. Membership is runtime state derived from app registrations;
//! pool metadata is persisted on every mutation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use latzero_protocol::validate_pool_name;

use crate::error::CoreError;
use crate::persistence::{Persistence, PoolRecord};
use crate::security::SecurityProvider;

/// Sentinel pool every app may use without creating anything.
pub const DEFAULT_POOL: &str = "default";
/// Sentinel pool reserved for server-internal coordination.
pub const SYSTEM_POOL: &str = "system";

/// Fields a pool update may change. Sentinels accept only `properties`,
/// `policies`, and `owners`.
#[derive(Debug, Clone, Default)]
pub struct PoolUpdate {
    pub pool_type: Option<String>,
    pub encrypted: Option<bool>,
    pub owners: Option<Vec<String>>,
    pub policies: Option<HashMap<String, Vec<String>>>,
    pub properties: Option<serde_json::Map<String, Value>>,
    pub max_memory_blocks: Option<u32>,
    pub max_triggers: Option<u32>,
}

#[derive(Default)]
struct PoolsInner {
    pools: HashMap<String, PoolRecord>,
    /// pool -> member AppIDs, insertion ordered.
    members: HashMap<String, Vec<String>>,
    /// app -> pools, insertion ordered.
    app_pools: HashMap<String, Vec<String>>,
}

/// Owns pool metadata and the membership index.
pub struct PoolManager {
    inner: RwLock<PoolsInner>,
    persistence: Arc<dyn Persistence>,
    security: Arc<dyn SecurityProvider>,
}

fn sentinel_record(name: &str) -> PoolRecord {
    let now = Utc::now();
    PoolRecord {
        name: name.to_string(),
        pool_type: "local".to_string(),
        encrypted: false,
        owners: vec![],
        policies: HashMap::new(),
        properties: serde_json::Map::new(),
        max_memory_blocks: None,
        max_triggers: None,
        created_at: now,
        updated_at: now,
    }
}

impl PoolManager {
    /// Rehydrate all pools from the durable store, re-creating missing
    /// sentinels.
    pub async fn load(
        persistence: Arc<dyn Persistence>,
        security: Arc<dyn SecurityProvider>,
    ) -> Result<Self, CoreError> {
        let mut inner = PoolsInner::default();
        for record in persistence.list_pools().await? {
            inner.members.entry(record.name.clone()).or_default();
            inner.pools.insert(record.name.clone(), record);
        }

        for sentinel in [DEFAULT_POOL, SYSTEM_POOL] {
            if !inner.pools.contains_key(sentinel) {
                let record = sentinel_record(sentinel);
                persistence.put_pool(&record).await?;
                inner.members.entry(sentinel.to_string()).or_default();
                inner.pools.insert(sentinel.to_string(), record);
                info!(pool = sentinel, "sentinel pool created");
            }
        }

        debug!(count = inner.pools.len(), "pools loaded");
        Ok(Self {
            inner: RwLock::new(inner),
            persistence,
            security,
        })
    }

    /// Create a pool. Fails if the name exists or the type/encrypted
    /// combination is inconsistent.
    pub async fn create(
        &self,
        name: &str,
        pool_type: &str,
        encrypted: bool,
        properties: serde_json::Map<String, Value>,
    ) -> Result<PoolRecord, CoreError> {
        validate_pool_name(name)?;
        if !matches!(pool_type, "local" | "global" | "encrypted") {
            return Err(CoreError::validation(
                "type",
                "must be one of local, global, encrypted",
            ));
        }
        if pool_type == "encrypted" && !encrypted {
            return Err(CoreError::validation(
                "encrypted",
                "pools of type 'encrypted' must set the encrypted flag",
            ));
        }

        {
            let inner = self.inner.read().await;
            if inner.pools.contains_key(name) {
                return Err(CoreError::validation("name", "pool already exists"));
            }
        }

        let encrypted = encrypted || pool_type == "encrypted";
        if encrypted {
            // Encrypted pools require key material before first use.
            self.security.prepare_encrypted_pool(name).await?;
        }

        let now = Utc::now();
        let record = PoolRecord {
            name: name.to_string(),
            pool_type: pool_type.to_string(),
            encrypted,
            owners: vec![],
            policies: HashMap::new(),
            properties,
            max_memory_blocks: None,
            max_triggers: None,
            created_at: now,
            updated_at: now,
        };
        self.persistence.put_pool(&record).await?;

        let mut inner = self.inner.write().await;
        inner.members.entry(name.to_string()).or_default();
        inner.pools.insert(name.to_string(), record.clone());
        info!(pool = name, pool_type, encrypted, "pool created");
        Ok(record)
    }

    /// Update pool fields. Sentinels refuse type/encrypted changes.
    pub async fn update(&self, name: &str, updates: PoolUpdate) -> Result<PoolRecord, CoreError> {
        let mut record = self
            .get(name)
            .await
            .ok_or_else(|| CoreError::NotFound {
                what: "pool",
                name: name.to_string(),
            })?;

        let sentinel = matches!(name, DEFAULT_POOL | SYSTEM_POOL);
        if sentinel && (updates.pool_type.is_some() || updates.encrypted.is_some()) {
            return Err(CoreError::validation(
                "pool",
                "sentinel pools cannot change type or encryption",
            ));
        }

        if let Some(pool_type) = updates.pool_type {
            record.pool_type = pool_type;
        }
        if let Some(encrypted) = updates.encrypted {
            record.encrypted = encrypted;
        }
        if let Some(owners) = updates.owners {
            record.owners = owners;
        }
        if let Some(policies) = updates.policies {
            record.policies = policies;
        }
        if let Some(properties) = updates.properties {
            record.properties = properties;
        }
        if let Some(limit) = updates.max_memory_blocks {
            record.max_memory_blocks = Some(limit);
        }
        if let Some(limit) = updates.max_triggers {
            record.max_triggers = Some(limit);
        }
        record.updated_at = Utc::now();

        self.persistence.put_pool(&record).await?;
        let mut inner = self.inner.write().await;
        inner.pools.insert(name.to_string(), record.clone());
        Ok(record)
    }

    /// Remove a pool. Fails for sentinels and for pools that still have
    /// members.
    pub async fn remove(&self, name: &str) -> Result<(), CoreError> {
        if matches!(name, DEFAULT_POOL | SYSTEM_POOL) {
            return Err(CoreError::validation(
                "pool",
                "sentinel pools cannot be removed",
            ));
        }

        {
            let inner = self.inner.read().await;
            if !inner.pools.contains_key(name) {
                return Err(CoreError::NotFound {
                    what: "pool",
                    name: name.to_string(),
                });
            }
            if inner.members.get(name).is_some_and(|m| !m.is_empty()) {
                return Err(CoreError::validation(
                    "pool",
                    "pool still has members",
                ));
            }
        }

        self.persistence.delete_pool(name).await?;
        let mut inner = self.inner.write().await;
        inner.pools.remove(name);
        inner.members.remove(name);
        info!(pool = name, "pool removed");
        Ok(())
    }

    /// Add an app to a pool, maintaining both directions. Idempotent.
    pub async fn add_app_to_pool(&self, app_id: &str, pool: &str) -> Result<(), CoreError> {
        let mut inner = self.inner.write().await;
        if !inner.pools.contains_key(pool) {
            return Err(CoreError::NotFound {
                what: "pool",
                name: pool.to_string(),
            });
        }
        let members = inner.members.entry(pool.to_string()).or_default();
        if !members.iter().any(|m| m == app_id) {
            members.push(app_id.to_string());
        }
        let pools = inner.app_pools.entry(app_id.to_string()).or_default();
        if !pools.iter().any(|p| p == pool) {
            pools.push(pool.to_string());
        }
        Ok(())
    }

    /// Remove an app from a pool, maintaining both directions. Idempotent.
    pub async fn remove_app_from_pool(&self, app_id: &str, pool: &str) {
        let mut inner = self.inner.write().await;
        if let Some(members) = inner.members.get_mut(pool) {
            members.retain(|m| m != app_id);
        }
        let now_empty = inner
            .app_pools
            .get_mut(app_id)
            .map(|pools| {
                pools.retain(|p| p != pool);
                pools.is_empty()
            })
            .unwrap_or(false);
        if now_empty {
            inner.app_pools.remove(app_id);
        }
    }

    /// Remove an app from every pool it belongs to; returns the pools it
    /// was removed from.
    pub async fn remove_app_from_all(&self, app_id: &str) -> Vec<String> {
        let mut inner = self.inner.write().await;
        let pools = inner.app_pools.remove(app_id).unwrap_or_default();
        for pool in &pools {
            if let Some(members) = inner.members.get_mut(pool) {
                members.retain(|m| m != app_id);
            }
        }
        pools
    }

    /// Member AppIDs of a pool, in insertion order.
    pub async fn members(&self, pool: &str) -> Vec<String> {
        self.inner
            .read()
            .await
            .members
            .get(pool)
            .cloned()
            .unwrap_or_default()
    }

    /// Pools an app belongs to, in insertion order.
    pub async fn pools_of_app(&self, app_id: &str) -> Vec<String> {
        self.inner
            .read()
            .await
            .app_pools
            .get(app_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Is the app a member of the pool?
    pub async fn validate_membership(&self, app_id: &str, pool: &str) -> bool {
        self.inner
            .read()
            .await
            .members
            .get(pool)
            .is_some_and(|members| members.iter().any(|m| m == app_id))
    }

    pub async fn pool_exists(&self, name: &str) -> bool {
        self.inner.read().await.pools.contains_key(name)
    }

    pub async fn get(&self, name: &str) -> Option<PoolRecord> {
        self.inner.read().await.pools.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<PoolRecord> {
        let inner = self.inner.read().await;
        let mut pools: Vec<_> = inner.pools.values().cloned().collect();
        pools.sort_by(|a, b| a.name.cmp(&b.name));
        pools
    }

    pub async fn get_property(&self, pool: &str, key: &str) -> Option<Value> {
        self.inner
            .read()
            .await
            .pools
            .get(pool)
            .and_then(|p| p.properties.get(key).cloned())
    }

    pub async fn set_property(
        &self,
        pool: &str,
        key: &str,
        value: Value,
    ) -> Result<(), CoreError> {
        let mut record = self
            .get(pool)
            .await
            .ok_or_else(|| CoreError::NotFound {
                what: "pool",
                name: pool.to_string(),
            })?;
        record.properties.insert(key.to_string(), value);
        record.updated_at = Utc::now();
        self.persistence.put_pool(&record).await?;
        self.inner
            .write()
            .await
            .pools
            .insert(pool.to_string(), record);
        Ok(())
    }

    /// Check whether `app_id` may perform `operation` in `pool`.
    ///
    /// Encrypted pools defer to the security provider; other pools apply the
    /// policy map, where `*` denotes any caller and an absent entry falls
    /// back to plain membership.
    pub async fn access_check(
        &self,
        app_id: &str,
        pool: &str,
        operation: &str,
    ) -> Result<(), CoreError> {
        let record = self.get(pool).await.ok_or_else(|| CoreError::NotFound {
            what: "pool",
            name: pool.to_string(),
        })?;

        let allowed = if record.encrypted {
            self.security
                .check_pool_access(app_id, pool, operation)
                .await?
        } else {
            match record.policies.get(operation) {
                Some(list) => list.iter().any(|entry| entry == "*" || entry == app_id),
                None => self.validate_membership(app_id, pool).await,
            }
        };

        if allowed {
            Ok(())
        } else {
            warn!(app_id, pool, operation, "pool access denied");
            Err(CoreError::AccessDenied {
                app_id: app_id.to_string(),
                resource: format!("pool '{pool}' operation '{operation}'"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryPersistence;
    use crate::security::AllowAllSecurity;

    async fn manager() -> PoolManager {
        PoolManager::load(
            Arc::new(MemoryPersistence::new()),
            Arc::new(AllowAllSecurity),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_sentinels_exist_and_cannot_be_removed() {
        let pools = manager().await;
        assert!(pools.pool_exists(DEFAULT_POOL).await);
        assert!(pools.pool_exists(SYSTEM_POOL).await);
        assert!(pools.remove(DEFAULT_POOL).await.is_err());
        assert!(pools.remove(SYSTEM_POOL).await.is_err());
    }

    #[tokio::test]
    async fn test_create_duplicate_rejected() {
        let pools = manager().await;
        pools
            .create("p1", "local", false, serde_json::Map::new())
            .await
            .unwrap();
        assert!(
            pools
                .create("p1", "local", false, serde_json::Map::new())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_encrypted_type_consistency() {
        let pools = manager().await;
        assert!(
            pools
                .create("e1", "encrypted", false, serde_json::Map::new())
                .await
                .is_err()
        );
        let record = pools
            .create("e2", "encrypted", true, serde_json::Map::new())
            .await
            .unwrap();
        assert!(record.encrypted);
    }

    #[tokio::test]
    async fn test_membership_bidirectional_and_idempotent() {
        let pools = manager().await;
        pools
            .create("p1", "local", false, serde_json::Map::new())
            .await
            .unwrap();

        pools.add_app_to_pool("a", "p1").await.unwrap();
        pools.add_app_to_pool("a", "p1").await.unwrap();

        assert_eq!(pools.members("p1").await, vec!["a".to_string()]);
        assert_eq!(pools.pools_of_app("a").await, vec!["p1".to_string()]);
        assert!(pools.validate_membership("a", "p1").await);

        // Add-then-remove leaves pool and app state as before.
        pools.remove_app_from_pool("a", "p1").await;
        assert!(pools.members("p1").await.is_empty());
        assert!(pools.pools_of_app("a").await.is_empty());
        assert!(!pools.validate_membership("a", "p1").await);
    }

    #[tokio::test]
    async fn test_remove_refuses_nonempty_pool() {
        let pools = manager().await;
        pools
            .create("p1", "local", false, serde_json::Map::new())
            .await
            .unwrap();
        pools.add_app_to_pool("a", "p1").await.unwrap();
        assert!(pools.remove("p1").await.is_err());

        pools.remove_app_from_pool("a", "p1").await;
        pools.remove("p1").await.unwrap();
        assert!(!pools.pool_exists("p1").await);
    }

    #[tokio::test]
    async fn test_access_check_policy_map() {
        let pools = manager().await;
        pools
            .create("p1", "local", false, serde_json::Map::new())
            .await
            .unwrap();
        pools.add_app_to_pool("member", "p1").await.unwrap();

        // No policy entry: membership governs.
        assert!(pools.access_check("member", "p1", "trigger").await.is_ok());
        assert!(
            pools
                .access_check("stranger", "p1", "trigger")
                .await
                .is_err()
        );

        // Explicit policy overrides membership.
        let mut policies = HashMap::new();
        policies.insert("trigger".to_string(), vec!["stranger".to_string()]);
        pools
            .update(
                "p1",
                PoolUpdate {
                    policies: Some(policies),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(
            pools
                .access_check("stranger", "p1", "trigger")
                .await
                .is_ok()
        );
        assert!(pools.access_check("member", "p1", "trigger").await.is_err());

        // Wildcard admits anyone.
        let mut policies = HashMap::new();
        policies.insert("trigger".to_string(), vec!["*".to_string()]);
        pools
            .update(
                "p1",
                PoolUpdate {
                    policies: Some(policies),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(pools.access_check("anyone", "p1", "trigger").await.is_ok());
    }

    #[tokio::test]
    async fn test_properties_round_trip() {
        let pools = manager().await;
        pools
            .create("p1", "local", false, serde_json::Map::new())
            .await
            .unwrap();
        pools
            .set_property("p1", "region", serde_json::json!("local"))
            .await
            .unwrap();
        assert_eq!(
            pools.get_property("p1", "region").await,
            Some(serde_json::json!("local"))
        );
    }

    #[tokio::test]
    async fn test_sentinel_update_restrictions() {
        let pools = manager().await;
        let err = pools
            .update(
                DEFAULT_POOL,
                PoolUpdate {
                    encrypted: Some(true),
                    ..Default::default()
                },
            )
            .await;
        assert!(err.is_err());

        // Properties remain updatable on sentinels.
        assert!(
            pools
                .update(
                    DEFAULT_POOL,
                    PoolUpdate {
                        properties: Some(serde_json::Map::new()),
                        ..Default::default()
                    },
                )
                .await
                .is_ok()
        );
    }
}
