//! In-memory persistence backend.
//!
//! Implements the full [`Persistence`] contract over process-local maps.
//! Used when the server runs in `memory_mode` and throughout the unit test
//! suite. Nothing survives a restart, and snapshot backups are unsupported.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::CoreError;

use super::{
    AppRecord, BlockRecord, Persistence, PoolRecord, StoreBatch, StoreOp, TriggerRecordRow,
};

#[derive(Default)]
struct Tables {
    apps: HashMap<String, AppRecord>,
    pools: HashMap<String, PoolRecord>,
    blocks: HashMap<String, BlockRecord>,
    server_config: HashMap<String, String>,
    inflight: HashMap<String, TriggerRecordRow>,
}

/// Ephemeral persistence provider.
#[derive(Default)]
pub struct MemoryPersistence {
    tables: Mutex<Tables>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_tables<T>(&self, f: impl FnOnce(&mut Tables) -> T) -> Result<T, CoreError> {
        let mut tables = self
            .tables
            .lock()
            .map_err(|_| CoreError::storage("memory", "table lock poisoned"))?;
        Ok(f(&mut tables))
    }
}

fn touch_pool(mut pool: PoolRecord) -> PoolRecord {
    pool.updated_at = chrono::Utc::now();
    pool
}

fn touch_block(mut block: BlockRecord) -> BlockRecord {
    block.updated_at = chrono::Utc::now();
    block
}

#[async_trait::async_trait]
impl Persistence for MemoryPersistence {
    async fn put_app(&self, app: &AppRecord) -> Result<(), CoreError> {
        self.with_tables(|t| {
            t.apps.insert(app.app_id.clone(), app.clone());
        })
    }

    async fn get_app(&self, app_id: &str) -> Result<Option<AppRecord>, CoreError> {
        self.with_tables(|t| t.apps.get(app_id).cloned())
    }

    async fn delete_app(&self, app_id: &str) -> Result<(), CoreError> {
        self.with_tables(|t| {
            t.apps.remove(app_id);
        })
    }

    async fn list_apps(&self) -> Result<Vec<AppRecord>, CoreError> {
        self.with_tables(|t| {
            let mut apps: Vec<_> = t.apps.values().cloned().collect();
            apps.sort_by(|a, b| a.app_id.cmp(&b.app_id));
            apps
        })
    }

    async fn put_pool(&self, pool: &PoolRecord) -> Result<(), CoreError> {
        self.with_tables(|t| {
            t.pools
                .insert(pool.name.clone(), touch_pool(pool.clone()));
        })
    }

    async fn get_pool(&self, name: &str) -> Result<Option<PoolRecord>, CoreError> {
        self.with_tables(|t| t.pools.get(name).cloned())
    }

    async fn delete_pool(&self, name: &str) -> Result<(), CoreError> {
        self.with_tables(|t| {
            t.pools.remove(name);
        })
    }

    async fn list_pools(&self) -> Result<Vec<PoolRecord>, CoreError> {
        self.with_tables(|t| {
            let mut pools: Vec<_> = t.pools.values().cloned().collect();
            pools.sort_by(|a, b| a.name.cmp(&b.name));
            pools
        })
    }

    async fn put_block(&self, block: &BlockRecord) -> Result<(), CoreError> {
        self.with_tables(|t| {
            t.blocks
                .insert(block.block_id.clone(), touch_block(block.clone()));
        })
    }

    async fn get_block(&self, block_id: &str) -> Result<Option<BlockRecord>, CoreError> {
        self.with_tables(|t| t.blocks.get(block_id).cloned())
    }

    async fn delete_block(&self, block_id: &str) -> Result<(), CoreError> {
        self.with_tables(|t| {
            t.blocks.remove(block_id);
        })
    }

    async fn list_blocks(&self) -> Result<Vec<BlockRecord>, CoreError> {
        self.with_tables(|t| {
            let mut blocks: Vec<_> = t.blocks.values().cloned().collect();
            blocks.sort_by(|a, b| a.block_id.cmp(&b.block_id));
            blocks
        })
    }

    async fn list_blocks_in_pool(&self, pool: &str) -> Result<Vec<BlockRecord>, CoreError> {
        self.with_tables(|t| {
            let mut blocks: Vec<_> = t
                .blocks
                .values()
                .filter(|b| b.pool == pool)
                .cloned()
                .collect();
            blocks.sort_by(|a, b| a.block_id.cmp(&b.block_id));
            blocks
        })
    }

    async fn list_blocks_by_type(&self, block_type: &str) -> Result<Vec<BlockRecord>, CoreError> {
        self.with_tables(|t| {
            let mut blocks: Vec<_> = t
                .blocks
                .values()
                .filter(|b| b.block_type == block_type)
                .cloned()
                .collect();
            blocks.sort_by(|a, b| a.block_id.cmp(&b.block_id));
            blocks
        })
    }

    async fn get_server_config(&self, key: &str) -> Result<Option<String>, CoreError> {
        self.with_tables(|t| t.server_config.get(key).cloned())
    }

    async fn set_server_config(&self, key: &str, value: &str) -> Result<(), CoreError> {
        self.with_tables(|t| {
            t.server_config.insert(key.to_string(), value.to_string());
        })
    }

    async fn apply(&self, batch: StoreBatch) -> Result<(), CoreError> {
        // Single-mutex backend: applying under the lock is atomic by
        // construction.
        self.with_tables(|t| {
            for op in batch.ops {
                match op {
                    StoreOp::PutApp(app) => {
                        t.apps.insert(app.app_id.clone(), app);
                    }
                    StoreOp::DeleteApp(app_id) => {
                        t.apps.remove(&app_id);
                    }
                    StoreOp::PutPool(pool) => {
                        t.pools.insert(pool.name.clone(), touch_pool(pool));
                    }
                    StoreOp::DeletePool(name) => {
                        t.pools.remove(&name);
                    }
                    StoreOp::PutBlock(block) => {
                        t.blocks.insert(block.block_id.clone(), touch_block(block));
                    }
                    StoreOp::DeleteBlock(block_id) => {
                        t.blocks.remove(&block_id);
                    }
                    StoreOp::SetServerConfig(key, value) => {
                        t.server_config.insert(key, value);
                    }
                }
            }
        })
    }

    async fn backup(&self) -> Result<PathBuf, CoreError> {
        Err(CoreError::storage(
            "backup",
            "snapshots are unavailable in memory mode",
        ))
    }

    async fn put_trigger_record(&self, record: &TriggerRecordRow) -> Result<(), CoreError> {
        self.with_tables(|t| {
            t.inflight.insert(record.id.clone(), record.clone());
        })
    }

    async fn delete_trigger_record(&self, id: &str) -> Result<(), CoreError> {
        self.with_tables(|t| {
            t.inflight.remove(id);
        })
    }

    async fn list_trigger_records(&self) -> Result<Vec<TriggerRecordRow>, CoreError> {
        self.with_tables(|t| t.inflight.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_pool(name: &str) -> PoolRecord {
        PoolRecord {
            name: name.to_string(),
            pool_type: "local".to_string(),
            encrypted: false,
            owners: vec![],
            policies: HashMap::new(),
            properties: serde_json::Map::new(),
            max_memory_blocks: None,
            max_triggers: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_pool_crud() {
        let store = MemoryPersistence::new();
        store.put_pool(&sample_pool("p1")).await.unwrap();
        assert!(store.get_pool("p1").await.unwrap().is_some());
        assert!(store.get_pool("p2").await.unwrap().is_none());

        store.delete_pool("p1").await.unwrap();
        assert!(store.get_pool("p1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_apply_batch() {
        let store = MemoryPersistence::new();
        let batch = StoreBatch::new()
            .push(StoreOp::PutPool(sample_pool("a")))
            .push(StoreOp::PutPool(sample_pool("b")))
            .push(StoreOp::SetServerConfig("schema".into(), "1".into()));
        store.apply(batch).await.unwrap();

        assert_eq!(store.list_pools().await.unwrap().len(), 2);
        assert_eq!(
            store.get_server_config("schema").await.unwrap().as_deref(),
            Some("1")
        );
    }

    #[tokio::test]
    async fn test_backup_unsupported() {
        let store = MemoryPersistence::new();
        assert!(store.backup().await.is_err());
    }

    #[tokio::test]
    async fn test_trigger_mirror() {
        let store = MemoryPersistence::new();
        let row = TriggerRecordRow {
            id: "t1".into(),
            origin: "a".into(),
            destination: Some("b".into()),
            pool: "default".into(),
            trigger: "echo".into(),
            created_at: Utc::now(),
            ttl_ms: 30_000,
            dispatched_to: Some("b".into()),
            state: "dispatched".into(),
        };
        store.put_trigger_record(&row).await.unwrap();
        assert_eq!(store.list_trigger_records().await.unwrap().len(), 1);
        store.delete_trigger_record("t1").await.unwrap();
        assert!(store.list_trigger_records().await.unwrap().is_empty());
    }
}
