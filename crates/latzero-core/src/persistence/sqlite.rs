//! SQLite-backed persistence implementation.
//!
//! The durable store runs in WAL journal mode; snapshots are produced with
//! `VACUUM INTO` so a backup is always a consistent image. The in-flight
//! trigger mirror is an in-process table even here: those rows are
//! ephemeral by contract and must not be replayed after a restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use crate::error::CoreError;

use super::{
    AppRecord, BlockRecord, Persistence, PoolRecord, StoreBatch, StoreOp, TriggerRecordRow,
};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite-backed persistence provider.
pub struct SqlitePersistence {
    pool: SqlitePool,
    backups_dir: PathBuf,
    max_backups: usize,
    inflight: Mutex<HashMap<String, TriggerRecordRow>>,
}

#[derive(sqlx::FromRow)]
struct AppRow {
    app_id: String,
    pools: String,
    triggers: String,
    metadata: String,
    protocol_version: Option<String>,
    registered_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
}

impl AppRow {
    fn into_record(self) -> Result<AppRecord, CoreError> {
        Ok(AppRecord {
            app_id: self.app_id,
            pools: serde_json::from_str(&self.pools)?,
            triggers: serde_json::from_str(&self.triggers)?,
            metadata: serde_json::from_str(&self.metadata)?,
            protocol_version: self.protocol_version,
            registered_at: self.registered_at,
            last_seen_at: self.last_seen_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PoolRow {
    name: String,
    pool_type: String,
    encrypted: bool,
    owners: String,
    policies: String,
    properties: String,
    max_memory_blocks: Option<i64>,
    max_triggers: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl PoolRow {
    fn into_record(self) -> Result<PoolRecord, CoreError> {
        Ok(PoolRecord {
            name: self.name,
            pool_type: self.pool_type,
            encrypted: self.encrypted,
            owners: serde_json::from_str(&self.owners)?,
            policies: serde_json::from_str(&self.policies)?,
            properties: serde_json::from_str(&self.properties)?,
            max_memory_blocks: self.max_memory_blocks.map(|v| v as u32),
            max_triggers: self.max_triggers.map(|v| v as u32),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct BlockRow {
    block_id: String,
    name: String,
    pool: String,
    size: i64,
    block_type: String,
    permissions: String,
    version: i64,
    persistent: bool,
    encrypted: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl BlockRow {
    fn into_record(self) -> Result<BlockRecord, CoreError> {
        Ok(BlockRecord {
            block_id: self.block_id,
            name: self.name,
            pool: self.pool,
            size: self.size as u64,
            block_type: self.block_type,
            permissions: serde_json::from_str(&self.permissions)?,
            version: self.version as u64,
            persistent: self.persistent,
            encrypted: self.encrypted,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl SqlitePersistence {
    /// Create and initialize the durable store at `store_path`.
    ///
    /// Creates parent directories, opens the database in WAL mode (creating
    /// the file if absent), and runs migrations.
    pub async fn from_path(
        store_path: impl AsRef<Path>,
        backups_dir: impl Into<PathBuf>,
        max_backups: usize,
    ) -> Result<Self, CoreError> {
        let store_path = store_path.as_ref().to_path_buf();

        if let Some(parent) = store_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                CoreError::storage(
                    "create_dir",
                    format!("failed to create directory {:?}: {}", parent, e),
                )
            })?;
        }

        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite:{}",
            store_path.to_string_lossy()
        ))
        .map_err(|e| CoreError::storage("connect", e.to_string()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| {
                CoreError::storage(
                    "connect",
                    format!("failed to open store at {:?}: {}", store_path, e),
                )
            })?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| CoreError::storage("migrate", e.to_string()))?;

        Ok(Self {
            pool,
            backups_dir: backups_dir.into(),
            max_backups,
            inflight: Mutex::new(HashMap::new()),
        })
    }

    fn prune_backups(&self) -> Result<(), CoreError> {
        let mut snapshots: Vec<PathBuf> = std::fs::read_dir(&self.backups_dir)
            .map_err(|e| CoreError::storage("backup", e.to_string()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("latzero-") && n.ends_with(".db"))
            })
            .collect();
        // Timestamped names sort chronologically.
        snapshots.sort();
        while snapshots.len() > self.max_backups {
            let oldest = snapshots.remove(0);
            std::fs::remove_file(&oldest)
                .map_err(|e| CoreError::storage("backup", e.to_string()))?;
        }
        Ok(())
    }
}

async fn upsert_app<'e, E>(exec: E, app: &AppRecord) -> Result<(), CoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO apps (app_id, pools, triggers, metadata, protocol_version,
                          registered_at, last_seen_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (app_id) DO UPDATE SET
            pools = excluded.pools,
            triggers = excluded.triggers,
            metadata = excluded.metadata,
            protocol_version = excluded.protocol_version,
            last_seen_at = excluded.last_seen_at
        "#,
    )
    .bind(&app.app_id)
    .bind(serde_json::to_string(&app.pools)?)
    .bind(serde_json::to_string(&app.triggers)?)
    .bind(serde_json::to_string(&app.metadata)?)
    .bind(&app.protocol_version)
    .bind(app.registered_at)
    .bind(app.last_seen_at)
    .execute(exec)
    .await?;
    Ok(())
}

async fn upsert_pool<'e, E>(exec: E, pool: &PoolRecord) -> Result<(), CoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO pools (name, pool_type, encrypted, owners, policies, properties,
                           max_memory_blocks, max_triggers, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (name) DO UPDATE SET
            pool_type = excluded.pool_type,
            encrypted = excluded.encrypted,
            owners = excluded.owners,
            policies = excluded.policies,
            properties = excluded.properties,
            max_memory_blocks = excluded.max_memory_blocks,
            max_triggers = excluded.max_triggers,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&pool.name)
    .bind(&pool.pool_type)
    .bind(pool.encrypted)
    .bind(serde_json::to_string(&pool.owners)?)
    .bind(serde_json::to_string(&pool.policies)?)
    .bind(serde_json::to_string(&pool.properties)?)
    .bind(pool.max_memory_blocks.map(|v| v as i64))
    .bind(pool.max_triggers.map(|v| v as i64))
    .bind(pool.created_at)
    .bind(Utc::now())
    .execute(exec)
    .await?;
    Ok(())
}

async fn upsert_block<'e, E>(exec: E, block: &BlockRecord) -> Result<(), CoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO memory_blocks (block_id, name, pool, size, block_type, permissions,
                                   version, persistent, encrypted, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (block_id) DO UPDATE SET
            name = excluded.name,
            pool = excluded.pool,
            size = excluded.size,
            block_type = excluded.block_type,
            permissions = excluded.permissions,
            version = excluded.version,
            persistent = excluded.persistent,
            encrypted = excluded.encrypted,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&block.block_id)
    .bind(&block.name)
    .bind(&block.pool)
    .bind(block.size as i64)
    .bind(&block.block_type)
    .bind(serde_json::to_string(&block.permissions)?)
    .bind(block.version as i64)
    .bind(block.persistent)
    .bind(block.encrypted)
    .bind(block.created_at)
    .bind(Utc::now())
    .execute(exec)
    .await?;
    Ok(())
}

async fn upsert_server_config<'e, E>(exec: E, key: &str, value: &str) -> Result<(), CoreError>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO server_config (key, value, updated_at)
        VALUES (?, ?, ?)
        ON CONFLICT (key) DO UPDATE SET
            value = excluded.value,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(key)
    .bind(value)
    .bind(Utc::now())
    .execute(exec)
    .await?;
    Ok(())
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn put_app(&self, app: &AppRecord) -> Result<(), CoreError> {
        upsert_app(&self.pool, app).await
    }

    async fn get_app(&self, app_id: &str) -> Result<Option<AppRecord>, CoreError> {
        let row = sqlx::query_as::<_, AppRow>(
            r#"
            SELECT app_id, pools, triggers, metadata, protocol_version,
                   registered_at, last_seen_at
            FROM apps
            WHERE app_id = ?
            "#,
        )
        .bind(app_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(AppRow::into_record).transpose()
    }

    async fn delete_app(&self, app_id: &str) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM apps WHERE app_id = ?")
            .bind(app_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_apps(&self) -> Result<Vec<AppRecord>, CoreError> {
        let rows = sqlx::query_as::<_, AppRow>(
            r#"
            SELECT app_id, pools, triggers, metadata, protocol_version,
                   registered_at, last_seen_at
            FROM apps
            ORDER BY app_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AppRow::into_record).collect()
    }

    async fn put_pool(&self, pool: &PoolRecord) -> Result<(), CoreError> {
        upsert_pool(&self.pool, pool).await
    }

    async fn get_pool(&self, name: &str) -> Result<Option<PoolRecord>, CoreError> {
        let row = sqlx::query_as::<_, PoolRow>(
            r#"
            SELECT name, pool_type, encrypted, owners, policies, properties,
                   max_memory_blocks, max_triggers, created_at, updated_at
            FROM pools
            WHERE name = ?
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PoolRow::into_record).transpose()
    }

    async fn delete_pool(&self, name: &str) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM pools WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_pools(&self) -> Result<Vec<PoolRecord>, CoreError> {
        let rows = sqlx::query_as::<_, PoolRow>(
            r#"
            SELECT name, pool_type, encrypted, owners, policies, properties,
                   max_memory_blocks, max_triggers, created_at, updated_at
            FROM pools
            ORDER BY name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PoolRow::into_record).collect()
    }

    async fn put_block(&self, block: &BlockRecord) -> Result<(), CoreError> {
        upsert_block(&self.pool, block).await
    }

    async fn get_block(&self, block_id: &str) -> Result<Option<BlockRecord>, CoreError> {
        let row = sqlx::query_as::<_, BlockRow>(
            r#"
            SELECT block_id, name, pool, size, block_type, permissions,
                   version, persistent, encrypted, created_at, updated_at
            FROM memory_blocks
            WHERE block_id = ?
            "#,
        )
        .bind(block_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(BlockRow::into_record).transpose()
    }

    async fn delete_block(&self, block_id: &str) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM memory_blocks WHERE block_id = ?")
            .bind(block_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_blocks(&self) -> Result<Vec<BlockRecord>, CoreError> {
        let rows = sqlx::query_as::<_, BlockRow>(
            r#"
            SELECT block_id, name, pool, size, block_type, permissions,
                   version, persistent, encrypted, created_at, updated_at
            FROM memory_blocks
            ORDER BY block_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BlockRow::into_record).collect()
    }

    async fn list_blocks_in_pool(&self, pool: &str) -> Result<Vec<BlockRecord>, CoreError> {
        let rows = sqlx::query_as::<_, BlockRow>(
            r#"
            SELECT block_id, name, pool, size, block_type, permissions,
                   version, persistent, encrypted, created_at, updated_at
            FROM memory_blocks
            WHERE pool = ?
            ORDER BY block_id
            "#,
        )
        .bind(pool)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BlockRow::into_record).collect()
    }

    async fn list_blocks_by_type(&self, block_type: &str) -> Result<Vec<BlockRecord>, CoreError> {
        let rows = sqlx::query_as::<_, BlockRow>(
            r#"
            SELECT block_id, name, pool, size, block_type, permissions,
                   version, persistent, encrypted, created_at, updated_at
            FROM memory_blocks
            WHERE block_type = ?
            ORDER BY block_id
            "#,
        )
        .bind(block_type)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BlockRow::into_record).collect()
    }

    async fn get_server_config(&self, key: &str) -> Result<Option<String>, CoreError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM server_config WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|r| r.0))
    }

    async fn set_server_config(&self, key: &str, value: &str) -> Result<(), CoreError> {
        upsert_server_config(&self.pool, key, value).await
    }

    async fn apply(&self, batch: StoreBatch) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;
        for op in &batch.ops {
            match op {
                StoreOp::PutApp(app) => upsert_app(&mut *tx, app).await?,
                StoreOp::DeleteApp(app_id) => {
                    sqlx::query("DELETE FROM apps WHERE app_id = ?")
                        .bind(app_id)
                        .execute(&mut *tx)
                        .await?;
                }
                StoreOp::PutPool(pool) => upsert_pool(&mut *tx, pool).await?,
                StoreOp::DeletePool(name) => {
                    sqlx::query("DELETE FROM pools WHERE name = ?")
                        .bind(name)
                        .execute(&mut *tx)
                        .await?;
                }
                StoreOp::PutBlock(block) => upsert_block(&mut *tx, block).await?,
                StoreOp::DeleteBlock(block_id) => {
                    sqlx::query("DELETE FROM memory_blocks WHERE block_id = ?")
                        .bind(block_id)
                        .execute(&mut *tx)
                        .await?;
                }
                StoreOp::SetServerConfig(key, value) => {
                    upsert_server_config(&mut *tx, key, value).await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn backup(&self) -> Result<PathBuf, CoreError> {
        std::fs::create_dir_all(&self.backups_dir)
            .map_err(|e| CoreError::storage("backup", e.to_string()))?;

        let stamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
        let target = self.backups_dir.join(format!("latzero-{stamp}.db"));

        // VACUUM INTO produces a consistent snapshot without blocking
        // writers in WAL mode.
        sqlx::query(&format!(
            "VACUUM INTO '{}'",
            target.to_string_lossy().replace('\'', "''")
        ))
        .execute(&self.pool)
        .await?;

        self.prune_backups()?;

        tracing::info!(snapshot = %target.display(), "durable store snapshot written");
        Ok(target)
    }

    async fn put_trigger_record(&self, record: &TriggerRecordRow) -> Result<(), CoreError> {
        let mut inflight = self
            .inflight
            .lock()
            .map_err(|_| CoreError::storage("inflight", "mirror lock poisoned"))?;
        inflight.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn delete_trigger_record(&self, id: &str) -> Result<(), CoreError> {
        let mut inflight = self
            .inflight
            .lock()
            .map_err(|_| CoreError::storage("inflight", "mirror lock poisoned"))?;
        inflight.remove(id);
        Ok(())
    }

    async fn list_trigger_records(&self) -> Result<Vec<TriggerRecordRow>, CoreError> {
        let inflight = self
            .inflight
            .lock()
            .map_err(|_| CoreError::storage("inflight", "mirror lock poisoned"))?;
        Ok(inflight.values().cloned().collect())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
