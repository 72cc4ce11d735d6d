//! Persistence interfaces and backends for latzero-core.
//!
//! Two logical stores back the server: a durable store for apps, pools,
//! memory-block metadata, and server config, and an ephemeral mirror for
//! in-flight trigger records. The durable store survives restarts; the
//! trigger mirror is never replayed. `memory_mode` collapses both to
//! ephemeral via [`MemoryPersistence`].
//!
//! List- and map-valued fields are serialized as JSON text columns; the
//! service layer, not the store, enforces cross-entity constraints.

pub mod memory;
pub mod sqlite;

pub use self::memory::MemoryPersistence;
pub use self::sqlite::SqlitePersistence;

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::CoreError;

/// Durable application registration row.
#[derive(Debug, Clone, PartialEq)]
pub struct AppRecord {
    /// Stable textual identifier supplied at handshake.
    pub app_id: String,
    /// Pools the app belongs to.
    pub pools: Vec<String>,
    /// Triggers the app advertises.
    pub triggers: Vec<String>,
    /// Opaque key/value metadata supplied at handshake.
    pub metadata: serde_json::Map<String, Value>,
    /// Protocol version string from the last handshake.
    pub protocol_version: Option<String>,
    /// When the app first registered.
    pub registered_at: DateTime<Utc>,
    /// Last handshake or disconnect time; drives rehydration expiry.
    pub last_seen_at: DateTime<Utc>,
}

/// Durable pool row.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolRecord {
    pub name: String,
    /// One of `local`, `global`, `encrypted`.
    pub pool_type: String,
    pub encrypted: bool,
    pub owners: Vec<String>,
    /// Permission name to AppID list; `*` denotes any.
    pub policies: HashMap<String, Vec<String>>,
    pub properties: serde_json::Map<String, Value>,
    pub max_memory_blocks: Option<u32>,
    pub max_triggers: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable memory-block metadata row. Attachment state is runtime-only.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockRecord {
    pub block_id: String,
    pub name: String,
    pub pool: String,
    pub size: u64,
    pub block_type: String,
    /// Operation name to AppID list; `*` denotes any.
    pub permissions: HashMap<String, Vec<String>>,
    /// Strictly monotonic; incremented on every successful write.
    pub version: u64,
    pub persistent: bool,
    pub encrypted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Ephemeral in-flight trigger mirror row, kept for introspection and
/// post-mortem debugging only.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerRecordRow {
    pub id: String,
    pub origin: String,
    pub destination: Option<String>,
    pub pool: String,
    pub trigger: String,
    pub created_at: DateTime<Utc>,
    pub ttl_ms: u64,
    pub dispatched_to: Option<String>,
    pub state: String,
}

/// One mutation inside an atomic batch.
#[derive(Debug, Clone)]
pub enum StoreOp {
    PutApp(AppRecord),
    DeleteApp(String),
    PutPool(PoolRecord),
    DeletePool(String),
    PutBlock(BlockRecord),
    DeleteBlock(String),
    SetServerConfig(String, String),
}

/// A batch of mutations applied atomically: either every operation commits
/// or none does.
#[derive(Debug, Clone, Default)]
pub struct StoreBatch {
    pub ops: Vec<StoreOp>,
}

impl StoreBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, op: StoreOp) -> Self {
        self.ops.push(op);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Persistence interface used by the registries and managers.
///
/// Failure contract: a mutation that cannot be persisted surfaces as an
/// error and the caller must not update its in-memory mirror. Single-row
/// reads return `Ok(None)` only when the row genuinely does not exist; I/O
/// failures surface as errors.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn put_app(&self, app: &AppRecord) -> Result<(), CoreError>;
    async fn get_app(&self, app_id: &str) -> Result<Option<AppRecord>, CoreError>;
    async fn delete_app(&self, app_id: &str) -> Result<(), CoreError>;
    async fn list_apps(&self) -> Result<Vec<AppRecord>, CoreError>;

    async fn put_pool(&self, pool: &PoolRecord) -> Result<(), CoreError>;
    async fn get_pool(&self, name: &str) -> Result<Option<PoolRecord>, CoreError>;
    async fn delete_pool(&self, name: &str) -> Result<(), CoreError>;
    async fn list_pools(&self) -> Result<Vec<PoolRecord>, CoreError>;

    async fn put_block(&self, block: &BlockRecord) -> Result<(), CoreError>;
    async fn get_block(&self, block_id: &str) -> Result<Option<BlockRecord>, CoreError>;
    async fn delete_block(&self, block_id: &str) -> Result<(), CoreError>;
    async fn list_blocks(&self) -> Result<Vec<BlockRecord>, CoreError>;
    async fn list_blocks_in_pool(&self, pool: &str) -> Result<Vec<BlockRecord>, CoreError>;
    async fn list_blocks_by_type(&self, block_type: &str) -> Result<Vec<BlockRecord>, CoreError>;

    async fn get_server_config(&self, key: &str) -> Result<Option<String>, CoreError>;
    async fn set_server_config(&self, key: &str, value: &str) -> Result<(), CoreError>;

    /// Apply a batch of mutations atomically, rolling back on any failure.
    async fn apply(&self, batch: StoreBatch) -> Result<(), CoreError>;

    /// Produce a time-stamped snapshot of the durable store and prune the
    /// oldest snapshots beyond the retention bound. Returns the snapshot
    /// path.
    async fn backup(&self) -> Result<PathBuf, CoreError>;

    async fn put_trigger_record(&self, record: &TriggerRecordRow) -> Result<(), CoreError>;
    async fn delete_trigger_record(&self, id: &str) -> Result<(), CoreError>;
    async fn list_trigger_records(&self) -> Result<Vec<TriggerRecordRow>, CoreError>;

    /// Flush and close the store. Called once during graceful shutdown.
    async fn close(&self) {}
}
