// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Named shared-memory blocks.
//!
//! Blocks carry metadata (pool, size, type, permissions, version) persisted
//! in the durable store and a byte buffer owned by the manager. Persistent
//! blocks are written through to a backing file under the memory directory
//! and reloaded at startup; everything else lives and dies with the
//! process.
//!
//! Locks are advisory: acquisition fails on conflict, holders are not
//! enforced against plain reads/writes, and every lock expires at its
//! timeout.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use latzero_protocol::LockMode;

use crate::error::CoreError;
use crate::persistence::{BlockRecord, Persistence};
use crate::pools::{DEFAULT_POOL, PoolManager};
use crate::security::SecurityProvider;

/// Default advisory-lock timeout when the caller supplies none.
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 30_000;

/// Observer fired after every successful write. The runtime installs one
/// that notifies attached applications.
pub trait BlockObserver: Send + Sync {
    fn block_written(&self, block_id: &str, pool: &str, version: u64, writer: &str,
        attachments: &[String]);
}

/// Parameters for block creation.
#[derive(Debug, Clone)]
pub struct CreateBlock {
    pub block_id: String,
    pub name: Option<String>,
    pub pool: Option<String>,
    pub size: u64,
    pub block_type: Option<String>,
    pub persistent: bool,
    pub encrypted: bool,
    pub permissions: HashMap<String, Vec<String>>,
}

/// An advisory lock held on a block.
#[derive(Debug, Clone)]
pub struct AdvisoryLock {
    pub lock_id: String,
    pub app_id: String,
    pub mode: LockMode,
    expires_at: Instant,
}

impl AdvisoryLock {
    fn expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Two lock modes conflict when they cannot be held concurrently:
/// exclusive conflicts with everything, writers conflict with writers,
/// and readers share with anything short of exclusive.
fn conflicts(held: LockMode, requested: LockMode) -> bool {
    match (held, requested) {
        (LockMode::Exclusive, _) | (_, LockMode::Exclusive) => true,
        (LockMode::Write, LockMode::Write) => true,
        _ => false,
    }
}

struct BlockEntry {
    record: BlockRecord,
    data: Vec<u8>,
    attachments: Vec<String>,
    locks: Vec<AdvisoryLock>,
    last_accessed_at: Instant,
}

impl BlockEntry {
    fn touch(&mut self) {
        self.last_accessed_at = Instant::now();
    }

    /// Permission check against the block's map. An absent entry admits any
    /// caller that already passed the pool check.
    fn permits(&self, app_id: &str, operation: &str) -> bool {
        match self.record.permissions.get(operation) {
            Some(list) => list.iter().any(|entry| entry == "*" || entry == app_id),
            None => true,
        }
    }
}

/// Snapshot of a block for introspection.
#[derive(Debug, Clone)]
pub struct BlockInfo {
    pub record: BlockRecord,
    pub attachments: Vec<String>,
    pub lock_count: usize,
}

/// Owns block metadata, bytes, attachments, and advisory locks.
pub struct MemoryManager {
    blocks: RwLock<HashMap<String, BlockEntry>>,
    persistence: Arc<dyn Persistence>,
    pools: Arc<PoolManager>,
    security: Arc<dyn SecurityProvider>,
    backing_dir: PathBuf,
    observers: RwLock<Vec<Arc<dyn BlockObserver>>>,
}

impl MemoryManager {
    /// Reload persistent blocks from the durable store and their backing
    /// files. Metadata of non-persistent blocks from a previous run is
    /// discarded: their contents did not survive.
    pub async fn load(
        persistence: Arc<dyn Persistence>,
        pools: Arc<PoolManager>,
        security: Arc<dyn SecurityProvider>,
        backing_dir: PathBuf,
    ) -> Result<Self, CoreError> {
        std::fs::create_dir_all(&backing_dir).map_err(|e| {
            CoreError::storage(
                "create_dir",
                format!("failed to create memory dir {:?}: {}", backing_dir, e),
            )
        })?;

        let mut blocks = HashMap::new();
        for record in persistence.list_blocks().await? {
            if !record.persistent {
                persistence.delete_block(&record.block_id).await?;
                continue;
            }
            let path = backing_dir.join(format!("{}.blk", record.block_id));
            let mut data = vec![0u8; record.size as usize];
            match std::fs::File::open(&path) {
                Ok(mut file) => {
                    if let Err(e) = file.read_exact(&mut data) {
                        warn!(block_id = record.block_id, error = %e,
                            "backing file short read, block zero-filled");
                    }
                }
                Err(e) => {
                    warn!(block_id = record.block_id, error = %e,
                        "backing file missing, block zero-filled");
                }
            }
            blocks.insert(
                record.block_id.clone(),
                BlockEntry {
                    record,
                    data,
                    attachments: Vec::new(),
                    locks: Vec::new(),
                    last_accessed_at: Instant::now(),
                },
            );
        }

        debug!(count = blocks.len(), "persistent blocks reloaded");
        Ok(Self {
            blocks: RwLock::new(blocks),
            persistence,
            pools,
            security,
            backing_dir,
            observers: RwLock::new(Vec::new()),
        })
    }

    /// Register a write observer.
    pub async fn add_observer(&self, observer: Arc<dyn BlockObserver>) {
        self.observers.write().await.push(observer);
    }

    fn backing_path(&self, block_id: &str) -> PathBuf {
        self.backing_dir.join(format!("{block_id}.blk"))
    }

    fn write_backing(&self, block_id: &str, offset: u64, data: &[u8]) -> Result<(), CoreError> {
        let path = self.backing_path(block_id);
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| CoreError::storage("backing_write", e.to_string()))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| CoreError::storage("backing_write", e.to_string()))?;
        file.write_all(data)
            .map_err(|e| CoreError::storage("backing_write", e.to_string()))?;
        Ok(())
    }

    async fn notify_written(&self, block_id: &str, pool: &str, version: u64, writer: &str,
        attachments: &[String]) {
        let observers = self.observers.read().await;
        for observer in observers.iter() {
            observer.block_written(block_id, pool, version, writer, attachments);
        }
    }

    /// Create a block. Backing storage is allocated before the metadata is
    /// recorded; a backing failure leaves no metadata behind.
    #[instrument(skip(self, params), fields(block_id = %params.block_id, app_id))]
    pub async fn create(&self, app_id: &str, params: CreateBlock) -> Result<BlockRecord, CoreError> {
        let pool_name = params.pool.unwrap_or_else(|| DEFAULT_POOL.to_string());
        let pool = self
            .pools
            .get(&pool_name)
            .await
            .ok_or_else(|| CoreError::NotFound {
                what: "pool",
                name: pool_name.clone(),
            })?;
        self.pools.access_check(app_id, &pool_name, "memory").await?;

        if params.encrypted && !pool.encrypted {
            return Err(CoreError::validation(
                "encrypted",
                "encrypted blocks require an encrypted pool",
            ));
        }

        {
            let blocks = self.blocks.read().await;
            if blocks.contains_key(&params.block_id) {
                return Err(CoreError::validation("block_id", "block already exists"));
            }
            if let Some(limit) = pool.max_memory_blocks {
                let in_pool = blocks
                    .values()
                    .filter(|b| b.record.pool == pool_name)
                    .count();
                if in_pool as u32 >= limit {
                    return Err(CoreError::validation(
                        "pool",
                        "pool memory-block limit reached",
                    ));
                }
            }
        }

        if params.persistent {
            // Pre-size the backing file; failure here must precede the
            // metadata write.
            let path = self.backing_path(&params.block_id);
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&path)
                .map_err(|e| CoreError::storage("backing_create", e.to_string()))?;
            file.set_len(params.size)
                .map_err(|e| CoreError::storage("backing_create", e.to_string()))?;
        }

        let now = Utc::now();
        let record = BlockRecord {
            block_id: params.block_id.clone(),
            name: params.name.unwrap_or_default(),
            pool: pool_name,
            size: params.size,
            block_type: params.block_type.unwrap_or_else(|| "shared".to_string()),
            permissions: params.permissions,
            version: 0,
            persistent: params.persistent,
            encrypted: params.encrypted,
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = self.persistence.put_block(&record).await {
            if params.persistent {
                let _ = std::fs::remove_file(self.backing_path(&params.block_id));
            }
            return Err(e);
        }

        let mut blocks = self.blocks.write().await;
        blocks.insert(
            params.block_id.clone(),
            BlockEntry {
                record: record.clone(),
                data: vec![0u8; params.size as usize],
                attachments: Vec::new(),
                locks: Vec::new(),
                last_accessed_at: Instant::now(),
            },
        );
        info!(block_id = record.block_id, size = record.size, "block created");
        Ok(record)
    }

    /// Attach an app to a block in read or write mode. Idempotent.
    pub async fn attach(
        &self,
        app_id: &str,
        block_id: &str,
        mode: LockMode,
    ) -> Result<u64, CoreError> {
        let operation = match mode {
            LockMode::Read => "read",
            _ => "write",
        };
        let mut blocks = self.blocks.write().await;
        let entry = blocks.get_mut(block_id).ok_or_else(|| CoreError::NotFound {
            what: "block",
            name: block_id.to_string(),
        })?;
        self.pools
            .access_check(app_id, &entry.record.pool, "memory")
            .await?;
        if !entry.permits(app_id, operation) {
            return Err(CoreError::AccessDenied {
                app_id: app_id.to_string(),
                resource: format!("block '{block_id}' {operation}"),
            });
        }
        if !entry.attachments.iter().any(|a| a == app_id) {
            entry.attachments.push(app_id.to_string());
        }
        entry.touch();
        Ok(entry.record.version)
    }

    /// Detach an app from a block. Idempotent.
    pub async fn detach(&self, app_id: &str, block_id: &str) -> Result<(), CoreError> {
        let mut blocks = self.blocks.write().await;
        if let Some(entry) = blocks.get_mut(block_id) {
            entry.attachments.retain(|a| a != app_id);
            entry.touch();
        }
        Ok(())
    }

    /// Detach an app everywhere and let its advisory locks lapse. Called on
    /// disconnect.
    pub async fn detach_app_from_all(&self, app_id: &str) {
        let mut blocks = self.blocks.write().await;
        for entry in blocks.values_mut() {
            entry.attachments.retain(|a| a != app_id);
            entry.locks.retain(|l| l.app_id != app_id);
        }
    }

    /// Read `[offset, offset+length)`; `length` defaults to "to end".
    /// `offset == size` yields an empty slice.
    pub async fn read(
        &self,
        app_id: &str,
        block_id: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<(Vec<u8>, u64), CoreError> {
        let (slice, pool, encrypted, version) = {
            let mut blocks = self.blocks.write().await;
            let entry = blocks.get_mut(block_id).ok_or_else(|| CoreError::NotFound {
                what: "block",
                name: block_id.to_string(),
            })?;
            self.pools
                .access_check(app_id, &entry.record.pool, "memory")
                .await?;
            if !entry.permits(app_id, "read") {
                return Err(CoreError::AccessDenied {
                    app_id: app_id.to_string(),
                    resource: format!("block '{block_id}' read"),
                });
            }

            let size = entry.record.size;
            if offset > size {
                return Err(CoreError::OutOfBounds {
                    block_id: block_id.to_string(),
                    offset,
                    length: length.unwrap_or(0),
                    size,
                });
            }
            let length = length.unwrap_or(size - offset);
            if offset + length > size {
                return Err(CoreError::OutOfBounds {
                    block_id: block_id.to_string(),
                    offset,
                    length,
                    size,
                });
            }

            entry.touch();
            (
                entry.data[offset as usize..(offset + length) as usize].to_vec(),
                entry.record.pool.clone(),
                entry.record.encrypted,
                entry.record.version,
            )
        };

        let bytes = if encrypted {
            self.security.decrypt_block(&pool, &slice).await?
        } else {
            slice
        };
        Ok((bytes, version))
    }

    /// Copy `data` into `[offset, offset+len)` and bump the version. A
    /// zero-byte write is a no-op and increments nothing.
    pub async fn write(
        &self,
        app_id: &str,
        block_id: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<u64, CoreError> {
        let (version, pool, attachments) = {
            let mut blocks = self.blocks.write().await;
            let entry = blocks.get_mut(block_id).ok_or_else(|| CoreError::NotFound {
                what: "block",
                name: block_id.to_string(),
            })?;
            self.pools
                .access_check(app_id, &entry.record.pool, "memory")
                .await?;
            if !entry.permits(app_id, "write") {
                return Err(CoreError::AccessDenied {
                    app_id: app_id.to_string(),
                    resource: format!("block '{block_id}' write"),
                });
            }

            let size = entry.record.size;
            let length = data.len() as u64;
            if offset + length > size || (offset >= size && length > 0) {
                return Err(CoreError::OutOfBounds {
                    block_id: block_id.to_string(),
                    offset,
                    length,
                    size,
                });
            }

            entry.touch();
            if data.is_empty() {
                return Ok(entry.record.version);
            }

            let stored = if entry.record.encrypted {
                self.security
                    .encrypt_block(&entry.record.pool, data)
                    .await?
            } else {
                data.to_vec()
            };

            // Persist the bumped version before the mirror mutates; a store
            // failure must leave both bytes and version untouched.
            let mut record = entry.record.clone();
            record.version += 1;
            record.updated_at = Utc::now();
            self.persistence.put_block(&record).await?;
            if record.persistent {
                self.write_backing(block_id, offset, &stored)?;
            }

            entry.data[offset as usize..offset as usize + stored.len()]
                .copy_from_slice(&stored);
            entry.record = record;

            (
                entry.record.version,
                entry.record.pool.clone(),
                entry.attachments.clone(),
            )
        };

        self.notify_written(block_id, &pool, version, app_id, &attachments)
            .await;
        Ok(version)
    }

    /// Compare-and-swap at `offset`: if the current bytes equal `expected`,
    /// perform the write and return `(true, previous)`; otherwise return
    /// `(false, current)`. Comparison and write happen under one table
    /// lock, so no writer can slip between them.
    pub async fn compare_and_swap(
        &self,
        app_id: &str,
        block_id: &str,
        offset: u64,
        expected: &[u8],
        new: &[u8],
    ) -> Result<(bool, Vec<u8>, u64), CoreError> {
        let (previous, version, pool, attachments) = {
            let mut blocks = self.blocks.write().await;
            let entry = blocks.get_mut(block_id).ok_or_else(|| CoreError::NotFound {
                what: "block",
                name: block_id.to_string(),
            })?;
            self.pools
                .access_check(app_id, &entry.record.pool, "memory")
                .await?;
            if !entry.permits(app_id, "read") || !entry.permits(app_id, "write") {
                return Err(CoreError::AccessDenied {
                    app_id: app_id.to_string(),
                    resource: format!("block '{block_id}' compare_and_swap"),
                });
            }

            let size = entry.record.size;
            let span = expected.len().max(new.len()) as u64;
            if offset + span > size {
                return Err(CoreError::OutOfBounds {
                    block_id: block_id.to_string(),
                    offset,
                    length: span,
                    size,
                });
            }

            entry.touch();
            let raw = entry.data[offset as usize..offset as usize + expected.len()].to_vec();
            let current = if entry.record.encrypted {
                self.security.decrypt_block(&entry.record.pool, &raw).await?
            } else {
                raw
            };
            if current != expected {
                return Ok((false, current, entry.record.version));
            }
            if new.is_empty() {
                return Ok((true, current, entry.record.version));
            }

            let stored = if entry.record.encrypted {
                self.security.encrypt_block(&entry.record.pool, new).await?
            } else {
                new.to_vec()
            };

            let mut record = entry.record.clone();
            record.version += 1;
            record.updated_at = Utc::now();
            self.persistence.put_block(&record).await?;
            if record.persistent {
                self.write_backing(block_id, offset, &stored)?;
            }

            entry.data[offset as usize..offset as usize + stored.len()]
                .copy_from_slice(&stored);
            entry.record = record;
            (
                current,
                entry.record.version,
                entry.record.pool.clone(),
                entry.attachments.clone(),
            )
        };

        self.notify_written(block_id, &pool, version, app_id, &attachments)
            .await;
        Ok((true, previous, version))
    }

    /// Acquire an advisory lock. Non-queued: a conflicting holder fails the
    /// acquisition immediately. The lock auto-expires at its timeout.
    pub async fn lock(
        &self,
        app_id: &str,
        block_id: &str,
        mode: LockMode,
        timeout_ms: Option<u64>,
    ) -> Result<AdvisoryLock, CoreError> {
        let mut blocks = self.blocks.write().await;
        let entry = blocks.get_mut(block_id).ok_or_else(|| CoreError::NotFound {
            what: "block",
            name: block_id.to_string(),
        })?;
        self.pools
            .access_check(app_id, &entry.record.pool, "memory")
            .await?;

        entry.locks.retain(|l| !l.expired());
        if let Some(holder) = entry.locks.iter().find(|l| conflicts(l.mode, mode)) {
            return Err(CoreError::AccessDenied {
                app_id: app_id.to_string(),
                resource: format!(
                    "block '{block_id}' lock held by '{}' in {:?} mode",
                    holder.app_id, holder.mode
                ),
            });
        }

        let timeout = Duration::from_millis(timeout_ms.unwrap_or(DEFAULT_LOCK_TIMEOUT_MS));
        let lock = AdvisoryLock {
            lock_id: uuid::Uuid::new_v4().to_string(),
            app_id: app_id.to_string(),
            mode,
            expires_at: Instant::now() + timeout,
        };
        entry.locks.push(lock.clone());
        entry.touch();
        Ok(lock)
    }

    /// Release a lock. Only the acquiring app, presenting the lock id, may
    /// release; releasing an already-expired or unknown lock is a no-op.
    pub async fn unlock(
        &self,
        app_id: &str,
        block_id: &str,
        lock_id: &str,
    ) -> Result<(), CoreError> {
        let mut blocks = self.blocks.write().await;
        let entry = blocks.get_mut(block_id).ok_or_else(|| CoreError::NotFound {
            what: "block",
            name: block_id.to_string(),
        })?;
        entry.locks.retain(|l| !l.expired());

        if let Some(lock) = entry.locks.iter().find(|l| l.lock_id == lock_id) {
            if lock.app_id != app_id {
                return Err(CoreError::AccessDenied {
                    app_id: app_id.to_string(),
                    resource: format!("lock '{lock_id}' on block '{block_id}'"),
                });
            }
            entry.locks.retain(|l| l.lock_id != lock_id);
        }
        Ok(())
    }

    /// Remove a block. Fails while any app is attached.
    pub async fn remove(&self, app_id: &str, block_id: &str) -> Result<(), CoreError> {
        {
            let blocks = self.blocks.read().await;
            let entry = blocks.get(block_id).ok_or_else(|| CoreError::NotFound {
                what: "block",
                name: block_id.to_string(),
            })?;
            self.pools
                .access_check(app_id, &entry.record.pool, "memory")
                .await?;
            if !entry.permits(app_id, "write") {
                return Err(CoreError::AccessDenied {
                    app_id: app_id.to_string(),
                    resource: format!("block '{block_id}' remove"),
                });
            }
            if !entry.attachments.is_empty() {
                return Err(CoreError::validation(
                    "block_id",
                    "block still has attachments",
                ));
            }
        }

        self.persistence.delete_block(block_id).await?;
        let mut blocks = self.blocks.write().await;
        if let Some(entry) = blocks.remove(block_id)
            && entry.record.persistent
        {
            let _ = std::fs::remove_file(self.backing_path(block_id));
        }
        info!(block_id, "block removed");
        Ok(())
    }

    /// Garbage-collect idle blocks: non-persistent, zero attachments, idle
    /// longer than `idle_max_age`. Returns the number collected.
    pub async fn gc_sweep(&self, idle_max_age: Duration) -> usize {
        let victims: Vec<String> = {
            let blocks = self.blocks.read().await;
            blocks
                .values()
                .filter(|entry| {
                    !entry.record.persistent
                        && entry.attachments.is_empty()
                        && entry.last_accessed_at.elapsed() >= idle_max_age
                })
                .map(|entry| entry.record.block_id.clone())
                .collect()
        };

        let mut collected = 0;
        for block_id in victims {
            if let Err(e) = self.persistence.delete_block(&block_id).await {
                warn!(block_id, error = %e, "failed to delete idle block metadata");
                continue;
            }
            let mut blocks = self.blocks.write().await;
            // Recheck under the write lock: the block may have been
            // attached while we swept.
            let still_idle = blocks
                .get(&block_id)
                .is_some_and(|e| e.attachments.is_empty());
            if still_idle && blocks.remove(&block_id).is_some() {
                collected += 1;
                debug!(block_id, "idle block collected");
            }
        }
        collected
    }

    /// Snapshot every block for introspection.
    pub async fn list(&self) -> Vec<BlockInfo> {
        let blocks = self.blocks.read().await;
        let mut infos: Vec<_> = blocks
            .values()
            .map(|entry| BlockInfo {
                record: entry.record.clone(),
                attachments: entry.attachments.clone(),
                lock_count: entry.locks.iter().filter(|l| !l.expired()).count(),
            })
            .collect();
        infos.sort_by(|a, b| a.record.block_id.cmp(&b.record.block_id));
        infos
    }

    pub async fn block_count(&self) -> usize {
        self.blocks.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryPersistence;
    use crate::security::AllowAllSecurity;

    async fn fixture() -> (Arc<PoolManager>, MemoryManager, tempfile::TempDir) {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let security: Arc<dyn SecurityProvider> = Arc::new(AllowAllSecurity);
        let pools = Arc::new(
            PoolManager::load(persistence.clone(), security.clone())
                .await
                .unwrap(),
        );
        pools.add_app_to_pool("a", DEFAULT_POOL).await.unwrap();
        pools.add_app_to_pool("b", DEFAULT_POOL).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let memory = MemoryManager::load(
            persistence,
            pools.clone(),
            security,
            dir.path().to_path_buf(),
        )
        .await
        .unwrap();
        (pools, memory, dir)
    }

    fn create_params(block_id: &str, size: u64) -> CreateBlock {
        CreateBlock {
            block_id: block_id.to_string(),
            name: None,
            pool: None,
            size,
            block_type: None,
            persistent: false,
            encrypted: false,
            permissions: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_create_write_read_round_trip() {
        let (_pools, memory, _dir) = fixture().await;
        memory.create("a", create_params("m", 16)).await.unwrap();

        let version = memory.write("a", "m", 0, b"hello").await.unwrap();
        assert_eq!(version, 1);

        let (bytes, _) = memory.read("a", "m", 0, Some(5)).await.unwrap();
        assert_eq!(&bytes, b"hello");

        // Read to end defaults the length.
        let (bytes, _) = memory.read("a", "m", 5, None).await.unwrap();
        assert_eq!(bytes.len(), 11);
    }

    #[tokio::test]
    async fn test_version_strictly_monotonic() {
        let (_pools, memory, _dir) = fixture().await;
        memory.create("a", create_params("m", 8)).await.unwrap();

        let mut last = 0;
        for i in 0..5u8 {
            let version = memory.write("a", "m", 0, &[i]).await.unwrap();
            assert!(version > last);
            last = version;
        }

        // Zero-byte write is a no-op and increments nothing.
        let version = memory.write("a", "m", 0, b"").await.unwrap();
        assert_eq!(version, last);
    }

    #[tokio::test]
    async fn test_bounds() {
        let (_pools, memory, _dir) = fixture().await;
        memory.create("a", create_params("m", 16)).await.unwrap();

        // Read at offset == size returns empty.
        let (bytes, _) = memory.read("a", "m", 16, None).await.unwrap();
        assert!(bytes.is_empty());

        // Read past the end is out of bounds.
        assert!(matches!(
            memory.read("a", "m", 17, None).await,
            Err(CoreError::OutOfBounds { .. })
        ));
        assert!(matches!(
            memory.read("a", "m", 8, Some(9)).await,
            Err(CoreError::OutOfBounds { .. })
        ));

        // Write at offset == size rejects.
        assert!(matches!(
            memory.write("a", "m", 16, b"x").await,
            Err(CoreError::OutOfBounds { .. })
        ));
        assert!(matches!(
            memory.write("a", "m", 12, b"hello").await,
            Err(CoreError::OutOfBounds { .. })
        ));
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let (_pools, memory, _dir) = fixture().await;
        memory.create("a", create_params("m", 16)).await.unwrap();
        memory.write("a", "m", 0, b"hello").await.unwrap();

        let (swapped, previous, version) = memory
            .compare_and_swap("a", "m", 0, b"hello", b"world")
            .await
            .unwrap();
        assert!(swapped);
        assert_eq!(&previous, b"hello");
        // One increment per successful write: initial write plus the swap.
        assert_eq!(version, 2);

        let (swapped, current, version) = memory
            .compare_and_swap("a", "m", 0, b"hello", b"again")
            .await
            .unwrap();
        assert!(!swapped);
        assert_eq!(&current, b"world");
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn test_lock_conflicts_and_release() {
        let (_pools, memory, _dir) = fixture().await;
        memory.create("a", create_params("m", 8)).await.unwrap();

        let read1 = memory.lock("a", "m", LockMode::Read, None).await.unwrap();
        // Readers share.
        let _read2 = memory.lock("b", "m", LockMode::Read, None).await.unwrap();
        // A writer shares with readers but not with another writer.
        let write = memory.lock("b", "m", LockMode::Write, None).await.unwrap();
        assert!(memory.lock("a", "m", LockMode::Write, None).await.is_err());
        // Exclusive conflicts with everything held.
        assert!(
            memory
                .lock("a", "m", LockMode::Exclusive, None)
                .await
                .is_err()
        );

        // Only the acquirer may release.
        assert!(memory.unlock("a", "m", &write.lock_id).await.is_err());
        memory.unlock("b", "m", &write.lock_id).await.unwrap();
        memory.unlock("a", "m", &read1.lock_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_expires() {
        let (_pools, memory, _dir) = fixture().await;
        memory.create("a", create_params("m", 8)).await.unwrap();

        memory
            .lock("a", "m", LockMode::Exclusive, Some(0))
            .await
            .unwrap();
        // The zero-timeout lock is already expired; a new one succeeds.
        memory
            .lock("b", "m", LockMode::Exclusive, Some(1000))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_remove_refuses_attached() {
        let (_pools, memory, _dir) = fixture().await;
        memory.create("a", create_params("m", 8)).await.unwrap();
        memory.attach("b", "m", LockMode::Read).await.unwrap();

        assert!(memory.remove("a", "m").await.is_err());
        memory.detach("b", "m").await.unwrap();
        memory.remove("a", "m").await.unwrap();
        assert_eq!(memory.block_count().await, 0);
    }

    #[tokio::test]
    async fn test_permission_map() {
        let (_pools, memory, _dir) = fixture().await;
        let mut params = create_params("m", 8);
        params
            .permissions
            .insert("write".to_string(), vec!["a".to_string()]);
        memory.create("a", params).await.unwrap();

        // Reads stay open, writes are restricted to 'a'.
        memory.write("a", "m", 0, b"x").await.unwrap();
        assert!(matches!(
            memory.write("b", "m", 0, b"y").await,
            Err(CoreError::AccessDenied { .. })
        ));
        memory.read("b", "m", 0, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_gc_collects_only_idle_unattached() {
        let (_pools, memory, _dir) = fixture().await;
        memory.create("a", create_params("idle", 8)).await.unwrap();
        memory
            .create("a", create_params("attached", 8))
            .await
            .unwrap();
        memory.attach("a", "attached", LockMode::Read).await.unwrap();

        let collected = memory.gc_sweep(Duration::from_millis(0)).await;
        assert_eq!(collected, 1);
        assert_eq!(memory.block_count().await, 1);
    }

    #[tokio::test]
    async fn test_persistent_block_survives_reload() {
        let persistence: Arc<dyn Persistence> = Arc::new(MemoryPersistence::new());
        let security: Arc<dyn SecurityProvider> = Arc::new(AllowAllSecurity);
        let pools = Arc::new(
            PoolManager::load(persistence.clone(), security.clone())
                .await
                .unwrap(),
        );
        pools.add_app_to_pool("a", DEFAULT_POOL).await.unwrap();
        let dir = tempfile::tempdir().unwrap();

        let memory = MemoryManager::load(
            persistence.clone(),
            pools.clone(),
            security.clone(),
            dir.path().to_path_buf(),
        )
        .await
        .unwrap();
        let mut params = create_params("keep", 8);
        params.persistent = true;
        memory.create("a", params).await.unwrap();
        memory.write("a", "keep", 0, b"saved").await.unwrap();
        drop(memory);

        let reloaded = MemoryManager::load(
            persistence,
            pools,
            security,
            dir.path().to_path_buf(),
        )
        .await
        .unwrap();
        let (bytes, version) = reloaded.read("a", "keep", 0, Some(5)).await.unwrap();
        assert_eq!(&bytes, b"saved");
        assert_eq!(version, 1);
    }
}
