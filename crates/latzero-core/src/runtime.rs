// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Component wiring and lifecycle.
//!
//! The runtime builds the core in dependency order (persistence, pools,
//! memory, registry, router, transport), owns the maintenance tasks
//! (straggler sweeper, block GC, rehydration-cache purge), and tears
//! everything down in reverse on shutdown: stop accepting, fail the
//! in-flight table, persist registrations, close the store.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use latzero_protocol::{Emit, Message};

use crate::config::Config;
use crate::error::CoreError;
use crate::memory::{BlockObserver, MemoryManager};
use crate::persistence::{MemoryPersistence, Persistence, SqlitePersistence};
use crate::pools::PoolManager;
use crate::registry::AppRegistry;
use crate::router::{RouterConfig, TriggerRouter};
use crate::security::{AllowAllSecurity, SecurityProvider};
use crate::server::run_server;

/// Shared state threaded through the transport and handlers.
pub struct CoreState {
    pub config: Config,
    pub persistence: Arc<dyn Persistence>,
    pub security: Arc<dyn SecurityProvider>,
    pub pools: Arc<PoolManager>,
    pub memory: Arc<MemoryManager>,
    pub registry: Arc<AppRegistry>,
    pub router: Arc<TriggerRouter>,
    pub started_at: Instant,
    connections: AtomicUsize,
}

/// Notifies attached applications after each successful block write with an
/// `emit` named `memory:<block_id>`, so a subscriber can scope interest to
/// one block.
struct WriteFanout {
    registry: Arc<AppRegistry>,
}

impl BlockObserver for WriteFanout {
    fn block_written(
        &self,
        block_id: &str,
        pool: &str,
        version: u64,
        writer: &str,
        attachments: &[String],
    ) {
        let registry = self.registry.clone();
        let block_id = block_id.to_string();
        let pool = pool.to_string();
        let writer = writer.to_string();
        let attachments = attachments.to_vec();
        tokio::spawn(async move {
            for app_id in attachments {
                if app_id == writer {
                    continue;
                }
                if let Some(conn) = registry.connection_of(&app_id).await {
                    let _ = conn.send(Message::Emit(Emit {
                        trigger: format!("memory:{block_id}"),
                        payload: json!({
                            "block_id": block_id,
                            "version": version,
                            "writer": writer,
                        }),
                        pool: Some(pool.clone()),
                    }));
                }
            }
        });
    }
}

impl CoreState {
    /// Build every component in dependency order.
    pub async fn init(config: Config) -> Result<Arc<Self>, CoreError> {
        let persistence: Arc<dyn Persistence> = if config.memory_mode {
            info!("memory mode: all state is ephemeral");
            Arc::new(MemoryPersistence::new())
        } else {
            std::fs::create_dir_all(config.logs_dir()).map_err(|e| {
                CoreError::storage("create_dir", format!("logs dir: {e}"))
            })?;
            Arc::new(
                SqlitePersistence::from_path(
                    config.store_path(),
                    config.backups_dir(),
                    config.max_backups,
                )
                .await?,
            )
        };

        let security: Arc<dyn SecurityProvider> = Arc::new(AllowAllSecurity);

        let pools = Arc::new(PoolManager::load(persistence.clone(), security.clone()).await?);
        let memory = Arc::new(
            MemoryManager::load(
                persistence.clone(),
                pools.clone(),
                security.clone(),
                config.memory_dir(),
            )
            .await?,
        );
        let registry = Arc::new(AppRegistry::load(persistence.clone(), pools.clone()).await?);
        let router = Arc::new(TriggerRouter::new(
            RouterConfig::from(&config),
            registry.clone(),
            pools.clone(),
            persistence.clone(),
        ));

        memory
            .add_observer(Arc::new(WriteFanout {
                registry: registry.clone(),
            }))
            .await;

        persistence
            .set_server_config("protocol_version", latzero_protocol::PROTOCOL_VERSION)
            .await?;

        Ok(Arc::new(Self {
            config,
            persistence,
            security,
            pools,
            memory,
            registry,
            router,
            started_at: Instant::now(),
            connections: AtomicUsize::new(0),
        }))
    }

    /// Connection-close cleanup: cache the registration, fail the records
    /// anchored on the app, drop its attachments. Runs under the AppID
    /// critical section so no record can survive referencing the stale
    /// connection.
    pub async fn handle_disconnect(&self, conn_id: u64) {
        let Some(app_id) = self.registry.app_of_conn(conn_id).await else {
            return;
        };
        let _guard = self.registry.app_lock(&app_id).await;
        match self.registry.disconnect(conn_id).await {
            Ok(Some(app_id)) => {
                self.router.fail_for_app(&app_id).await;
                self.memory.detach_app_from_all(&app_id).await;
            }
            Ok(None) => {}
            Err(e) => {
                error!(conn_id, "disconnect cleanup failed: {}", e);
            }
        }
    }

    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }
}

/// A running server: transport plus maintenance tasks.
pub struct Runtime {
    state: Arc<CoreState>,
    shutdown: CancellationToken,
    local_addr: SocketAddr,
    server_task: JoinHandle<()>,
    maintenance_task: JoinHandle<()>,
}

impl Runtime {
    /// Initialize the core and start listening.
    pub async fn start(config: Config) -> Result<Self> {
        let bind_addr = config.bind_addr;
        let state = CoreState::init(config).await?;

        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind {bind_addr}"))?;
        let local_addr = listener.local_addr()?;

        let shutdown = CancellationToken::new();

        let server_state = state.clone();
        let server_shutdown = shutdown.clone();
        let server_task = tokio::spawn(async move {
            if let Err(e) = run_server(listener, server_state, server_shutdown).await {
                error!("server error: {}", e);
            }
        });

        let maintenance_task = tokio::spawn(maintenance_loop(state.clone(), shutdown.clone()));

        info!(addr = %local_addr, "latzero started");
        Ok(Self {
            state,
            shutdown,
            local_addr,
            server_task,
            maintenance_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> Arc<CoreState> {
        self.state.clone()
    }

    /// Block until a termination signal, then shut down gracefully.
    pub async fn run_until_signal(self) -> Result<()> {
        tokio::signal::ctrl_c()
            .await
            .context("failed to install signal handler")?;
        info!("termination signal received");
        self.stop().await
    }

    /// Graceful shutdown, in reverse initialization order.
    pub async fn stop(self) -> Result<()> {
        info!("shutting down");

        // Stop accepting and close every read loop; timers go with the
        // maintenance task.
        self.shutdown.cancel();
        let _ = self.server_task.await;
        self.maintenance_task.abort();

        // Time out whatever is still in flight, then persist registrations
        // and close the store.
        self.state.router.drain().await;
        if let Err(e) = self.state.registry.persist_all().await {
            warn!("failed to persist registrations on shutdown: {}", e);
        }
        self.state.persistence.close().await;

        info!("shutdown complete");
        Ok(())
    }
}

async fn maintenance_loop(state: Arc<CoreState>, shutdown: CancellationToken) {
    let mut tick = tokio::time::interval(Duration::from_millis(
        state.config.sweep_interval_ms.max(1_000),
    ));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_backup = Instant::now();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            _ = tick.tick() => {
                state.router.sweep().await;
                state
                    .memory
                    .gc_sweep(Duration::from_millis(state.config.block_idle_max_age_ms))
                    .await;
                state
                    .registry
                    .purge_rehydration_cache(state.config.rehydration_max_age_ms)
                    .await;

                let backup_due = !state.config.memory_mode
                    && state.config.backup_interval_ms > 0
                    && last_backup.elapsed()
                        >= Duration::from_millis(state.config.backup_interval_ms);
                if backup_due {
                    match state.persistence.backup().await {
                        Ok(_) => last_backup = Instant::now(),
                        Err(e) => warn!("periodic snapshot failed: {}", e),
                    }
                }
            }
        }
    }
}
