// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.
//!
//! CLI flags override environment variables; environment variables override
//! the built-in defaults. All durations are milliseconds unless the name
//! says otherwise.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

/// Destination-selection strategy for the trigger router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoutingPolicy {
    #[default]
    RoundRobin,
    Random,
    FirstAvailable,
    /// Stand-in for round-robin until per-handler load metrics exist.
    LoadBalanced,
}

impl FromStr for RoutingPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" | "round_robin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            "first-available" | "first_available" => Ok(Self::FirstAvailable),
            "load-balanced" | "load_balanced" => Ok(Self::LoadBalanced),
            _ => Err(ConfigError::Invalid(
                "LATZERO_ROUTING_POLICY",
                "must be one of round-robin, random, first-available, load-balanced",
            )),
        }
    }
}

/// LatZero server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the TCP listener binds to.
    pub bind_addr: SocketAddr,
    /// Data directory holding the durable store, backups, block backing
    /// files, and logs.
    pub data_dir: PathBuf,
    /// Keep all state in memory; nothing survives a restart.
    pub memory_mode: bool,
    /// Transport TLS (reserved).
    pub enable_tls: bool,
    /// Multi-node clustering (reserved).
    pub cluster_mode: bool,
    /// Ceiling on concurrent connections.
    pub max_connections: usize,
    /// Per-connection inbound messages per second; 0 disables the cap.
    pub max_messages_per_sec: u32,
    /// Upper bound on the in-flight trigger table.
    pub max_inflight: usize,
    /// TTL applied when a trigger carries none.
    pub default_ttl_ms: u64,
    /// Hard ceiling any requested TTL is clamped to.
    pub max_ttl_ms: u64,
    /// Destination selection strategy.
    pub routing_policy: RoutingPolicy,
    /// Smoothing factor for the response-time moving average.
    pub response_ema_alpha: f64,
    /// Interval of the router's straggler sweeper.
    pub sweep_interval_ms: u64,
    /// Age after which an offline registration is purged from the
    /// rehydration cache.
    pub rehydration_max_age_ms: u64,
    /// Age after which an idle, unattached, non-persistent block is
    /// garbage-collected.
    pub block_idle_max_age_ms: u64,
    /// Interval between durable-store snapshots; 0 disables periodic
    /// backups.
    pub backup_interval_ms: u64,
    /// Snapshot backups kept before the oldest is pruned.
    pub max_backups: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 45227)),
            data_dir: default_data_dir(),
            memory_mode: false,
            enable_tls: false,
            cluster_mode: false,
            max_connections: 1024,
            max_messages_per_sec: 0,
            max_inflight: 10_000,
            default_ttl_ms: 30_000,
            max_ttl_ms: 300_000,
            routing_policy: RoutingPolicy::RoundRobin,
            response_ema_alpha: 0.1,
            sweep_interval_ms: 60_000,
            rehydration_max_age_ms: 24 * 60 * 60 * 1000,
            block_idle_max_age_ms: 60 * 60 * 1000,
            backup_interval_ms: 60 * 60 * 1000,
            max_backups: 5,
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".latzero")
}

fn env_parsed<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid(name, "could not be parsed")),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => match raw.as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(ConfigError::Invalid(name, "must be a boolean")),
        },
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `LATZERO_PORT`: listen port (default: 45227)
    /// - `LATZERO_HOST`: bind address (default: 127.0.0.1)
    /// - `LATZERO_DATA_DIR`: data directory (default: ~/.latzero)
    /// - `LATZERO_MEMORY_MODE`: keep all state in memory (default: false)
    /// - `LATZERO_ENABLE_TLS`: reserved (default: false)
    /// - `LATZERO_CLUSTER_MODE`: reserved (default: false)
    /// - `LATZERO_MAX_CONNECTIONS`: connection ceiling (default: 1024)
    /// - `LATZERO_MAX_MESSAGES_PER_SEC`: per-connection rate cap, 0 = off
    /// - `LATZERO_MAX_INFLIGHT`: in-flight trigger cap (default: 10000)
    /// - `LATZERO_DEFAULT_TTL_MS` / `LATZERO_MAX_TTL_MS`
    /// - `LATZERO_ROUTING_POLICY`: round-robin | random | first-available |
    ///   load-balanced
    /// - `LATZERO_REHYDRATION_MAX_AGE_MS`, `LATZERO_BLOCK_IDLE_MAX_AGE_MS`,
    ///   `LATZERO_SWEEP_INTERVAL_MS`, `LATZERO_MAX_BACKUPS`
    pub fn from_env() -> Result<Self, ConfigError> {
        let default = Self::default();

        let port: u16 = env_parsed("LATZERO_PORT", default.bind_addr.port())?;
        let host: IpAddr = env_parsed("LATZERO_HOST", default.bind_addr.ip())?;

        let data_dir = std::env::var_os("LATZERO_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(default.data_dir);

        let routing_policy = match std::env::var("LATZERO_ROUTING_POLICY") {
            Ok(raw) => raw.parse()?,
            Err(_) => default.routing_policy,
        };

        Ok(Self {
            bind_addr: SocketAddr::new(host, port),
            data_dir,
            memory_mode: env_bool("LATZERO_MEMORY_MODE", default.memory_mode)?,
            enable_tls: env_bool("LATZERO_ENABLE_TLS", default.enable_tls)?,
            cluster_mode: env_bool("LATZERO_CLUSTER_MODE", default.cluster_mode)?,
            max_connections: env_parsed("LATZERO_MAX_CONNECTIONS", default.max_connections)?,
            max_messages_per_sec: env_parsed(
                "LATZERO_MAX_MESSAGES_PER_SEC",
                default.max_messages_per_sec,
            )?,
            max_inflight: env_parsed("LATZERO_MAX_INFLIGHT", default.max_inflight)?,
            default_ttl_ms: env_parsed("LATZERO_DEFAULT_TTL_MS", default.default_ttl_ms)?,
            max_ttl_ms: env_parsed("LATZERO_MAX_TTL_MS", default.max_ttl_ms)?,
            routing_policy,
            response_ema_alpha: default.response_ema_alpha,
            sweep_interval_ms: env_parsed("LATZERO_SWEEP_INTERVAL_MS", default.sweep_interval_ms)?,
            rehydration_max_age_ms: env_parsed(
                "LATZERO_REHYDRATION_MAX_AGE_MS",
                default.rehydration_max_age_ms,
            )?,
            block_idle_max_age_ms: env_parsed(
                "LATZERO_BLOCK_IDLE_MAX_AGE_MS",
                default.block_idle_max_age_ms,
            )?,
            backup_interval_ms: env_parsed(
                "LATZERO_BACKUP_INTERVAL_MS",
                default.backup_interval_ms,
            )?,
            max_backups: env_parsed("LATZERO_MAX_BACKUPS", default.max_backups)?,
        })
    }

    /// Path of the durable SQLite store.
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("latzero.db")
    }

    /// Directory of snapshot backups.
    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    /// Directory of memory-block backing files. On Linux, a tmpfs path is
    /// preferred when available; explicit data directories keep their
    /// backing files with the rest of their state.
    pub fn memory_dir(&self) -> PathBuf {
        if cfg!(target_os = "linux") && self.data_dir == default_data_dir() {
            let shm = PathBuf::from("/dev/shm");
            if shm.is_dir() {
                return shm.join("latzero");
            }
        }
        self.data_dir.join("memory")
    }

    /// Directory reserved for log shipping.
    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable or flag has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),

    /// A requested feature is parsed but not yet available.
    #[error("{0} is reserved and not yet supported")]
    Reserved(&'static str),
}
