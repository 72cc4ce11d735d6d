// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! LatZero server binary.
//!
//! `latzero start` boots the orchestration core and runs until a
//! termination signal; `status` and `stop` are stubs pending a local
//! control channel.

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use latzero_core::{Config, Runtime};

#[derive(Parser)]
#[command(name = "latzero", version, about = "LatZero orchestration server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Start(StartArgs),
    /// Query a running server (stub)
    Status,
    /// Stop a running server (stub)
    Stop,
}

#[derive(Args)]
struct StartArgs {
    /// Listen port (overrides LATZERO_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// Bind address (overrides LATZERO_HOST)
    #[arg(long)]
    host: Option<IpAddr>,

    /// Data directory (overrides LATZERO_DATA_DIR)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "latzero_core=trace"
    #[arg(long)]
    log_level: Option<String>,

    /// Keep all state in memory; nothing survives a restart
    #[arg(long)]
    memory_mode: bool,

    /// Multi-node clustering (reserved)
    #[arg(long)]
    cluster: bool,

    /// Transport TLS (reserved)
    #[arg(long)]
    tls: bool,
}

fn init_tracing(log_level: Option<&str>) {
    let default_directive = log_level.unwrap_or("latzero_core=info,latzero_protocol=info");
    let filter = EnvFilter::try_from_env("LATZERO_LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env from the working directory or its parents.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    match cli.command {
        Commands::Start(args) => start(args).await,
        Commands::Status => {
            println!("latzero status: not implemented");
            Ok(())
        }
        Commands::Stop => {
            println!("latzero stop: not implemented");
            Ok(())
        }
    }
}

async fn start(args: StartArgs) -> Result<()> {
    init_tracing(args.log_level.as_deref());

    if args.cluster {
        bail!("--cluster is reserved and not yet supported");
    }
    if args.tls {
        bail!("--tls is reserved and not yet supported");
    }

    let mut config = Config::from_env()?;
    if config.cluster_mode {
        bail!("LATZERO_CLUSTER_MODE is reserved and not yet supported");
    }
    if config.enable_tls {
        bail!("LATZERO_ENABLE_TLS is reserved and not yet supported");
    }
    if let Some(port) = args.port {
        config.bind_addr.set_port(port);
    }
    if let Some(host) = args.host {
        config.bind_addr.set_ip(host);
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if args.memory_mode {
        config.memory_mode = true;
    }

    info!(
        addr = %config.bind_addr,
        data_dir = %config.data_dir.display(),
        memory_mode = config.memory_mode,
        "starting latzero"
    );

    let runtime = Runtime::start(config).await?;
    runtime.run_until_signal().await
}
