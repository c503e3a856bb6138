//! Replica daemon (replicad)
//!
//! Hosts replicated stores for remote proxies over TCP and sweeps expired
//! entities in the background.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (TCP on 7380, in-memory only)
//! replicad
//!
//! # With persistence
//! replicad --db /var/lib/replica/replica.db
//!
//! # With configuration file
//! replicad --config /etc/replica/replicad.toml
//! ```

mod cleanup;
mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use replica_core::SystemTimeSource;
use replica_storage::{MemoryStorage, SqliteStorage, Storage, StoreManager};
use replica_transport::{StorageService, TcpServer};

use crate::cleanup::Janitor;
use crate::config::{Args, Config};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::resolve(&args)?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    print_banner();

    let storage: Arc<dyn Storage> = match &config.db {
        Some(db_path) => {
            info!(path = %db_path.display(), "Initializing SQLite persistence");
            match SqliteStorage::new(db_path) {
                Ok(storage) => {
                    info!("SQLite persistence enabled");
                    Arc::new(storage)
                }
                Err(e) => {
                    warn!(error = %e, "Failed to initialize SQLite, running in-memory only");
                    Arc::new(MemoryStorage::new())
                }
            }
        }
        None => {
            info!("Running in-memory only (no db configured)");
            Arc::new(MemoryStorage::new())
        }
    };

    let manager = StoreManager::new(storage);
    let addr = config.socket_addr()?;
    info!(
        addr = %addr,
        cleanup_secs = config.cleanup.interval_secs,
        swept = config.cleanup.stores.len(),
        "Starting replica daemon"
    );

    let mut tasks = Vec::new();

    let server = TcpServer::new(StorageService::new(manager.clone()), addr);
    tasks.push(tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "TCP server error");
        }
    }));

    let janitor = Arc::new(
        Janitor::open(
            &manager,
            &config.swept_stores()?,
            config.cleanup.storage_budget_bytes,
            Arc::new(SystemTimeSource),
        )
        .await?,
    );
    let interval = Duration::from_secs(config.cleanup.interval_secs);
    let sweeper = janitor.clone();
    tasks.push(tokio::spawn(async move { sweeper.run(interval).await }));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    for task in &tasks {
        task.abort();
    }
    janitor.close().await;
    manager.close_all().await;

    Ok(())
}

fn print_banner() {
    println!(
        r#"
  ╦═╗╔═╗╔═╗╦  ╦╔═╗╔═╗
  ╠╦╝║╣ ╠═╝║  ║║  ╠═╣
  ╩╚═╚═╝╩  ╩═╝╩╚═╝╩ ╩
  Replicated CRDT stores
  Version {}
"#,
        env!("CARGO_PKG_VERSION")
    );
}
