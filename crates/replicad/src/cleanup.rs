//! Periodic cleanup pass

use anyhow::Result;
use replica_core::{CrdtKind, StorageKey, TimeSource, Ttl};
use replica_storage::{Handle, HandleOptions, RemovalManager, RemovalReport, StoreManager};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Keeps a handle on each swept store. Every pass removes expired entities
/// and whatever hard-references them, enforces the storage budget and then
/// collects backing entities no collection references any more.
pub struct Janitor {
    handles: Vec<Arc<Handle>>,
    manager: StoreManager,
    removal: RemovalManager,
    storage_budget: Option<usize>,
}

impl Janitor {
    pub async fn open(
        manager: &StoreManager,
        stores: &[(StorageKey, CrdtKind)],
        storage_budget: Option<usize>,
        time: Arc<dyn TimeSource>,
    ) -> Result<Self> {
        let actor = format!("replicad-{}", std::process::id());
        let mut handles = Vec::with_capacity(stores.len());
        for (key, kind) in stores {
            let store = manager.get(key, *kind).await?;
            let options = HandleOptions {
                ttl: Ttl::Infinite,
                time: time.clone(),
            };
            let handle = Handle::open(&actor, store, options).await?;
            handle.idle().await;
            debug!(key = %key, "Cleanup watching store");
            handles.push(handle);
        }
        Ok(Self {
            handles,
            manager: manager.clone(),
            removal: RemovalManager::new(time),
            storage_budget,
        })
    }

    pub async fn sweep(&self) -> RemovalReport {
        let mut report = self.removal.sweep_expired(&self.handles).await;
        if let Some(budget) = self.storage_budget {
            match self
                .removal
                .enforce_storage_budget(&self.handles, self.manager.storage().as_ref(), budget)
                .await
            {
                Ok(cleared) => report += cleared,
                Err(e) => error!(error = %e, "Storage budget check failed"),
            }
        }
        for handle in &self.handles {
            handle.idle().await;
        }
        if let Err(e) = self.manager.collect_garbage().await {
            error!(error = %e, "Garbage collection failed");
        }
        report
    }

    /// Sweeps every `interval` until the task is cancelled.
    pub async fn run(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let report = self.sweep().await;
            if report.removed > 0 || report.failed > 0 {
                info!(removed = report.removed, failed = report.failed, "Cleanup pass");
            }
        }
    }

    pub async fn close(&self) {
        for handle in &self.handles {
            handle.close().await;
        }
    }
}
