// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker reclaiming WAL archive space.
//!
//! Runs only when enabled in the configuration. Each round compares the
//! archive size against half the data volume and prunes segments that the
//! newest base backup no longer needs.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::info;

use crate::manager::SharedManager;

/// Background worker that prunes the WAL archive.
pub struct WalCleanupWorker {
    manager: SharedManager,
    poll_interval: Duration,
    shutdown: Arc<Notify>,
}

impl WalCleanupWorker {
    /// Create a new cleanup worker.
    pub fn new(manager: SharedManager, poll_interval: Duration) -> Self {
        Self {
            manager,
            poll_interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the cleanup loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            "WAL cleanup worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("WAL cleanup worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.poll_interval) => {
                    let report = self.manager.lock().await.cleanup_wal_archive().await;
                    if !report.removed.is_empty() {
                        info!(
                            removed = report.removed.len(),
                            size_before = report.size_before,
                            size_after = report.size_after,
                            forced = report.forced,
                            "WAL archive pruned"
                        );
                    }
                }
            }
        }

        info!("WAL cleanup worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::MockAdmin;
    use crate::config::Config;
    use crate::manager::Manager;
    use crate::object_store::InMemoryObjectStore;
    use crate::supervisor::MockSupervisor;
    use crate::volume::VolumeTools;

    #[tokio::test]
    async fn test_run_exits_on_shutdown() {
        let manager = Arc::new(tokio::sync::Mutex::new(Manager::new(
            Arc::new(Config::default()),
            Arc::new(MockSupervisor::new()),
            Arc::new(MockAdmin::default()),
            Arc::new(InMemoryObjectStore::new()),
            VolumeTools::all("true"),
        )));
        let worker = Arc::new(WalCleanupWorker::new(manager, Duration::from_secs(3600)));
        let handle = worker.shutdown_handle();
        assert!(Arc::strong_count(&handle) >= 2);

        let task = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run().await }
        });
        handle.notify_one();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
