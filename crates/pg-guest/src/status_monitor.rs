// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker refreshing the service status.
//!
//! Every tick probes the engine container and records the observed status.
//! The probe is skipped while `prepare` is running and before the instance
//! has ever been prepared.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, info};

use crate::manager::SharedManager;

/// Background worker that periodically probes the engine.
pub struct StatusMonitor {
    manager: SharedManager,
    poll_interval: Duration,
    shutdown: Arc<Notify>,
}

impl StatusMonitor {
    /// Create a new status monitor.
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

    /// Run the monitor loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            "Status monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Status monitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.poll_interval) => {
                    self.tick().await;
                }
            }
        }

        info!("Status monitor stopped");
    }

    async fn tick(&self) {
        let mut manager = self.manager.lock().await;
        let before = manager.get_service_status();
        manager.update_status().await;
        let after = manager.get_service_status();
        if before != after {
            info!(from = %before, to = %after, "Service status changed");
        } else {
            debug!(status = %after, "Service status unchanged");
        }
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

    fn manager() -> SharedManager {
        let config = Arc::new(Config::default());
        Arc::new(tokio::sync::Mutex::new(Manager::new(
            config,
            Arc::new(MockSupervisor::new()),
            Arc::new(MockAdmin::default()),
            Arc::new(InMemoryObjectStore::new()),
            VolumeTools::all("true"),
        )))
    }

    #[test]
    fn test_shutdown_handle() {
        let monitor = StatusMonitor::new(manager(), Duration::from_secs(3));
        let handle = monitor.shutdown_handle();
        assert!(Arc::strong_count(&handle) >= 2);
    }

    #[tokio::test]
    async fn test_run_exits_on_shutdown() {
        let monitor = Arc::new(StatusMonitor::new(manager(), Duration::from_secs(3600)));
        let handle = monitor.shutdown_handle();
        let task = tokio::spawn({
            let monitor = monitor.clone();
            async move { monitor.run().await }
        });
        handle.notify_one();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
