// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable controller runtime.
//!
//! [`GuestRuntime`] wires the manager to the RPC server and the periodic
//! workers:
//!
//! ```rust,ignore
//! let runtime = GuestRuntime::builder()
//!     .config(config)
//!     .supervisor(Arc::new(DockerSupervisor::new(DockerSupervisorConfig::default())))
//!     .admin(admin)
//!     .object_store(store)
//!     .build()?
//!     .start()
//!     .await?;
//!
//! tokio::signal::ctrl_c().await?;
//! runtime.shutdown().await?;
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::admin::Admin;
use crate::config::Config;
use crate::manager::{Manager, SharedManager};
use crate::object_store::ObjectStore;
use crate::server::run_server_with_shutdown;
use crate::status_monitor::StatusMonitor;
use crate::supervisor::Supervisor;
use crate::volume::VolumeTools;
use crate::wal_cleanup_worker::WalCleanupWorker;

/// Builder for a [`GuestRuntime`].
#[derive(Default)]
pub struct GuestRuntimeBuilder {
    config: Option<Config>,
    supervisor: Option<Arc<dyn Supervisor>>,
    admin: Option<Arc<dyn Admin>>,
    object_store: Option<Arc<dyn ObjectStore>>,
    volume_tools: Option<VolumeTools>,
}

impl GuestRuntimeBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Controller configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Container supervisor (required).
    pub fn supervisor(mut self, supervisor: Arc<dyn Supervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// Engine admin client (required).
    pub fn admin(mut self, admin: Arc<dyn Admin>) -> Self {
        self.admin = Some(admin);
        self
    }

    /// Object store for log shipping (required).
    pub fn object_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.object_store = Some(store);
        self
    }

    /// Volume tools.
    ///
    /// Default: the system `mount`, `resize2fs`, `fsfreeze` and friends
    pub fn volume_tools(mut self, tools: VolumeTools) -> Self {
        self.volume_tools = Some(tools);
        self
    }

    /// Assemble the manager.
    ///
    /// Returns an error if a required part is missing.
    pub fn build(self) -> Result<GuestRuntimeConfig> {
        let config = self
            .config
            .ok_or_else(|| anyhow::anyhow!("config is required"))?;
        let supervisor = self
            .supervisor
            .ok_or_else(|| anyhow::anyhow!("supervisor is required"))?;
        let admin = self
            .admin
            .ok_or_else(|| anyhow::anyhow!("admin is required"))?;
        let store = self
            .object_store
            .ok_or_else(|| anyhow::anyhow!("object_store is required"))?;

        let config = Arc::new(config);
        let manager = Manager::new(
            config.clone(),
            supervisor,
            admin,
            store,
            self.volume_tools.unwrap_or_default(),
        );
        Ok(GuestRuntimeConfig {
            config,
            manager: Arc::new(Mutex::new(manager)),
        })
    }
}

/// A built but not yet started runtime.
pub struct GuestRuntimeConfig {
    config: Arc<Config>,
    manager: SharedManager,
}

impl GuestRuntimeConfig {
    /// Shared manager, e.g. to register module drivers before start.
    pub fn manager(&self) -> &SharedManager {
        &self.manager
    }

    /// Spawn the RPC server and the workers.
    pub async fn start(self) -> Result<GuestRuntime> {
        let status_monitor = StatusMonitor::new(self.manager.clone(), self.config.status_interval);
        let status_shutdown = status_monitor.shutdown_handle();
        let status_handle = tokio::spawn(async move {
            status_monitor.run().await;
        });

        let wal_cleanup = if self.config.wal_cleanup_enabled {
            let worker = WalCleanupWorker::new(self.manager.clone(), self.config.wal_cleanup_interval);
            let shutdown = worker.shutdown_handle();
            let handle = tokio::spawn(async move {
                worker.run().await;
            });
            Some((handle, shutdown))
        } else {
            info!("WAL cleanup disabled");
            None
        };

        let (server_shutdown_tx, server_shutdown_rx) = watch::channel(false);
        let socket_path = self.config.socket_path.clone();
        let server_handle = tokio::spawn(run_server_with_shutdown(
            socket_path.clone(),
            self.manager.clone(),
            server_shutdown_rx,
        ));

        info!(
            socket = %socket_path.display(),
            instance_id = %self.config.instance_id,
            wal_cleanup = wal_cleanup.is_some(),
            "GuestRuntime started"
        );

        Ok(GuestRuntime {
            server_handle,
            status_handle,
            wal_cleanup,
            server_shutdown_tx,
            status_shutdown,
            manager: self.manager,
            socket_path,
        })
    }
}

/// A running controller.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct GuestRuntime {
    server_handle: JoinHandle<Result<()>>,
    status_handle: JoinHandle<()>,
    wal_cleanup: Option<(JoinHandle<()>, Arc<Notify>)>,
    server_shutdown_tx: watch::Sender<bool>,
    status_shutdown: Arc<Notify>,
    manager: SharedManager,
    socket_path: PathBuf,
}

impl GuestRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> GuestRuntimeBuilder {
        GuestRuntimeBuilder::new()
    }

    /// Path of the RPC socket.
    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Shared manager.
    pub fn manager(&self) -> &SharedManager {
        &self.manager
    }

    /// Check if every task is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished()
            && !self.status_handle.is_finished()
            && self
                .wal_cleanup
                .as_ref()
                .is_none_or(|(handle, _)| !handle.is_finished())
    }

    /// Signal every task to stop and wait for them.
    pub async fn shutdown(self) -> Result<()> {
        info!("GuestRuntime shutting down...");

        let _ = self.server_shutdown_tx.send(true);
        self.status_shutdown.notify_one();
        if let Some((_, shutdown)) = &self.wal_cleanup {
            shutdown.notify_one();
        }

        if let Err(e) = self.status_handle.await {
            error!("Status monitor task panicked: {}", e);
        }
        if let Some((handle, _)) = self.wal_cleanup
            && let Err(e) = handle.await
        {
            error!("WAL cleanup task panicked: {}", e);
        }

        match self.server_handle.await {
            Ok(Ok(())) => {
                info!("GuestRuntime shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("RPC server error during shutdown: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("RPC server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
        }
    }
}
