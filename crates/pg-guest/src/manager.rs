// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The datastore manager.
//!
//! [`Manager`] owns every component of the controller and implements the
//! operations exposed to the control plane. It is shared behind an async
//! mutex so RPC handlers and periodic workers run one at a time.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::admin::{Admin, Lsn, Page, PgDatabase, PgUser, UserAttributes};
use crate::app::{CONTAINER_ARCHIVE_DIR, CONTAINER_CONFIG_DIR, CONTAINER_DATA_DIR, CONTAINER_RUN_DIR, PgApp};
use crate::backup::{BackupInfo, BackupManager, BackupResult};
use crate::config::Config;
use crate::configuration::{ConfigDict, ConfigurationManager};
use crate::error::{Error, Result};
use crate::guest_log::{GuestLogInfo, LogAction, LogShipper, LogStatus};
use crate::hba::HbaRuleset;
use crate::module_applier::{ModuleApplier, ModuleDescriptor, ModuleRecord, ModuleRef};
use crate::object_store::ObjectStore;
use crate::os::{self, MODE_PRIVATE_DIR};
use crate::replication::{REPLICATION_CHANGE_ID, ReplicationCoordinator, ReplicationSnapshot, SnapshotInfo};
use crate::status::ServiceStatus;
use crate::supervisor::Supervisor;
use crate::volume::{self, FilesystemStats, VolumeTools};
use crate::wal_archive::{ReclaimReport, WalArchiveManager};

/// Base configuration written when `prepare` carries none.
pub const DEFAULT_CONFIG_CONTENTS: &str = "listen_addresses = '*'\nmax_connections = 100\n";

/// Change-id of the overrides installed by `prepare` and `rebuild`.
pub const BASE_CHANGE_ID: &str = "common";

/// Manager shared between the RPC server and the workers.
pub type SharedManager = Arc<tokio::sync::Mutex<Manager>>;

/// Arguments of `prepare`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PrepareRequest {
    /// OS packages requested by the control plane
    pub packages: Vec<String>,
    /// Databases created on a fresh primary
    pub databases: Vec<PgDatabase>,
    /// Users created on a fresh primary
    pub users: Vec<PgUser>,
    /// Flavor memory in MiB
    pub memory_mb: Option<u64>,
    /// Block device holding the data volume
    pub device_path: Option<String>,
    /// Where to mount the data volume
    pub mount_point: Option<PathBuf>,
    /// Backup to restore from
    pub backup_info: Option<BackupInfo>,
    /// Base configuration file contents
    pub config_contents: Option<String>,
    /// Enable root with this password
    pub root_password: Option<String>,
    /// User overrides applied before the first start
    pub overrides: Option<ConfigDict>,
    /// Cluster configuration (unused by this engine)
    pub cluster_config: Option<Value>,
    /// Replication snapshot to attach to
    pub snapshot: Option<ReplicationSnapshot>,
    /// Datastore version (image tag)
    pub ds_version: Option<String>,
}

/// Effective overrides every instance runs with.
fn base_overrides(config: &Config) -> ConfigDict {
    let archive_command = format!(
        "test ! -f {dir}/%f && cp %p {dir}/%f",
        dir = CONTAINER_ARCHIVE_DIR
    );
    let mut kv = ConfigDict::new();
    kv.insert("data_directory".into(), Value::from(CONTAINER_DATA_DIR));
    kv.insert("hba_file".into(), Value::from(format!("{}/pg_hba.conf", CONTAINER_CONFIG_DIR)));
    kv.insert("unix_socket_directories".into(), Value::from(CONTAINER_RUN_DIR));
    kv.insert("port".into(), Value::from(config.port));
    kv.insert("wal_level".into(), Value::from("replica"));
    kv.insert("archive_mode".into(), Value::from(true));
    kv.insert("archive_command".into(), Value::from(archive_command));
    kv.insert("max_wal_senders".into(), Value::from(8));
    kv.insert("wal_log_hints".into(), Value::from(true));
    kv.insert("hot_standby".into(), Value::from(true));
    kv
}

/// Lifecycle controller for one PostgreSQL instance.
pub struct Manager {
    config: Arc<Config>,
    app: PgApp,
    admin: Arc<dyn Admin>,
    configuration: ConfigurationManager,
    backups: BackupManager,
    replication: ReplicationCoordinator,
    wal_archive: WalArchiveManager,
    logs: LogShipper,
    modules: ModuleApplier,
    volume: VolumeTools,
}

impl Manager {
    /// Assemble a manager from its capabilities.
    pub fn new(
        config: Arc<Config>,
        supervisor: Arc<dyn Supervisor>,
        admin: Arc<dyn Admin>,
        store: Arc<dyn ObjectStore>,
        volume: VolumeTools,
    ) -> Self {
        Self {
            app: PgApp::new(config.clone(), supervisor),
            admin,
            configuration: ConfigurationManager::for_postgres(&config),
            backups: BackupManager::new(config.clone(), volume.clone()),
            replication: ReplicationCoordinator::new(config.clone()),
            wal_archive: WalArchiveManager::new(config.wal_archive_dir()),
            logs: LogShipper::for_postgres(&config, store),
            modules: ModuleApplier::new(config.modules_dir()),
            volume,
            config,
        }
    }

    /// Controller configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The engine application.
    pub fn app(&self) -> &PgApp {
        &self.app
    }

    /// Configuration manager.
    pub fn configuration(&self) -> &ConfigurationManager {
        &self.configuration
    }

    /// Module applier, for registering extra drivers.
    pub fn modules_mut(&mut self) -> &mut ModuleApplier {
        &mut self.modules
    }

    fn admin(&self) -> &dyn Admin {
        self.admin.as_ref()
    }

    /// Current service status.
    pub fn get_service_status(&self) -> ServiceStatus {
        self.app.status().current()
    }

    /// Periodic status refresh.
    pub async fn update_status(&mut self) {
        self.app.update_status().await;
    }

    // ---- Lifecycle ----

    /// Install and start the engine.
    ///
    /// Any failure leaves the service `FAILED`; the error is returned.
    pub async fn prepare(&mut self, request: PrepareRequest) -> Result<()> {
        info!(
            packages = ?request.packages,
            memory_mb = ?request.memory_mb,
            restore = request.backup_info.is_some(),
            replica = request.snapshot.is_some(),
            "Preparing datastore"
        );
        if request.cluster_config.is_some() {
            info!("Cluster configuration ignored by this datastore");
        }

        self.app.status_mut().begin_install();
        match self.do_prepare(&request).await {
            Ok(()) => {
                self.app
                    .status_mut()
                    .end_install(false, ServiceStatus::Healthy)
                    .await;
                info!("Datastore prepared");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Prepare failed");
                self.app
                    .status_mut()
                    .end_install(true, ServiceStatus::Failed)
                    .await;
                Err(e)
            }
        }
    }

    async fn do_prepare(&mut self, request: &PrepareRequest) -> Result<()> {
        let owner = self.config.owner();
        if let Some(device) = &request.device_path {
            let mount_point = request
                .mount_point
                .as_deref()
                .unwrap_or(&self.config.mount_point);
            self.volume.mount(device, mount_point, owner).await?;
        }

        self.app.ensure_host_dirs().await?;
        os::ensure_dir(&self.config.mount_point.join("data"), owner, MODE_PRIVATE_DIR).await?;
        os::ensure_dir(&self.config.data_dir(), owner, MODE_PRIVATE_DIR).await?;
        os::ensure_dir(&self.config.wal_archive_dir(), owner, MODE_PRIVATE_DIR).await?;

        let contents = request
            .config_contents
            .as_deref()
            .unwrap_or(DEFAULT_CONFIG_CONTENTS);
        self.install_configuration(contents, request.overrides.as_ref())
            .await?;
        HbaRuleset::defaults(&self.config.admin_user)
            .write(&self.config.hba_file(), owner)
            .await?;

        let restore_from = request
            .backup_info
            .clone()
            .or_else(|| request.snapshot.as_ref().map(ReplicationSnapshot::backup_info));
        if let Some(info) = &restore_from {
            self.backups.restore(&mut self.app, info).await?;
        }
        if let Some(snapshot) = &request.snapshot {
            self.replication
                .enable_as_slave(&self.configuration, snapshot)
                .await?;
        }

        self.app.set_version(request.ds_version.clone());
        self.app.start_db(true).await?;
        self.admin.reset_connection().await;

        if restore_from.is_none() {
            if !request.databases.is_empty() {
                self.admin.create_databases(&request.databases).await?;
            }
            if !request.users.is_empty() {
                self.admin.create_users(&request.users).await?;
            }
        }
        if let Some(password) = &request.root_password {
            self.admin.enable_root(Some(password)).await?;
        }
        Ok(())
    }

    /// Write the base file, the base overrides and optional user overrides.
    async fn install_configuration(&self, contents: &str, overrides: Option<&ConfigDict>) -> Result<()> {
        self.configuration.reset_configuration(contents).await?;
        self.configuration
            .apply_system_override(&base_overrides(&self.config), Some(BASE_CHANGE_ID))
            .await?;
        if let Some(overrides) = overrides.filter(|o| !o.is_empty()) {
            self.configuration.apply_user_override(overrides, None).await?;
        }
        Ok(())
    }

    /// Restart the engine.
    pub async fn restart(&mut self) -> Result<()> {
        self.app.restart().await?;
        self.admin.reset_connection().await;
        self.logs.clear_restart_required();
        Ok(())
    }

    /// Stop the engine. Stopping a stopped engine succeeds.
    pub async fn stop_db(&mut self, do_not_start_on_reboot: bool) -> Result<()> {
        if do_not_start_on_reboot {
            info!("Engine will stay down until started explicitly");
        }
        self.app.stop_db(true).await?;
        self.admin.reset_connection().await;
        Ok(())
    }

    /// Rewrite the base configuration and start a stopped engine.
    pub async fn start_db_with_conf_changes(
        &mut self,
        config_contents: Option<&str>,
        ds_version: Option<String>,
    ) -> Result<()> {
        if self.app.probe().await.is_running() {
            return Err(Error::PreconditionFailed(
                "cannot change configuration while the engine is running".to_string(),
            ));
        }
        if let Some(contents) = config_contents {
            self.configuration.reset_configuration(contents).await?;
        }
        if ds_version.is_some() {
            self.app.set_version(ds_version);
        }
        self.app.start_db(true).await?;
        self.admin.reset_connection().await;
        self.logs.clear_restart_required();
        Ok(())
    }

    /// Rewrite the base configuration only.
    pub async fn reset_configuration(&self, config_contents: &str) -> Result<()> {
        self.configuration.reset_configuration(config_contents).await
    }

    /// Apply, or remove, the tenant's override set.
    pub async fn update_overrides(&self, overrides: &ConfigDict, remove: bool) -> Result<()> {
        if remove {
            self.configuration.remove_user_override(None).await
        } else {
            self.configuration.apply_user_override(overrides, None).await
        }
    }

    /// Make the engine re-read its configuration without restarting.
    pub async fn apply_overrides(&self, overrides: &ConfigDict) -> Result<()> {
        info!(keys = ?overrides.keys().collect::<Vec<_>>(), "Reloading configuration");
        self.admin.reload_configuration().await
    }

    /// Re-initialize on the same volume, typically after an image upgrade.
    pub async fn rebuild(
        &mut self,
        ds_version: Option<String>,
        config_contents: Option<&str>,
        overrides: Option<&ConfigDict>,
    ) -> Result<()> {
        info!(version = ?ds_version, "Rebuilding datastore");
        self.app.stop_db(true).await?;
        self.admin.reset_connection().await;

        let owner = self.config.owner();
        self.app.ensure_host_dirs().await?;
        os::ensure_dir(&self.config.data_dir(), owner, MODE_PRIVATE_DIR).await?;
        os::ensure_dir(&self.config.wal_archive_dir(), owner, MODE_PRIVATE_DIR).await?;

        let contents = match config_contents {
            Some(contents) => contents.to_string(),
            None => tokio::fs::read_to_string(self.configuration.base_path())
                .await
                .unwrap_or_else(|_| DEFAULT_CONFIG_CONTENTS.to_string()),
        };
        self.install_configuration(&contents, overrides).await?;
        if !self.config.hba_file().exists() {
            HbaRuleset::defaults(&self.config.admin_user)
                .write(&self.config.hba_file(), owner)
                .await?;
        }

        if ds_version.is_some() {
            self.app.set_version(ds_version);
        }
        self.app.start_db(true).await?;
        self.admin.reset_connection().await;
        self.logs.clear_restart_required();
        Ok(())
    }

    // ---- Backup / restore ----

    /// Take a base backup.
    pub async fn create_backup(&mut self, info: &BackupInfo) -> Result<BackupResult> {
        self.backups
            .create_backup(&self.app, self.admin.as_ref(), info)
            .await
    }

    /// Restore a backup over the data directory and start the engine.
    pub async fn perform_restore(
        &mut self,
        restore_location: Option<String>,
        backup_info: BackupInfo,
    ) -> Result<()> {
        let mut info = backup_info;
        if restore_location.is_some() {
            info.location = restore_location;
        }
        self.backups.restore(&mut self.app, &info).await?;
        if let Err(e) = self.app.start_db(true).await {
            error!(error = %e, "Engine failed to start after restore");
            self.app.status_mut().set_status(ServiceStatus::Failed, true);
            return Err(e);
        }
        self.app.status_mut().set_status(ServiceStatus::Healthy, true);
        self.admin.reset_connection().await;
        Ok(())
    }

    /// Open a backup window for an external snapshot.
    pub async fn pre_create_backup(&mut self) -> Result<String> {
        let label = format!("snapshot-{}", uuid::Uuid::new_v4());
        self.backups
            .pre_create_backup(self.admin.as_ref(), &label)
            .await?;
        Ok(label)
    }

    /// Close the backup window.
    pub async fn post_create_backup(&mut self) -> Result<()> {
        self.backups.post_create_backup(self.admin.as_ref()).await
    }

    // ---- Replication ----

    /// Become a replication source and produce a snapshot for a new replica.
    pub async fn get_replication_snapshot(
        &mut self,
        snapshot_info: &SnapshotInfo,
        replica_config: Option<&ConfigDict>,
    ) -> Result<ReplicationSnapshot> {
        if replica_config.is_some() {
            info!("Replica configuration is applied on the replica");
        }
        self.replication
            .get_replication_snapshot(&mut self.app, self.admin.as_ref(), &mut self.backups, snapshot_info)
            .await
    }

    /// Configure this node as a replica of the snapshot's primary.
    ///
    /// Without `restart` the change takes effect on the next restart.
    pub async fn attach_replica(
        &mut self,
        snapshot: &ReplicationSnapshot,
        replica_config: Option<&ConfigDict>,
        restart: bool,
    ) -> Result<()> {
        self.replication
            .enable_as_slave(&self.configuration, snapshot)
            .await?;
        if let Some(kv) = replica_config.filter(|kv| !kv.is_empty()) {
            self.configuration
                .apply_system_override(kv, Some(REPLICATION_CHANGE_ID))
                .await?;
        }
        if restart {
            self.restart().await
        } else {
            if self.app.status().current().is_running() {
                self.app.mark_restart_required();
            }
            Ok(())
        }
    }

    /// Promote this replica.
    pub async fn detach_replica(&mut self, for_failover: bool) -> Result<()> {
        info!(for_failover, "Detaching replica");
        self.replication
            .detach_slave(self.admin.as_ref(), &self.configuration)
            .await?;
        self.admin.reload_configuration().await
    }

    /// Rewind a former primary and restart it as a replica.
    pub async fn demote_replication_master(&mut self) -> Result<()> {
        self.replication
            .demote_master(&mut self.app, self.admin.as_ref(), &self.configuration)
            .await
    }

    /// Latest write (primary) or replay (replica) position.
    pub async fn get_latest_txn_id(&self) -> Result<Lsn> {
        self.replication.get_latest_txn_id(self.admin()).await
    }

    /// Wait until this replica replays `lsn`.
    pub async fn wait_for_txn(&self, lsn: Lsn) -> Result<()> {
        self.replication.wait_for_txn(self.admin(), lsn).await
    }

    /// Read-only mode is not supported by this engine; accepted as a no-op.
    pub async fn make_read_only(&self, read_only: bool) -> Result<()> {
        info!(read_only, "make_read_only is a no-op for this datastore");
        Ok(())
    }

    // ---- Users and databases ----

    /// Create users.
    pub async fn create_user(&self, users: &[PgUser]) -> Result<()> {
        self.admin().create_users(users).await
    }

    /// Drop a user.
    pub async fn delete_user(&self, user: &PgUser) -> Result<()> {
        self.admin().delete_user(user).await
    }

    /// List users.
    pub async fn list_users(
        &self,
        limit: Option<usize>,
        marker: Option<&str>,
        include_marker: bool,
    ) -> Result<Page<PgUser>> {
        self.admin().list_users(limit, marker, include_marker).await
    }

    /// A single user, if it exists.
    pub async fn get_user(&self, username: &str, hostname: Option<&str>) -> Result<Option<PgUser>> {
        self.admin().get_user(username, hostname).await
    }

    /// Set passwords.
    pub async fn change_passwords(&self, users: &[PgUser]) -> Result<()> {
        self.admin().change_passwords(users).await
    }

    /// Rename a user or set its password.
    pub async fn update_attributes(
        &self,
        username: &str,
        hostname: Option<&str>,
        attrs: &UserAttributes,
    ) -> Result<()> {
        self.admin()
            .update_attributes(username, hostname, attrs)
            .await
    }

    /// Grant database access.
    pub async fn grant_access(
        &self,
        username: &str,
        hostname: Option<&str>,
        databases: &[String],
    ) -> Result<()> {
        self.admin()
            .grant_access(username, hostname, databases)
            .await
    }

    /// Revoke database access.
    pub async fn revoke_access(&self, username: &str, hostname: Option<&str>, database: &str) -> Result<()> {
        self.admin()
            .revoke_access(username, hostname, database)
            .await
    }

    /// Databases a user can access.
    pub async fn list_access(&self, username: &str, hostname: Option<&str>) -> Result<Vec<PgDatabase>> {
        self.admin().list_access(username, hostname).await
    }

    /// Create databases.
    pub async fn create_database(&self, databases: &[PgDatabase]) -> Result<()> {
        self.admin().create_databases(databases).await
    }

    /// Drop a database.
    pub async fn delete_database(&self, database: &PgDatabase) -> Result<()> {
        self.admin().delete_database(database).await
    }

    /// List databases.
    pub async fn list_databases(
        &self,
        limit: Option<usize>,
        marker: Option<&str>,
        include_marker: bool,
    ) -> Result<Page<PgDatabase>> {
        self.admin()
            .list_databases(limit, marker, include_marker)
            .await
    }

    /// Enable the root superuser.
    pub async fn enable_root(&self, root_password: Option<&str>) -> Result<PgUser> {
        self.admin().enable_root(root_password).await
    }

    /// Disable root by rotating its password.
    pub async fn disable_root(&self) -> Result<()> {
        self.admin().disable_root().await
    }

    /// Whether root is enabled.
    pub async fn is_root_enabled(&self) -> Result<bool> {
        self.admin().is_root_enabled().await
    }

    // ---- Logs and modules ----

    /// Logs visible to the caller.
    pub async fn guest_log_list(&mut self, is_admin: bool) -> Result<Vec<GuestLogInfo>> {
        self.logs.list(&self.configuration, is_admin).await
    }

    /// Enable, disable, publish or discard a log.
    pub async fn guest_log_action(&mut self, action: &LogAction, is_admin: bool) -> Result<GuestLogInfo> {
        let info = self
            .logs
            .action(&self.configuration, action, is_admin)
            .await?;
        if info.status == LogStatus::RestartRequired {
            self.app.mark_restart_required();
        }
        Ok(info)
    }

    /// Apply modules.
    pub async fn module_apply(&self, modules: &[ModuleDescriptor], is_admin: bool) -> Result<Vec<ModuleRecord>> {
        self.modules.apply(modules, is_admin).await
    }

    /// Remove a module.
    pub async fn module_remove(&self, module: &ModuleRef, is_admin: bool) -> Result<()> {
        self.modules.remove(module, is_admin).await.map(|_| ())
    }

    /// Applied modules.
    pub async fn module_list(&self, include_contents: bool, is_admin: bool) -> Result<Vec<ModuleRecord>> {
        self.modules.list(include_contents, is_admin).await
    }

    // ---- Volume ----

    fn mount_point_or_default<'a>(&'a self, mount_point: Option<&'a Path>) -> &'a Path {
        mount_point.unwrap_or(&self.config.mount_point)
    }

    /// Mount a device.
    pub async fn mount_volume(&self, device_path: &str, mount_point: Option<&Path>) -> Result<()> {
        let mount_point = self.mount_point_or_default(mount_point);
        self.volume
            .mount(device_path, mount_point, self.config.owner())
            .await
    }

    /// Unmount a device.
    pub async fn unmount_volume(&self, mount_point: Option<&Path>) -> Result<()> {
        self.volume
            .unmount(self.mount_point_or_default(mount_point))
            .await
    }

    /// Grow the filesystem to fill its device.
    pub async fn resize_fs(&self, device_path: &str, mount_point: Option<&Path>) -> Result<()> {
        let mount_point = self.mount_point_or_default(mount_point);
        self.volume
            .resize(device_path, mount_point, self.config.owner())
            .await
    }

    /// Usage of the filesystem holding `path` (the data volume by default).
    pub fn get_filesystem_stats(&self, path: Option<&Path>) -> Result<FilesystemStats> {
        volume::filesystem_stats(self.mount_point_or_default(path))
    }

    // ---- WAL archive ----

    /// Reclaim WAL archive space against the data volume size.
    ///
    /// Never fails; a volume that cannot be measured skips the round.
    pub async fn cleanup_wal_archive(&self) -> ReclaimReport {
        let volume_size = match volume::filesystem_stats(&self.config.mount_point) {
            Ok(stats) => stats.total,
            Err(e) => {
                warn!(error = %e, "Cannot measure data volume, skipping WAL cleanup");
                return ReclaimReport::default();
            }
        };
        self.wal_archive.reclaim(volume_size).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_overrides_archive_into_container_dir() {
        let config = Config::default();
        let kv = base_overrides(&config);
        let archive = kv["archive_command"].as_str().unwrap();
        assert!(archive.contains(CONTAINER_ARCHIVE_DIR));
        assert_eq!(kv["archive_mode"], Value::Bool(true));
        assert_eq!(kv["wal_level"], Value::from("replica"));
        assert_eq!(kv["port"], Value::from(config.port));
    }

    #[test]
    fn test_prepare_request_defaults() {
        let request: PrepareRequest = serde_json::from_str("{}").unwrap();
        assert!(request.databases.is_empty());
        assert!(request.backup_info.is_none());
        assert!(request.snapshot.is_none());
    }
}
