// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backup and restore through sidecar containers.
//!
//! The sidecar image streams the data directory to (or from) the object
//! store. The controller brackets a backup with the engine's backup window
//! and keeps the mount point frozen while the sidecar copies files.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::admin::Admin;
use crate::app::{CONTAINER_ARCHIVE_DIR, CONTAINER_DATA_DIR, CONTAINER_MOUNT, CONTAINER_RUN_DIR, PgApp};
use crate::config::{Config, DATASTORE_MANAGER};
use crate::configuration::{ConfigCodec, PostgresCodec};
use crate::error::{Error, Result};
use crate::os::{self, MODE_CONFIG, MODE_PRIVATE_DIR};
use crate::status::ServiceStatus;
use crate::supervisor::{OneshotOutput, OneshotSpec, VolumeMount};
use crate::volume::{FreezeGuard, VolumeTools};

/// Sidecar container name for backups.
pub const BACKUP_CONTAINER: &str = "db_backup";
/// Sidecar container name for restores.
pub const RESTORE_CONTAINER: &str = "db_restore";
/// Suffix of encrypted backup blobs.
pub const ENCRYPTED_SUFFIX: &str = ".enc";
/// File in the data directory carrying settings snapshotted at backup time.
pub const AUTO_CONF_FILE: &str = "postgresql.auto.conf";

/// Backup descriptor sent by the control plane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupInfo {
    /// Backup id
    pub id: String,
    /// Blob location (restore, or an explicit backup target)
    #[serde(default)]
    pub location: Option<String>,
    /// Blob checksum
    #[serde(default)]
    pub checksum: Option<String>,
    /// Backup type reported by the control plane
    #[serde(default, rename = "type")]
    pub backup_type: Option<String>,
    /// Parent location for incremental backups
    #[serde(default)]
    pub parent_location: Option<String>,
    /// Parent checksum for incremental backups
    #[serde(default)]
    pub parent_checksum: Option<String>,
    /// Datastore version the backup was taken with
    #[serde(default)]
    pub datastore_version: Option<String>,
}

impl BackupInfo {
    /// Whether the blob is encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.location
            .as_deref()
            .is_some_and(|loc| loc.ends_with(ENCRYPTED_SUFFIX))
    }
}

/// What the backup sidecar reports on its last output line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupResult {
    /// Stored blob location
    #[serde(default)]
    pub location: Option<String>,
    /// Blob checksum
    #[serde(default)]
    pub checksum: Option<String>,
    /// Blob size in bytes
    #[serde(default)]
    pub size: Option<u64>,
}

impl BackupResult {
    /// Parse the last JSON object line of the sidecar output.
    pub fn from_output(lines: &[String]) -> Option<Self> {
        lines
            .iter()
            .rev()
            .map(|line| line.trim())
            .filter(|line| line.starts_with('{'))
            .find_map(|line| serde_json::from_str(line).ok())
    }
}

/// Sidecar failure summary: the last few output lines.
fn failure_tail(output: &OneshotOutput) -> String {
    let start = output.lines.len().saturating_sub(5);
    output.lines[start..].join("\n")
}

struct BackupWindow {
    major_version: u32,
    freeze: Option<FreezeGuard>,
}

/// Runs backups and restores.
pub struct BackupManager {
    config: Arc<Config>,
    tools: VolumeTools,
    window: Option<BackupWindow>,
}

impl BackupManager {
    /// Create an orchestrator.
    pub fn new(config: Arc<Config>, tools: VolumeTools) -> Self {
        Self {
            config,
            tools,
            window: None,
        }
    }

    /// Whether a `pre_create_backup` window is open.
    pub fn window_open(&self) -> bool {
        self.window.is_some()
    }

    fn sidecar_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if let Some(url) = &self.config.object_store_url {
            env.insert("OS_STORAGE_URL".to_string(), url.clone());
        }
        if let Some(token) = &self.config.object_store_token {
            env.insert("OS_AUTH_TOKEN".to_string(), token.clone());
        }
        env.insert("OS_CONTAINER".to_string(), self.config.backup_container.clone());
        env
    }

    fn sidecar_spec(&self, name: &str, command: Vec<String>, env: BTreeMap<String, String>) -> OneshotSpec {
        OneshotSpec {
            name: name.to_string(),
            image: self.config.backup_docker_image.clone(),
            command,
            env,
            volumes: vec![
                VolumeMount::rw(self.config.mount_point.join("data"), &format!("{}/data", CONTAINER_MOUNT)),
                VolumeMount::ro(&self.config.run_dir, CONTAINER_RUN_DIR),
            ],
            user: Some(self.config.owner()),
            timeout: None,
        }
    }

    /// Command line of the backup sidecar.
    pub fn backup_command(&self, info: &BackupInfo) -> Vec<String> {
        let mut command = vec![
            "backup".to_string(),
            format!("--backup-id={}", info.id),
            format!("--datastore={}", DATASTORE_MANAGER),
            format!("--data-dir={}", CONTAINER_DATA_DIR),
            format!("--wal-archive-dir={}", CONTAINER_ARCHIVE_DIR),
            format!("--socket-dir={}", CONTAINER_RUN_DIR),
            format!("--db-user={}", self.config.admin_user),
        ];
        if let Some(parent) = &info.parent_location {
            command.push(format!("--parent-location={}", parent));
        }
        if let Some(checksum) = &info.parent_checksum {
            command.push(format!("--parent-checksum={}", checksum));
        }
        command
    }

    /// Command line of the restore sidecar.
    pub fn restore_command(&self, info: &BackupInfo, location: &str) -> Vec<String> {
        let mut command = vec![
            "restore".to_string(),
            format!("--backup-id={}", info.id),
            format!("--datastore={}", DATASTORE_MANAGER),
            format!("--restore-location={}", location),
            format!("--data-dir={}", CONTAINER_DATA_DIR),
            format!("--wal-archive-dir={}", CONTAINER_ARCHIVE_DIR),
        ];
        if let Some(checksum) = &info.checksum {
            command.push(format!("--restore-checksum={}", checksum));
        }
        command
    }

    /// Record `max_connections` of the running engine in the data directory
    /// so a restored replica starts with a compatible value.
    async fn snapshot_max_connections(&self, admin: &dyn Admin) -> Result<()> {
        let Some(value) = admin.setting("max_connections").await? else {
            return Ok(());
        };
        let path = self.config.data_dir().join(AUTO_CONF_FILE);
        let codec = PostgresCodec;
        let mut dict = match tokio::fs::read_to_string(&path).await {
            Ok(text) => codec.parse(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Default::default(),
            Err(e) => return Err(e.into()),
        };
        dict.insert(
            "max_connections".to_string(),
            crate::configuration::codec::infer_scalar(&value),
        );
        os::write_atomic(&path, codec.render(&dict).as_bytes(), self.config.owner(), MODE_CONFIG).await
    }

    /// Take a base backup of the running engine.
    pub async fn create_backup(
        &mut self,
        app: &PgApp,
        admin: &dyn Admin,
        info: &BackupInfo,
    ) -> Result<BackupResult> {
        if self.window.is_some() {
            return Err(Error::PreconditionFailed(
                "a backup window is already open".to_string(),
            ));
        }
        let major = admin.server_version_major().await?;
        info!(backup_id = %info.id, major, "Starting backup");
        admin.backup_start(&info.id, major).await?;

        let result = self.run_backup_sidecar(app, admin, info).await;

        if let Err(e) = admin.backup_stop(major).await {
            error!(backup_id = %info.id, error = %e, "Failed to close backup window");
            if result.is_ok() {
                return Err(e);
            }
        }
        let result = result?;
        info!(backup_id = %info.id, location = ?result.location, "Backup completed");
        Ok(result)
    }

    async fn run_backup_sidecar(
        &self,
        app: &PgApp,
        admin: &dyn Admin,
        info: &BackupInfo,
    ) -> Result<BackupResult> {
        self.snapshot_max_connections(admin).await?;

        let mut env = self.sidecar_env();
        if let Some(password) = app.read_admin_password().await? {
            env.insert("PGPASSWORD".to_string(), password);
        }
        if let Some(key) = &self.config.backup_encryption_key {
            env.insert("BACKUP_ENCRYPTION_KEY".to_string(), key.clone());
        }
        let spec = self.sidecar_spec(BACKUP_CONTAINER, self.backup_command(info), env);

        let freeze = self.tools.freeze(&self.config.mount_point).await?;
        let output = app.supervisor().run_oneshot(&spec).await;
        freeze.release().await?;

        let output = output?;
        if !output.success {
            return Err(Error::Other(format!(
                "backup {} failed: {}",
                info.id,
                failure_tail(&output)
            )));
        }
        BackupResult::from_output(&output.lines).ok_or_else(|| {
            Error::Other(format!("backup {} produced no result line", info.id))
        })
    }

    /// Open a backup window for an externally driven snapshot: start the
    /// engine's backup mode, then sync and freeze the mount point.
    pub async fn pre_create_backup(&mut self, admin: &dyn Admin, label: &str) -> Result<()> {
        if self.window.is_some() {
            return Err(Error::PreconditionFailed(
                "a backup window is already open".to_string(),
            ));
        }
        let major_version = admin.server_version_major().await?;
        admin.backup_start(label, major_version).await?;
        let freeze = match self.tools.freeze(&self.config.mount_point).await {
            Ok(guard) => guard,
            Err(e) => {
                if let Err(stop_err) = admin.backup_stop(major_version).await {
                    warn!(error = %stop_err, "Failed to close backup window after freeze failure");
                }
                return Err(e);
            }
        };
        self.window = Some(BackupWindow {
            major_version,
            freeze: Some(freeze),
        });
        info!(label, "Backup window opened");
        Ok(())
    }

    /// Close the window opened by [`pre_create_backup`](Self::pre_create_backup).
    pub async fn post_create_backup(&mut self, admin: &dyn Admin) -> Result<()> {
        let Some(mut window) = self.window.take() else {
            return Err(Error::PreconditionFailed(
                "no backup window is open".to_string(),
            ));
        };
        let thawed = match window.freeze.take() {
            Some(guard) => guard.release().await,
            None => Ok(()),
        };
        admin.backup_stop(window.major_version).await?;
        thawed?;
        info!("Backup window closed");
        Ok(())
    }

    /// Replace the data directory with the contents of a backup.
    ///
    /// Any failure leaves the instance FAILED.
    pub async fn restore(&self, app: &mut PgApp, info: &BackupInfo) -> Result<()> {
        let result = self.restore_inner(app, info).await;
        if let Err(e) = &result {
            error!(backup_id = %info.id, error = %e, "Restore failed");
            app.status_mut().set_status(ServiceStatus::Failed, true);
        }
        result
    }

    async fn restore_inner(&self, app: &mut PgApp, info: &BackupInfo) -> Result<()> {
        let location = info
            .location
            .clone()
            .ok_or_else(|| Error::InvalidInput(format!("backup {} has no location", info.id)))?;

        let mut env = self.sidecar_env();
        if info.is_encrypted() {
            let key = self
                .config
                .backup_encryption_key
                .as_ref()
                .ok_or(Error::DecryptionKeyMissing)?;
            env.insert("BACKUP_ENCRYPTION_KEY".to_string(), key.clone());
        }

        info!(backup_id = %info.id, location = %location, "Restoring backup");
        app.stop_db(false)
            .await
            .map_err(|e| Error::RestoreFailed(format!("stopping database: {}", e)))?;

        let data_dir = self.config.data_dir();
        let archive_dir = self.config.wal_archive_dir();
        self.clear_dir(&archive_dir).await?;
        self.clear_dir(&data_dir).await?;

        let spec = self.sidecar_spec(RESTORE_CONTAINER, self.restore_command(info, &location), env);
        let output = app
            .supervisor()
            .run_oneshot(&spec)
            .await
            .map_err(|e| Error::RestoreFailed(e.to_string()))?;
        if !output.success {
            return Err(Error::RestoreFailed(failure_tail(&output)));
        }

        let owner = self.config.owner();
        for dir in [&archive_dir, &data_dir] {
            os::chown_recursive(dir, owner)
                .await
                .map_err(|e| Error::RestoreFailed(format!("chown {}: {}", dir.display(), e)))?;
        }
        info!(backup_id = %info.id, "Restore completed");
        Ok(())
    }

    async fn clear_dir(&self, dir: &Path) -> Result<()> {
        os::remove_dir_contents(dir)
            .await
            .map_err(|e| Error::RestoreFailed(format!("clearing {}: {}", dir.display(), e)))?;
        os::ensure_dir(dir, self.config.owner(), MODE_PRIVATE_DIR)
            .await
            .map_err(|e| Error::RestoreFailed(format!("creating {}: {}", dir.display(), e)))
    }
}
