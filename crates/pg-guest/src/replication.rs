// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Streaming replication: primary setup, replica attach, promote and rewind.
//!
//! The replication password lives in `<datadir>/.replpass`. It is the only
//! record of the credential after a failover, so an existing role without
//! that file is dropped and recreated with a fresh password.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::admin::{Admin, Lsn};
use crate::app::{CONTAINER_DATA_DIR, CONTAINER_MOUNT, CONTAINER_RUN_DIR, PgApp};
use crate::backup::{BackupInfo, BackupManager, BackupResult};
use crate::config::{Config, DATASTORE_MANAGER};
use crate::configuration::ConfigurationManager;
use crate::error::{Error, Result};
use crate::hba::{HbaRule, HbaRuleset};
use crate::os::{self, MODE_PRIVATE_DIR, PASSWORD_LENGTH};
use crate::poll::{PollOutcome, poll_until};
use crate::supervisor::{OneshotSpec, VolumeMount};

/// Change-id of the system override carrying `primary_conninfo`.
pub const REPLICATION_CHANGE_ID: &str = "replication";
/// Replication password file name inside the data directory.
pub const REPLICATION_PASSWORD_FILE: &str = ".replpass";
/// Standby marker file name inside the data directory.
pub const STANDBY_SIGNAL_FILE: &str = "standby.signal";
/// Sidecar container name for `pg_rewind`.
pub const REWIND_CONTAINER: &str = "pg_rewind";

/// Credentials of the replication role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationUser {
    /// Role name
    pub name: String,
    /// Role password
    pub password: String,
}

/// Where replicas connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterRef {
    /// Primary address
    pub host: String,
    /// Primary port
    pub port: u16,
}

/// Request for a replication snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    /// Snapshot (backup) id
    pub id: String,
    /// Address replicas should use; defaults to the configured advertise address
    #[serde(default)]
    pub master_host: Option<String>,
}

/// Everything a replica needs to attach to this primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationSnapshot {
    /// Snapshot id
    pub snapshot_id: String,
    /// Datastore manager
    pub datastore_manager: String,
    /// Base backup taken for the replica
    pub backup: BackupResult,
    /// Primary address
    pub master: MasterRef,
    /// Replication credentials
    pub replication_user: ReplicationUser,
}

impl ReplicationSnapshot {
    /// Backup descriptor a replica restores from.
    pub fn backup_info(&self) -> BackupInfo {
        BackupInfo {
            id: self.snapshot_id.clone(),
            location: self.backup.location.clone(),
            checksum: self.backup.checksum.clone(),
            ..Default::default()
        }
    }
}

/// Quote a `primary_conninfo` value.
fn conninfo_value(value: &str) -> String {
    if !value.is_empty() && value.chars().all(|c| c.is_ascii_alphanumeric() || "._-".contains(c)) {
        return value.to_string();
    }
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Connection string a replica uses to stream from `master`.
pub fn primary_conninfo(master: &MasterRef, user: &ReplicationUser) -> String {
    format!(
        "host={} port={} dbname=postgres user={} password={}",
        conninfo_value(&master.host),
        master.port,
        conninfo_value(&user.name),
        conninfo_value(&user.password)
    )
}

/// Drives the replication lifecycle of this node.
pub struct ReplicationCoordinator {
    config: Arc<Config>,
}

impl ReplicationCoordinator {
    /// Create a coordinator.
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Path of the replication password file.
    pub fn password_file(&self) -> PathBuf {
        self.config.data_dir().join(REPLICATION_PASSWORD_FILE)
    }

    /// Path of the standby marker.
    pub fn standby_signal(&self) -> PathBuf {
        self.config.data_dir().join(STANDBY_SIGNAL_FILE)
    }

    /// Stored replication password, if any.
    pub async fn read_password(&self) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.password_file()).await {
            Ok(text) => Ok(Some(text.trim().to_string()).filter(|p| !p.is_empty())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_role(&self, admin: &dyn Admin) -> Result<String> {
        let password = os::generate_password(PASSWORD_LENGTH);
        os::write_atomic(
            &self.password_file(),
            password.as_bytes(),
            self.config.owner(),
            MODE_PRIVATE_DIR,
        )
        .await?;
        admin
            .create_replication_role(&self.config.replication_user, &password)
            .await?;
        info!(role = %self.config.replication_user, "Replication role created");
        Ok(password)
    }

    /// Ensure the replication role and its password file exist.
    pub async fn ensure_replication_user(&self, admin: &dyn Admin) -> Result<ReplicationUser> {
        let name = self.config.replication_user.clone();
        let exists = admin.role_exists(&name).await?;
        let stored = self.read_password().await?;
        let password = match (exists, stored) {
            (true, Some(password)) => password,
            (true, None) => {
                warn!(role = %name, "Replication role has no stored password, recreating");
                admin.drop_role(&name).await?;
                self.create_role(admin).await?
            }
            (false, _) => self.create_role(admin).await?,
        };
        Ok(ReplicationUser { name, password })
    }

    /// Let the replication role connect from anywhere with a password.
    pub async fn allow_replication_access(&self) -> Result<bool> {
        let path = self.config.hba_file();
        let mut ruleset = HbaRuleset::load(&path).await?;
        let added = ruleset.append_once(HbaRule::replication(&self.config.replication_user));
        if added {
            ruleset.write(&path, self.config.owner()).await?;
        }
        Ok(added)
    }

    /// Turn this node into a replication source.
    pub async fn enable_as_master(&self, app: &mut PgApp, admin: &dyn Admin) -> Result<ReplicationUser> {
        let user = self.ensure_replication_user(admin).await?;
        self.allow_replication_access().await?;
        app.restart().await?;
        admin.reset_connection().await;
        info!("Enabled as replication source");
        Ok(user)
    }

    /// Prepare this node as a source and take the base backup a replica restores from.
    pub async fn get_replication_snapshot(
        &self,
        app: &mut PgApp,
        admin: &dyn Admin,
        backups: &mut BackupManager,
        snapshot: &SnapshotInfo,
    ) -> Result<ReplicationSnapshot> {
        let host = snapshot
            .master_host
            .clone()
            .or_else(|| self.config.advertise_address.clone())
            .ok_or_else(|| Error::InvalidInput("no address to advertise to replicas".to_string()))?;

        let replication_user = self.enable_as_master(app, admin).await?;
        let backup_info = BackupInfo {
            id: snapshot.id.clone(),
            backup_type: Some("replication".to_string()),
            ..Default::default()
        };
        let backup = backups.create_backup(app, admin, &backup_info).await?;

        Ok(ReplicationSnapshot {
            snapshot_id: snapshot.id.clone(),
            datastore_manager: DATASTORE_MANAGER.to_string(),
            backup,
            master: MasterRef {
                host,
                port: self.config.port,
            },
            replication_user,
        })
    }

    /// Configure this node to stream from the snapshot's primary.
    ///
    /// The data directory must already hold the primary's base backup.
    pub async fn enable_as_slave(
        &self,
        configuration: &ConfigurationManager,
        snapshot: &ReplicationSnapshot,
    ) -> Result<()> {
        os::touch(&self.standby_signal(), self.config.owner()).await?;
        let mut kv = Map::new();
        kv.insert(
            "primary_conninfo".to_string(),
            Value::String(primary_conninfo(&snapshot.master, &snapshot.replication_user)),
        );
        configuration
            .apply_system_override(&kv, Some(REPLICATION_CHANGE_ID))
            .await?;
        info!(primary = %snapshot.master.host, "Enabled as replica");
        Ok(())
    }

    /// Promote this replica to a primary.
    pub async fn detach_slave(
        &self,
        admin: &dyn Admin,
        configuration: &ConfigurationManager,
    ) -> Result<()> {
        if admin.is_replica().await? {
            admin.promote().await?;
            let outcome = poll_until(
                move || async move { matches!(admin.is_replica().await, Ok(false)).then_some(()) },
                self.config.state_change_poll_interval,
                self.config.replication_timeout,
            )
            .await;
            if outcome.timed_out() {
                return Err(Error::PromoteTimeout);
            }
        } else {
            info!("Not a replica, nothing to promote");
        }
        configuration
            .remove_system_override(Some(REPLICATION_CHANGE_ID))
            .await?;
        match tokio::fs::remove_file(self.standby_signal()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!("Promoted to primary");
        Ok(())
    }

    /// Sidecar running `pg_rewind` against the configured primary.
    pub fn rewind_spec(&self, app: &PgApp, conninfo: &str) -> OneshotSpec {
        OneshotSpec {
            name: REWIND_CONTAINER.to_string(),
            image: app.image(),
            command: vec![
                "pg_rewind".to_string(),
                format!("--target-pgdata={}", CONTAINER_DATA_DIR),
                format!("--source-server={}", conninfo),
                "--progress".to_string(),
            ],
            env: Default::default(),
            volumes: vec![
                VolumeMount::rw(self.config.mount_point.join("data"), &format!("{}/data", CONTAINER_MOUNT)),
                VolumeMount::ro(&self.config.run_dir, CONTAINER_RUN_DIR),
            ],
            user: Some(self.config.owner()),
            timeout: None,
        }
    }

    /// Turn a former primary into a replica of the new primary.
    pub async fn demote_master(
        &self,
        app: &mut PgApp,
        admin: &dyn Admin,
        configuration: &ConfigurationManager,
    ) -> Result<()> {
        let conninfo = configuration
            .get_value("primary_conninfo", None)
            .await?
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| Error::PreconditionFailed("no primary_conninfo configured".to_string()))?;

        app.stop_db(true).await?;
        admin.reset_connection().await;

        if let Err(e) = app.supervisor().remove(REWIND_CONTAINER).await {
            warn!(error = %e, "Failed to remove stale rewind container");
        }
        let output = app.supervisor().run_oneshot(&self.rewind_spec(app, &conninfo)).await?;
        if !output.success {
            let start = output.lines.len().saturating_sub(5);
            return Err(Error::Other(format!(
                "pg_rewind failed: {}",
                output.lines[start..].join("\n")
            )));
        }

        os::touch(&self.standby_signal(), self.config.owner()).await?;
        app.start_db(true).await?;
        info!("Demoted to replica");
        Ok(())
    }

    /// Replay position on a replica, write position on a primary.
    pub async fn get_latest_txn_id(&self, admin: &dyn Admin) -> Result<Lsn> {
        if admin.is_replica().await? {
            match admin.last_replay_lsn().await? {
                Some(lsn) => Ok(lsn),
                None => Ok(Lsn::default()),
            }
        } else {
            admin.current_wal_lsn().await
        }
    }

    /// Wait until this replica has replayed `lsn`.
    pub async fn wait_for_txn(&self, admin: &dyn Admin, lsn: Lsn) -> Result<()> {
        if !admin.is_replica().await? {
            return Err(Error::PreconditionFailed(
                "wait_for_txn requires a replica".to_string(),
            ));
        }
        let outcome = poll_until(
            move || async move {
                match admin.last_replay_lsn().await {
                    Ok(Some(replayed)) if replayed >= lsn => Some(replayed),
                    _ => None,
                }
            },
            self.config.state_change_poll_interval,
            self.config.replication_timeout,
        )
        .await;
        match outcome {
            PollOutcome::Ready(replayed) => {
                info!(target = %lsn, replayed = %replayed, "Replica caught up");
                Ok(())
            }
            PollOutcome::TimedOut => Err(Error::PollTimeout(format!("replay of {}", lsn))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_conninfo_quotes_when_needed() {
        let master = MasterRef {
            host: "10.0.0.5".into(),
            port: 5432,
        };
        let user = ReplicationUser {
            name: "replicator".into(),
            password: "it's secret".into(),
        };
        assert_eq!(
            primary_conninfo(&master, &user),
            "host=10.0.0.5 port=5432 dbname=postgres user=replicator password='it\\'s secret'"
        );
    }

    #[test]
    fn test_snapshot_backup_info() {
        let snapshot = ReplicationSnapshot {
            snapshot_id: "snap".into(),
            datastore_manager: DATASTORE_MANAGER.into(),
            backup: BackupResult {
                location: Some("swift://backups/snap.gz".into()),
                checksum: Some("abc".into()),
                size: None,
            },
            master: MasterRef {
                host: "a".into(),
                port: 5432,
            },
            replication_user: ReplicationUser {
                name: "replicator".into(),
                password: "pw".into(),
            },
        };
        let info = snapshot.backup_info();
        assert_eq!(info.id, "snap");
        assert_eq!(info.location.as_deref(), Some("swift://backups/snap.gz"));
    }
}
