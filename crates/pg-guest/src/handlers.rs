// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! RPC request handling.
//!
//! Requests carry a method name, its arguments and the caller context:
//!
//! ```json
//! {"method": "create_database", "args": {"databases": [{"name": "app"}]},
//!  "context": {"tenant": "t1", "is_admin": false}}
//! ```
//!
//! Every request is answered with `{"ok": true, "result": ...}` or
//! `{"ok": false, "error": {"kind": ..., "message": ...}}`. Requests are
//! executed one at a time while holding the manager lock.

use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::admin::{Lsn, PgDatabase, PgUser, UserAttributes};
use crate::backup::BackupInfo;
use crate::configuration::ConfigDict;
use crate::error::{Error, ErrorKind, Result};
use crate::guest_log::LogAction;
use crate::manager::{Manager, PrepareRequest, SharedManager};
use crate::module_applier::{ModuleDescriptor, ModuleRef};
use crate::replication::{ReplicationSnapshot, SnapshotInfo};

/// Caller identity attached to every request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Context {
    /// Tenant issuing the request
    pub tenant: Option<String>,
    /// Whether the caller has admin rights
    pub is_admin: bool,
}

/// A request as received from the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Operation name
    pub method: String,
    /// Operation arguments
    #[serde(default)]
    pub args: Value,
    /// Caller context
    #[serde(default)]
    pub context: Context,
}

impl RpcRequest {
    /// Request with default context.
    pub fn new(method: impl Into<String>, args: Value) -> Self {
        Self {
            method: method.into(),
            args,
            context: Context::default(),
        }
    }

    /// Attach a caller context.
    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }
}

/// Error payload of a failed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    /// Error classification
    pub kind: ErrorKind,
    /// Human readable message
    pub message: String,
}

/// Reply to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Whether the operation succeeded
    pub ok: bool,
    /// Operation result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    /// Successful reply.
    pub fn success(result: Value) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    /// Failed reply.
    pub fn failure(err: &Error) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(RpcError {
                kind: err.kind(),
                message: err.to_string(),
            }),
        }
    }
}

// ---- Argument types ----

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StopDbArgs {
    do_not_start_on_reboot: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StartDbWithConfChangesArgs {
    config_contents: Option<String>,
    ds_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResetConfigurationArgs {
    config_contents: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OverridesArgs {
    overrides: ConfigDict,
    remove: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RebuildArgs {
    ds_version: Option<String>,
    config_contents: Option<String>,
    overrides: Option<ConfigDict>,
}

#[derive(Debug, Deserialize)]
struct CreateBackupArgs {
    backup_info: BackupInfo,
}

#[derive(Debug, Deserialize)]
struct PerformRestoreArgs {
    #[serde(default)]
    restore_location: Option<String>,
    backup_info: BackupInfo,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ReplicationSnapshotArgs {
    snapshot_info: SnapshotInfo,
    replica_config: Option<ConfigDict>,
}

#[derive(Debug, Deserialize)]
struct AttachReplicaArgs {
    snapshot: ReplicationSnapshot,
    #[serde(default)]
    replica_config: Option<ConfigDict>,
    #[serde(default = "default_true")]
    restart: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DetachReplicaArgs {
    for_failover: bool,
}

#[derive(Debug, Deserialize)]
struct WaitForTxnArgs {
    txn: Lsn,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MakeReadOnlyArgs {
    read_only: bool,
}

#[derive(Debug, Deserialize)]
struct UsersArgs {
    users: Vec<PgUser>,
}

#[derive(Debug, Deserialize)]
struct UserArgs {
    user: PgUser,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ListArgs {
    limit: Option<usize>,
    marker: Option<String>,
    include_marker: bool,
}

#[derive(Debug, Deserialize)]
struct UserRefArgs {
    username: String,
    #[serde(default)]
    hostname: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateAttributesArgs {
    username: String,
    #[serde(default)]
    hostname: Option<String>,
    user_attrs: UserAttributes,
}

#[derive(Debug, Deserialize)]
struct GrantAccessArgs {
    username: String,
    #[serde(default)]
    hostname: Option<String>,
    databases: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RevokeAccessArgs {
    username: String,
    #[serde(default)]
    hostname: Option<String>,
    database: String,
}

#[derive(Debug, Deserialize)]
struct DatabasesArgs {
    databases: Vec<PgDatabase>,
}

#[derive(Debug, Deserialize)]
struct DatabaseArgs {
    database: PgDatabase,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EnableRootArgs {
    root_password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModuleApplyArgs {
    modules: Vec<ModuleDescriptor>,
}

#[derive(Debug, Deserialize)]
struct ModuleRemoveArgs {
    module: ModuleRef,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ModuleListArgs {
    include_contents: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VolumeArgs {
    device_path: Option<String>,
    mount_point: Option<PathBuf>,
}

impl VolumeArgs {
    fn device(&self) -> Result<&str> {
        self.device_path
            .as_deref()
            .ok_or_else(|| Error::InvalidInput("device_path is required".to_string()))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FilesystemStatsArgs {
    fs_path: Option<PathBuf>,
}

/// Decode the arguments of a method; absent arguments decode as `{}`.
fn args<T: DeserializeOwned>(raw: Value) -> Result<T> {
    let raw = if raw.is_null() {
        Value::Object(Default::default())
    } else {
        raw
    };
    serde_json::from_value(raw).map_err(|e| Error::InvalidInput(format!("invalid arguments: {}", e)))
}

fn to_value<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

/// Run one request against the manager and build the reply.
pub async fn handle_request(manager: &SharedManager, request: RpcRequest) -> RpcResponse {
    let method = request.method.clone();
    debug!(method = %method, tenant = ?request.context.tenant, "Handling request");

    let mut manager = manager.lock().await;
    match dispatch(&mut manager, request).await {
        Ok(result) => RpcResponse::success(result),
        Err(e) => {
            warn!(method = %method, kind = ?e.kind(), error = %e, "Request failed");
            RpcResponse::failure(&e)
        }
    }
}

/// Route a request to the matching manager operation.
pub async fn dispatch(manager: &mut Manager, request: RpcRequest) -> Result<Value> {
    let RpcRequest {
        method,
        args: raw,
        context,
    } = request;
    let is_admin = context.is_admin;

    match method.as_str() {
        // Lifecycle
        "prepare" => {
            let request: PrepareRequest = args(raw)?;
            manager.prepare(request).await?;
            Ok(Value::Null)
        }
        "restart" => {
            manager.restart().await?;
            Ok(Value::Null)
        }
        "stop_db" => {
            let a: StopDbArgs = args(raw)?;
            manager.stop_db(a.do_not_start_on_reboot).await?;
            Ok(Value::Null)
        }
        "start_db_with_conf_changes" => {
            let a: StartDbWithConfChangesArgs = args(raw)?;
            manager
                .start_db_with_conf_changes(a.config_contents.as_deref(), a.ds_version)
                .await?;
            Ok(Value::Null)
        }
        "reset_configuration" => {
            let a: ResetConfigurationArgs = args(raw)?;
            manager.reset_configuration(&a.config_contents).await?;
            Ok(Value::Null)
        }
        "update_overrides" => {
            let a: OverridesArgs = args(raw)?;
            manager.update_overrides(&a.overrides, a.remove).await?;
            Ok(Value::Null)
        }
        "apply_overrides" => {
            let a: OverridesArgs = args(raw)?;
            manager.apply_overrides(&a.overrides).await?;
            Ok(Value::Null)
        }
        "rebuild" => {
            let a: RebuildArgs = args(raw)?;
            manager
                .rebuild(a.ds_version, a.config_contents.as_deref(), a.overrides.as_ref())
                .await?;
            Ok(Value::Null)
        }
        "update_status" => {
            manager.update_status().await;
            to_value(manager.get_service_status())
        }
        "get_service_status" => to_value(manager.get_service_status()),

        // Backup and restore
        "create_backup" => {
            let a: CreateBackupArgs = args(raw)?;
            to_value(manager.create_backup(&a.backup_info).await?)
        }
        "perform_restore" => {
            let a: PerformRestoreArgs = args(raw)?;
            manager
                .perform_restore(a.restore_location, a.backup_info)
                .await?;
            Ok(Value::Null)
        }
        "pre_create_backup" => to_value(manager.pre_create_backup().await?),
        "post_create_backup" => {
            manager.post_create_backup().await?;
            Ok(Value::Null)
        }

        // Replication
        "get_replication_snapshot" => {
            let a: ReplicationSnapshotArgs = args(raw)?;
            to_value(
                manager
                    .get_replication_snapshot(&a.snapshot_info, a.replica_config.as_ref())
                    .await?,
            )
        }
        "attach_replica" => {
            let a: AttachReplicaArgs = args(raw)?;
            manager
                .attach_replica(&a.snapshot, a.replica_config.as_ref(), a.restart)
                .await?;
            Ok(Value::Null)
        }
        "detach_replica" => {
            let a: DetachReplicaArgs = args(raw)?;
            manager.detach_replica(a.for_failover).await?;
            Ok(Value::Null)
        }
        "demote_replication_master" => {
            manager.demote_replication_master().await?;
            Ok(Value::Null)
        }
        "get_latest_txn_id" => to_value(manager.get_latest_txn_id().await?),
        "wait_for_txn" => {
            let a: WaitForTxnArgs = args(raw)?;
            manager.wait_for_txn(a.txn).await?;
            Ok(Value::Null)
        }
        "make_read_only" => {
            let a: MakeReadOnlyArgs = args(raw)?;
            manager.make_read_only(a.read_only).await?;
            Ok(Value::Null)
        }

        // Users and databases
        "create_user" => {
            let a: UsersArgs = args(raw)?;
            manager.create_user(&a.users).await?;
            Ok(Value::Null)
        }
        "delete_user" => {
            let a: UserArgs = args(raw)?;
            manager.delete_user(&a.user).await?;
            Ok(Value::Null)
        }
        "list_users" => {
            let a: ListArgs = args(raw)?;
            to_value(
                manager
                    .list_users(a.limit, a.marker.as_deref(), a.include_marker)
                    .await?,
            )
        }
        "get_user" => {
            let a: UserRefArgs = args(raw)?;
            to_value(
                manager
                    .get_user(&a.username, a.hostname.as_deref())
                    .await?,
            )
        }
        "change_passwords" => {
            let a: UsersArgs = args(raw)?;
            manager.change_passwords(&a.users).await?;
            Ok(Value::Null)
        }
        "update_attributes" => {
            let a: UpdateAttributesArgs = args(raw)?;
            manager
                .update_attributes(&a.username, a.hostname.as_deref(), &a.user_attrs)
                .await?;
            Ok(Value::Null)
        }
        "grant_access" => {
            let a: GrantAccessArgs = args(raw)?;
            manager
                .grant_access(&a.username, a.hostname.as_deref(), &a.databases)
                .await?;
            Ok(Value::Null)
        }
        "revoke_access" => {
            let a: RevokeAccessArgs = args(raw)?;
            manager
                .revoke_access(&a.username, a.hostname.as_deref(), &a.database)
                .await?;
            Ok(Value::Null)
        }
        "list_access" => {
            let a: UserRefArgs = args(raw)?;
            to_value(
                manager
                    .list_access(&a.username, a.hostname.as_deref())
                    .await?,
            )
        }
        "create_database" => {
            let a: DatabasesArgs = args(raw)?;
            manager.create_database(&a.databases).await?;
            Ok(Value::Null)
        }
        "delete_database" => {
            let a: DatabaseArgs = args(raw)?;
            manager.delete_database(&a.database).await?;
            Ok(Value::Null)
        }
        "list_databases" => {
            let a: ListArgs = args(raw)?;
            to_value(
                manager
                    .list_databases(a.limit, a.marker.as_deref(), a.include_marker)
                    .await?,
            )
        }
        "enable_root" => {
            let a: EnableRootArgs = args(raw)?;
            to_value(manager.enable_root(a.root_password.as_deref()).await?)
        }
        "disable_root" => {
            manager.disable_root().await?;
            Ok(Value::Null)
        }
        "is_root_enabled" => to_value(manager.is_root_enabled().await?),

        // Logs and modules
        "guest_log_list" => to_value(manager.guest_log_list(is_admin).await?),
        "guest_log_action" => {
            let a: LogAction = args(raw)?;
            to_value(manager.guest_log_action(&a, is_admin).await?)
        }
        "module_apply" => {
            let a: ModuleApplyArgs = args(raw)?;
            to_value(manager.module_apply(&a.modules, is_admin).await?)
        }
        "module_remove" => {
            let a: ModuleRemoveArgs = args(raw)?;
            manager.module_remove(&a.module, is_admin).await?;
            Ok(Value::Null)
        }
        "module_list" => {
            let a: ModuleListArgs = args(raw)?;
            to_value(manager.module_list(a.include_contents, is_admin).await?)
        }

        // Volume
        "mount_volume" => {
            let a: VolumeArgs = args(raw)?;
            manager
                .mount_volume(a.device()?, a.mount_point.as_deref())
                .await?;
            Ok(Value::Null)
        }
        "unmount_volume" => {
            let a: VolumeArgs = args(raw)?;
            manager.unmount_volume(a.mount_point.as_deref()).await?;
            Ok(Value::Null)
        }
        "resize_fs" => {
            let a: VolumeArgs = args(raw)?;
            manager
                .resize_fs(a.device()?, a.mount_point.as_deref())
                .await?;
            Ok(Value::Null)
        }
        "get_filesystem_stats" => {
            let a: FilesystemStatsArgs = args(raw)?;
            to_value(manager.get_filesystem_stats(a.fs_path.as_deref())?)
        }
        "cleanup_wal_archive" => to_value(manager.cleanup_wal_archive().await),

        other => {
            info!(method = other, "Unknown method");
            Err(Error::NotSupported(format!("unknown method '{}'", other)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_defaults() {
        let request: RpcRequest = serde_json::from_value(json!({"method": "restart"})).unwrap();
        assert_eq!(request.method, "restart");
        assert!(request.args.is_null());
        assert!(!request.context.is_admin);
    }

    #[test]
    fn test_null_args_decode_as_empty_object() {
        let a: StopDbArgs = args(Value::Null).unwrap();
        assert!(!a.do_not_start_on_reboot);
        let a: AttachReplicaArgs = args(json!({
            "snapshot": {
                "snapshot_id": "s1",
                "datastore_manager": "postgresql",
                "backup": {},
                "master": {"host": "10.0.0.1", "port": 5432},
                "replication_user": {"name": "replicator", "password": "pw"}
            }
        }))
        .unwrap();
        assert!(a.restart);
    }

    #[test]
    fn test_bad_args_are_invalid_input() {
        let err = args::<UsersArgs>(json!({"users": "nope"})).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_failure_response_shape() {
        let response = RpcResponse::failure(&Error::UserNotFound("u9".into()));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["ok"], json!(false));
        assert_eq!(json["error"]["kind"], json!("not_found"));
        assert!(json.get("result").is_none());
    }
}
