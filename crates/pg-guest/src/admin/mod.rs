// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Administrative client for the engine.
//!
//! [`Admin`] covers the user/database CRUD surface exposed to the control
//! plane plus the handful of engine queries replication and backups need.
//! [`PgAdmin`] talks to the engine over its Unix socket; [`MockAdmin`] keeps
//! everything in memory.

pub mod mock;
pub mod models;
pub mod postgres;
pub mod query;

use async_trait::async_trait;
use serde_json::Value;

pub use mock::MockAdmin;
pub use models::{Lsn, Page, PgDatabase, PgUser, UserAttributes};
pub use postgres::PgAdmin;

use crate::error::Result;

/// Administrative operations against the engine.
#[async_trait]
pub trait Admin: Send + Sync {
    /// Create login roles, granting each its listed databases.
    async fn create_users(&self, users: &[PgUser]) -> Result<()>;

    /// Drop a login role.
    async fn delete_user(&self, user: &PgUser) -> Result<()>;

    /// Sorted, paginated login roles (reserved roles hidden).
    async fn list_users(
        &self,
        limit: Option<usize>,
        marker: Option<&str>,
        include_marker: bool,
    ) -> Result<Page<PgUser>>;

    /// A single role, or `None`.
    async fn get_user(&self, name: &str, host: Option<&str>) -> Result<Option<PgUser>>;

    /// Set new passwords.
    async fn change_passwords(&self, users: &[PgUser]) -> Result<()>;

    /// Rename a role and/or set its password.
    async fn update_attributes(
        &self,
        name: &str,
        host: Option<&str>,
        attrs: &UserAttributes,
    ) -> Result<()>;

    /// Grant access to databases.
    async fn grant_access(&self, name: &str, host: Option<&str>, databases: &[String]) -> Result<()>;

    /// Revoke access to a database.
    async fn revoke_access(&self, name: &str, host: Option<&str>, database: &str) -> Result<()>;

    /// Databases a role can access.
    async fn list_access(&self, name: &str, host: Option<&str>) -> Result<Vec<PgDatabase>>;

    /// Create databases.
    async fn create_databases(&self, databases: &[PgDatabase]) -> Result<()>;

    /// Drop a database.
    async fn delete_database(&self, database: &PgDatabase) -> Result<()>;

    /// Sorted, paginated databases (reserved databases hidden).
    async fn list_databases(
        &self,
        limit: Option<usize>,
        marker: Option<&str>,
        include_marker: bool,
    ) -> Result<Page<PgDatabase>>;

    /// Create or refresh the `root` superuser and return its credentials.
    async fn enable_root(&self, password: Option<&str>) -> Result<PgUser>;

    /// Rotate the `root` password; the role is kept.
    async fn disable_root(&self) -> Result<()>;

    /// Whether a superuser other than the controller's own exists.
    async fn is_root_enabled(&self) -> Result<bool>;

    /// Execute a statement, discarding results.
    async fn psql(&self, statement: &str) -> Result<()>;

    /// Execute a query and return rows as JSON objects.
    async fn query(&self, statement: &str) -> Result<Vec<Value>>;

    /// Whether the engine is in recovery.
    async fn is_replica(&self) -> Result<bool>;

    /// Current write position on a primary.
    async fn current_wal_lsn(&self) -> Result<Lsn>;

    /// Last replayed position on a replica.
    async fn last_replay_lsn(&self) -> Result<Option<Lsn>>;

    /// Ask a replica to leave recovery.
    async fn promote(&self) -> Result<()>;

    /// Enter the base backup window.
    async fn backup_start(&self, label: &str, major_version: u32) -> Result<()>;

    /// Leave the base backup window.
    async fn backup_stop(&self, major_version: u32) -> Result<()>;

    /// Major version of the running engine.
    async fn server_version_major(&self) -> Result<u32>;

    /// Whether a role exists (reserved roles included).
    async fn role_exists(&self, name: &str) -> Result<bool>;

    /// Create the replication role.
    async fn create_replication_role(&self, name: &str, password: &str) -> Result<()>;

    /// Drop a role if it exists.
    async fn drop_role(&self, name: &str) -> Result<()>;

    /// Current value of a run-time setting.
    async fn setting(&self, name: &str) -> Result<Option<String>>;

    /// Signal the engine to re-read its configuration.
    async fn reload_configuration(&self) -> Result<()>;

    /// Drop any cached connection (after a restart).
    async fn reset_connection(&self);
}
