// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! sqlx-backed admin client.
//!
//! Holds a lazy pool of one connection over the engine's Unix socket. Local
//! socket connections are trusted for the admin role by the client-auth
//! ruleset, so the ruleset never has to be loosened for the controller
//! itself. A broken connection is discarded by the pool and reopened on
//! next use.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::Postgres;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::models::{
    self, Lsn, Page, PgDatabase, PgUser, ROOT_USER, UserAttributes, check_database_name,
    check_user_name, paginate,
};
use super::query;
use super::Admin;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::os::{self, PASSWORD_LENGTH};

/// How long a query waits for the admin connection.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Admin client over the engine's Unix socket.
pub struct PgAdmin {
    options: PgConnectOptions,
    admin_user: String,
    replication_user: String,
    pool: RwLock<PgPool>,
}

fn lazy_pool(options: &PgConnectOptions) -> PgPool {
    PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect_lazy_with(options.clone())
}

impl PgAdmin {
    /// Create a client connecting through the socket in `socket_dir`.
    pub fn new(
        socket_dir: &Path,
        port: u16,
        admin_user: &str,
        password: Option<&str>,
        replication_user: &str,
    ) -> Self {
        let mut options = PgConnectOptions::new()
            .socket(socket_dir)
            .port(port)
            .username(admin_user)
            .database("postgres")
            .application_name("pg-guest");
        if let Some(password) = password {
            options = options.password(password);
        }
        Self {
            pool: RwLock::new(lazy_pool(&options)),
            options,
            admin_user: admin_user.to_string(),
            replication_user: replication_user.to_string(),
        }
    }

    /// Create a client from the controller configuration.
    pub fn from_config(config: &Config, password: Option<&str>) -> Self {
        Self::new(
            &config.run_dir,
            config.port,
            &config.admin_user,
            password,
            &config.replication_user,
        )
    }

    async fn pool(&self) -> PgPool {
        self.pool.read().await.clone()
    }

    /// Report transport failures as an unavailable engine.
    fn settle<T>(result: std::result::Result<T, sqlx::Error>) -> Result<T> {
        result.map_err(|e| match e {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                Error::Unavailable(format!("cannot reach database: {}", e))
            }
            other => other.into(),
        })
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        let pool = self.pool().await;
        Self::settle(sqlx::raw_sql(sql).execute(&pool).await).map(|_| ())
    }

    async fn fetch_strings(&self, sql: &str, binds: &[&str]) -> Result<Vec<String>> {
        let pool = self.pool().await;
        let mut q = sqlx::query_scalar::<Postgres, String>(sql);
        for bind in binds {
            q = q.bind(bind.to_string());
        }
        Self::settle(q.fetch_all(&pool).await)
    }

    async fn fetch_optional_string(&self, sql: &str, binds: &[&str]) -> Result<Option<String>> {
        let pool = self.pool().await;
        let mut q = sqlx::query_scalar::<Postgres, Option<String>>(sql);
        for bind in binds {
            q = q.bind(bind.to_string());
        }
        Self::settle(q.fetch_optional(&pool).await).map(Option::flatten)
    }

    async fn fetch_bool(&self, sql: &str, binds: &[&str]) -> Result<bool> {
        let pool = self.pool().await;
        let mut q = sqlx::query_scalar::<Postgres, bool>(sql);
        for bind in binds {
            q = q.bind(bind.to_string());
        }
        Self::settle(q.fetch_one(&pool).await)
    }

    async fn database_exists(&self, name: &str) -> Result<bool> {
        self.fetch_bool(query::DATABASE_EXISTS, &[name]).await
    }

    async fn require_user(&self, name: &str) -> Result<()> {
        check_user_name(name)?;
        if !self.role_exists(name).await? {
            return Err(Error::UserNotFound(name.to_string()));
        }
        Ok(())
    }

    async fn require_database(&self, name: &str) -> Result<()> {
        check_database_name(name)?;
        if !self.database_exists(name).await? {
            return Err(Error::DatabaseNotFound(name.to_string()));
        }
        Ok(())
    }

    fn is_hidden_user(&self, name: &str) -> bool {
        models::is_reserved_user(name) || name == self.admin_user || name == self.replication_user
    }
}

#[async_trait]
impl Admin for PgAdmin {
    async fn create_users(&self, users: &[PgUser]) -> Result<()> {
        for user in users {
            check_user_name(&user.name)?;
            if self.role_exists(&user.name).await? {
                return Err(Error::AlreadyExists(user.name.clone()));
            }
            self.execute(&query::create_user(&user.name, user.password.as_deref()))
                .await?;
            info!(user = %user.name, "Created user");
            let databases: Vec<String> = user.databases.iter().map(|d| d.name.clone()).collect();
            if !databases.is_empty() {
                self.grant_access(&user.name, user.host.as_deref(), &databases)
                    .await?;
            }
        }
        Ok(())
    }

    async fn delete_user(&self, user: &PgUser) -> Result<()> {
        self.require_user(&user.name).await?;
        for database in self.list_access(&user.name, None).await? {
            self.execute(&query::revoke_database(&database.name, &user.name))
                .await?;
        }
        self.execute(&query::drop_user(&user.name)).await?;
        info!(user = %user.name, "Deleted user");
        Ok(())
    }

    async fn list_users(
        &self,
        limit: Option<usize>,
        marker: Option<&str>,
        include_marker: bool,
    ) -> Result<Page<PgUser>> {
        let users: Vec<PgUser> = self
            .fetch_strings(query::LIST_USERS, &[])
            .await?
            .into_iter()
            .filter(|name| !self.is_hidden_user(name))
            .map(PgUser::named)
            .collect();
        let mut page = paginate(users, limit, marker, include_marker);
        for user in &mut page.items {
            user.databases = self.list_access(&user.name, None).await?;
        }
        Ok(page)
    }

    async fn get_user(&self, name: &str, _host: Option<&str>) -> Result<Option<PgUser>> {
        if self.is_hidden_user(name) || !self.role_exists(name).await? {
            return Ok(None);
        }
        let mut user = PgUser::named(name);
        user.databases = self.list_access(name, None).await?;
        Ok(Some(user))
    }

    async fn change_passwords(&self, users: &[PgUser]) -> Result<()> {
        for user in users {
            self.require_user(&user.name).await?;
            let password = user.password.as_deref().ok_or_else(|| {
                Error::InvalidInput(format!("no password given for '{}'", user.name))
            })?;
            self.execute(&query::alter_password(&user.name, password))
                .await?;
            info!(user = %user.name, "Changed password");
        }
        Ok(())
    }

    async fn update_attributes(
        &self,
        name: &str,
        _host: Option<&str>,
        attrs: &UserAttributes,
    ) -> Result<()> {
        self.require_user(name).await?;
        let mut current = name.to_string();
        if let Some(new_name) = attrs.name.as_deref()
            && new_name != name
        {
            check_user_name(new_name)?;
            if self.role_exists(new_name).await? {
                return Err(Error::AlreadyExists(new_name.to_string()));
            }
            self.execute(&query::rename_user(name, new_name)).await?;
            info!(from = name, to = new_name, "Renamed user");
            current = new_name.to_string();
        }
        if let Some(password) = attrs.password.as_deref() {
            self.execute(&query::alter_password(&current, password))
                .await?;
        }
        Ok(())
    }

    async fn grant_access(&self, name: &str, _host: Option<&str>, databases: &[String]) -> Result<()> {
        self.require_user(name).await?;
        for database in databases {
            self.require_database(database).await?;
            self.execute(&query::grant_database(database, name)).await?;
            debug!(user = name, database = %database, "Granted access");
        }
        Ok(())
    }

    async fn revoke_access(&self, name: &str, _host: Option<&str>, database: &str) -> Result<()> {
        self.require_user(name).await?;
        self.require_database(database).await?;
        self.execute(&query::revoke_database(database, name)).await
    }

    async fn list_access(&self, name: &str, _host: Option<&str>) -> Result<Vec<PgDatabase>> {
        if !self.role_exists(name).await? {
            return Err(Error::UserNotFound(name.to_string()));
        }
        let mut names = self.fetch_strings(query::LIST_ACCESS, &[name]).await?;
        names.retain(|db| !models::is_reserved_database(db));
        names.sort();
        Ok(names.into_iter().map(PgDatabase::named).collect())
    }

    async fn create_databases(&self, databases: &[PgDatabase]) -> Result<()> {
        for database in databases {
            check_database_name(&database.name)?;
            if self.database_exists(&database.name).await? {
                return Err(Error::AlreadyExists(database.name.clone()));
            }
            self.execute(&query::create_database(database)).await?;
            info!(database = %database.name, "Created database");
        }
        Ok(())
    }

    async fn delete_database(&self, database: &PgDatabase) -> Result<()> {
        self.require_database(&database.name).await?;
        self.execute(&query::drop_database(&database.name)).await?;
        info!(database = %database.name, "Deleted database");
        Ok(())
    }

    async fn list_databases(
        &self,
        limit: Option<usize>,
        marker: Option<&str>,
        include_marker: bool,
    ) -> Result<Page<PgDatabase>> {
        let pool = self.pool().await;
        let rows = Self::settle(
            sqlx::query_as::<Postgres, (String, Option<String>, Option<String>)>(
                query::LIST_DATABASES,
            )
            .fetch_all(&pool)
            .await,
        )?;
        let databases = rows
            .into_iter()
            .filter(|(name, _, _)| !models::is_reserved_database(name))
            .map(|(name, character_set, collate)| PgDatabase {
                name,
                character_set,
                collate,
            })
            .collect();
        Ok(paginate(databases, limit, marker, include_marker))
    }

    async fn enable_root(&self, password: Option<&str>) -> Result<PgUser> {
        let password = password
            .map(str::to_string)
            .unwrap_or_else(|| os::generate_password(PASSWORD_LENGTH));
        if !self.role_exists(ROOT_USER).await? {
            self.execute(&query::create_role(ROOT_USER)).await?;
        }
        self.execute(&query::alter_root(ROOT_USER, &password)).await?;
        info!("Root enabled");
        Ok(PgUser {
            name: ROOT_USER.to_string(),
            password: Some(password),
            host: None,
            databases: Vec::new(),
        })
    }

    async fn disable_root(&self) -> Result<()> {
        self.enable_root(None).await?;
        info!("Root password rotated");
        Ok(())
    }

    async fn is_root_enabled(&self) -> Result<bool> {
        let superusers = self
            .fetch_strings(query::OTHER_SUPERUSERS, &[&self.admin_user])
            .await?;
        Ok(superusers
            .iter()
            .any(|name| name != "postgres" && *name != self.replication_user))
    }

    async fn psql(&self, statement: &str) -> Result<()> {
        self.execute(statement).await
    }

    async fn query(&self, statement: &str) -> Result<Vec<Value>> {
        self.fetch_strings(&query::rows_as_json(statement), &[])
            .await?
            .iter()
            .map(|row| serde_json::from_str(row).map_err(Error::from))
            .collect()
    }

    async fn is_replica(&self) -> Result<bool> {
        self.fetch_bool("SELECT pg_is_in_recovery()", &[]).await
    }

    async fn current_wal_lsn(&self) -> Result<Lsn> {
        self.fetch_optional_string("SELECT pg_current_wal_lsn()::text", &[])
            .await?
            .ok_or_else(|| Error::PreconditionFailed("no current WAL position".to_string()))?
            .parse()
    }

    async fn last_replay_lsn(&self) -> Result<Option<Lsn>> {
        self.fetch_optional_string("SELECT pg_last_wal_replay_lsn()::text", &[])
            .await?
            .map(|lsn| lsn.parse())
            .transpose()
    }

    async fn promote(&self) -> Result<()> {
        if !self.fetch_bool("SELECT pg_promote(false)", &[]).await? {
            return Err(Error::Other("promote request was not accepted".to_string()));
        }
        Ok(())
    }

    async fn backup_start(&self, label: &str, major_version: u32) -> Result<()> {
        self.execute(&query::backup_start(label, major_version))
            .await
    }

    async fn backup_stop(&self, major_version: u32) -> Result<()> {
        let lsn = self
            .fetch_optional_string(query::backup_stop(major_version), &[])
            .await?;
        debug!(lsn = ?lsn, "Backup window closed");
        Ok(())
    }

    async fn server_version_major(&self) -> Result<u32> {
        let raw = self
            .fetch_optional_string("SELECT current_setting('server_version_num')", &[])
            .await?
            .unwrap_or_default();
        raw.trim()
            .parse::<u32>()
            .map(|num| num / 10_000)
            .map_err(|_| Error::Other(format!("unexpected server_version_num '{}'", raw)))
    }

    async fn role_exists(&self, name: &str) -> Result<bool> {
        self.fetch_bool(query::ROLE_EXISTS, &[name]).await
    }

    async fn create_replication_role(&self, name: &str, password: &str) -> Result<()> {
        self.execute(&query::create_replication_role(name, password))
            .await
    }

    async fn drop_role(&self, name: &str) -> Result<()> {
        self.execute(&query::drop_role_if_exists(name)).await
    }

    async fn setting(&self, name: &str) -> Result<Option<String>> {
        self.fetch_optional_string("SELECT current_setting($1, true)", &[name])
            .await
    }

    async fn reload_configuration(&self) -> Result<()> {
        self.execute("SELECT pg_reload_conf()").await
    }

    async fn reset_connection(&self) {
        let previous = std::mem::replace(&mut *self.pool.write().await, lazy_pool(&self.options));
        previous.close().await;
        debug!("Dropped admin connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_socket_is_unavailable() {
        let dir = tempfile::TempDir::new().unwrap();
        let admin = PgAdmin::new(dir.path(), 5432, "os_admin", None, "replicator");
        let err = admin.is_replica().await.unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_reserved_names_rejected_before_connecting() {
        let dir = tempfile::TempDir::new().unwrap();
        let admin = PgAdmin::new(dir.path(), 5432, "os_admin", None, "replicator");
        let err = admin
            .create_databases(&[PgDatabase::named("template0")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReservedName(_)));
    }
}
