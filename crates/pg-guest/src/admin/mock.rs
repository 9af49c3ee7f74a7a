// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory admin client for testing.
//!
//! Behaves like a single engine: roles, databases, grants, recovery state and
//! WAL positions live in memory and follow the same validation rules as
//! [`PgAdmin`](super::PgAdmin).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Mutex;

use super::models::{
    self, Lsn, Page, PgDatabase, PgUser, ROOT_USER, UserAttributes, check_database_name,
    check_user_name, paginate,
};
use super::Admin;
use crate::error::{Error, Result};
use crate::os::{self, PASSWORD_LENGTH};

#[derive(Debug, Clone, Default)]
struct MockRole {
    password: Option<String>,
    superuser: bool,
    login: bool,
    grants: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct MockState {
    roles: BTreeMap<String, MockRole>,
    databases: BTreeMap<String, PgDatabase>,
    in_recovery: bool,
    wal_lsn: u64,
    replay_lsn: Option<u64>,
    backup_label: Option<String>,
    settings: HashMap<String, String>,
    statements: Vec<String>,
    reloads: usize,
}

/// In-memory engine.
pub struct MockAdmin {
    state: Mutex<MockState>,
    admin_user: String,
    replication_user: String,
    major_version: u32,
    /// If true, `promote` is accepted but the engine stays in recovery
    pub promote_sticks: AtomicBool,
    /// If true, every call fails as if the engine were down
    pub unavailable: AtomicBool,
}

impl Default for MockAdmin {
    fn default() -> Self {
        Self::new("os_admin", "replicator")
    }
}

impl MockAdmin {
    /// Create an engine with only the admin role and the system databases.
    pub fn new(admin_user: &str, replication_user: &str) -> Self {
        let mut state = MockState {
            wal_lsn: 0x0300_0060,
            ..Default::default()
        };
        state.roles.insert(
            admin_user.to_string(),
            MockRole {
                superuser: true,
                login: true,
                ..Default::default()
            },
        );
        for db in ["postgres", "template0", "template1"] {
            state.databases.insert(db.to_string(), PgDatabase::named(db));
        }
        Self {
            state: Mutex::new(state),
            admin_user: admin_user.to_string(),
            replication_user: replication_user.to_string(),
            major_version: 16,
            promote_sticks: AtomicBool::new(false),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Put the engine in or out of recovery.
    pub async fn set_replica(&self, replica: bool) {
        let mut state = self.state.lock().await;
        state.in_recovery = replica;
        if replica && state.replay_lsn.is_none() {
            state.replay_lsn = Some(0);
        }
    }

    /// Simulate a write on a primary; returns the new position.
    pub async fn write_row(&self) -> Lsn {
        let mut state = self.state.lock().await;
        state.wal_lsn += 0x100;
        Lsn(state.wal_lsn)
    }

    /// Set the replayed position on a replica.
    pub async fn set_replay_lsn(&self, lsn: Lsn) {
        self.state.lock().await.replay_lsn = Some(lsn.0);
    }

    /// Set a run-time setting.
    pub async fn set_setting(&self, name: &str, value: &str) {
        self.state
            .lock()
            .await
            .settings
            .insert(name.to_string(), value.to_string());
    }

    /// Label of the open backup window, if any.
    pub async fn backup_label(&self) -> Option<String> {
        self.state.lock().await.backup_label.clone()
    }

    /// Statements passed to `psql`.
    pub async fn statements(&self) -> Vec<String> {
        self.state.lock().await.statements.clone()
    }

    /// Number of configuration reloads.
    pub async fn reload_count(&self) -> usize {
        self.state.lock().await.reloads
    }

    /// Number of superuser roles.
    pub async fn superuser_count(&self) -> usize {
        self.state
            .lock()
            .await
            .roles
            .values()
            .filter(|r| r.superuser)
            .count()
    }

    /// Current password of a role.
    pub async fn password_of(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .roles
            .get(name)
            .and_then(|r| r.password.clone())
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("mock engine down".to_string()));
        }
        Ok(())
    }

    fn is_hidden_user(&self, name: &str) -> bool {
        models::is_reserved_user(name) || name == self.admin_user || name == self.replication_user
    }

    fn access_of(state: &MockState, name: &str) -> Vec<PgDatabase> {
        state
            .roles
            .get(name)
            .map(|role| {
                role.grants
                    .iter()
                    .filter(|db| state.databases.contains_key(*db))
                    .map(PgDatabase::named)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl Admin for MockAdmin {
    async fn create_users(&self, users: &[PgUser]) -> Result<()> {
        self.check_available()?;
        for user in users {
            check_user_name(&user.name)?;
            {
                let mut state = self.state.lock().await;
                if state.roles.contains_key(&user.name) {
                    return Err(Error::AlreadyExists(user.name.clone()));
                }
                state.roles.insert(
                    user.name.clone(),
                    MockRole {
                        password: user.password.clone(),
                        login: true,
                        ..Default::default()
                    },
                );
            }
            let databases: Vec<String> = user.databases.iter().map(|d| d.name.clone()).collect();
            if !databases.is_empty() {
                self.grant_access(&user.name, None, &databases).await?;
            }
        }
        Ok(())
    }

    async fn delete_user(&self, user: &PgUser) -> Result<()> {
        self.check_available()?;
        check_user_name(&user.name)?;
        let mut state = self.state.lock().await;
        state
            .roles
            .remove(&user.name)
            .map(|_| ())
            .ok_or_else(|| Error::UserNotFound(user.name.clone()))
    }

    async fn list_users(
        &self,
        limit: Option<usize>,
        marker: Option<&str>,
        include_marker: bool,
    ) -> Result<Page<PgUser>> {
        self.check_available()?;
        let state = self.state.lock().await;
        let users = state
            .roles
            .iter()
            .filter(|(name, role)| role.login && !self.is_hidden_user(name))
            .map(|(name, _)| PgUser {
                databases: Self::access_of(&state, name),
                ..PgUser::named(name.clone())
            })
            .collect();
        Ok(paginate(users, limit, marker, include_marker))
    }

    async fn get_user(&self, name: &str, _host: Option<&str>) -> Result<Option<PgUser>> {
        self.check_available()?;
        if self.is_hidden_user(name) {
            return Ok(None);
        }
        let state = self.state.lock().await;
        Ok(state.roles.get(name).map(|_| PgUser {
            databases: Self::access_of(&state, name),
            ..PgUser::named(name)
        }))
    }

    async fn change_passwords(&self, users: &[PgUser]) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        for user in users {
            check_user_name(&user.name)?;
            let password = user.password.clone().ok_or_else(|| {
                Error::InvalidInput(format!("no password given for '{}'", user.name))
            })?;
            let role = state
                .roles
                .get_mut(&user.name)
                .ok_or_else(|| Error::UserNotFound(user.name.clone()))?;
            role.password = Some(password);
        }
        Ok(())
    }

    async fn update_attributes(
        &self,
        name: &str,
        _host: Option<&str>,
        attrs: &UserAttributes,
    ) -> Result<()> {
        self.check_available()?;
        check_user_name(name)?;
        let mut state = self.state.lock().await;
        if !state.roles.contains_key(name) {
            return Err(Error::UserNotFound(name.to_string()));
        }
        let mut current = name.to_string();
        if let Some(new_name) = attrs.name.as_deref()
            && new_name != name
        {
            check_user_name(new_name)?;
            if state.roles.contains_key(new_name) {
                return Err(Error::AlreadyExists(new_name.to_string()));
            }
            if let Some(role) = state.roles.remove(name) {
                state.roles.insert(new_name.to_string(), role);
            }
            current = new_name.to_string();
        }
        if let Some(password) = &attrs.password
            && let Some(role) = state.roles.get_mut(&current)
        {
            role.password = Some(password.clone());
        }
        Ok(())
    }

    async fn grant_access(&self, name: &str, _host: Option<&str>, databases: &[String]) -> Result<()> {
        self.check_available()?;
        check_user_name(name)?;
        let mut state = self.state.lock().await;
        for database in databases {
            check_database_name(database)?;
            if !state.databases.contains_key(database) {
                return Err(Error::DatabaseNotFound(database.clone()));
            }
        }
        let role = state
            .roles
            .get_mut(name)
            .ok_or_else(|| Error::UserNotFound(name.to_string()))?;
        role.grants.extend(databases.iter().cloned());
        Ok(())
    }

    async fn revoke_access(&self, name: &str, _host: Option<&str>, database: &str) -> Result<()> {
        self.check_available()?;
        check_user_name(name)?;
        check_database_name(database)?;
        let mut state = self.state.lock().await;
        if !state.databases.contains_key(database) {
            return Err(Error::DatabaseNotFound(database.to_string()));
        }
        let role = state
            .roles
            .get_mut(name)
            .ok_or_else(|| Error::UserNotFound(name.to_string()))?;
        role.grants.remove(database);
        Ok(())
    }

    async fn list_access(&self, name: &str, _host: Option<&str>) -> Result<Vec<PgDatabase>> {
        self.check_available()?;
        let state = self.state.lock().await;
        if !state.roles.contains_key(name) {
            return Err(Error::UserNotFound(name.to_string()));
        }
        Ok(Self::access_of(&state, name))
    }

    async fn create_databases(&self, databases: &[PgDatabase]) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        for database in databases {
            check_database_name(&database.name)?;
            if state.databases.contains_key(&database.name) {
                return Err(Error::AlreadyExists(database.name.clone()));
            }
            state
                .databases
                .insert(database.name.clone(), database.clone());
        }
        Ok(())
    }

    async fn delete_database(&self, database: &PgDatabase) -> Result<()> {
        self.check_available()?;
        check_database_name(&database.name)?;
        let mut state = self.state.lock().await;
        if state.databases.remove(&database.name).is_none() {
            return Err(Error::DatabaseNotFound(database.name.clone()));
        }
        for role in state.roles.values_mut() {
            role.grants.remove(&database.name);
        }
        Ok(())
    }

    async fn list_databases(
        &self,
        limit: Option<usize>,
        marker: Option<&str>,
        include_marker: bool,
    ) -> Result<Page<PgDatabase>> {
        self.check_available()?;
        let state = self.state.lock().await;
        let databases = state
            .databases
            .values()
            .filter(|db| !models::is_reserved_database(&db.name))
            .cloned()
            .collect();
        Ok(paginate(databases, limit, marker, include_marker))
    }

    async fn enable_root(&self, password: Option<&str>) -> Result<PgUser> {
        self.check_available()?;
        let password = password
            .map(str::to_string)
            .unwrap_or_else(|| os::generate_password(PASSWORD_LENGTH));
        let mut state = self.state.lock().await;
        let role = state.roles.entry(ROOT_USER.to_string()).or_default();
        role.superuser = true;
        role.login = true;
        role.password = Some(password.clone());
        Ok(PgUser {
            name: ROOT_USER.to_string(),
            password: Some(password),
            host: None,
            databases: Vec::new(),
        })
    }

    async fn disable_root(&self) -> Result<()> {
        self.enable_root(None).await.map(|_| ())
    }

    async fn is_root_enabled(&self) -> Result<bool> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state.roles.iter().any(|(name, role)| {
            role.superuser
                && *name != self.admin_user
                && *name != self.replication_user
                && name != "postgres"
        }))
    }

    async fn psql(&self, statement: &str) -> Result<()> {
        self.check_available()?;
        self.state
            .lock()
            .await
            .statements
            .push(statement.to_string());
        Ok(())
    }

    async fn query(&self, statement: &str) -> Result<Vec<Value>> {
        self.check_available()?;
        self.state
            .lock()
            .await
            .statements
            .push(statement.to_string());
        Ok(vec![json!({"?column?": 1})])
    }

    async fn is_replica(&self) -> Result<bool> {
        self.check_available()?;
        Ok(self.state.lock().await.in_recovery)
    }

    async fn current_wal_lsn(&self) -> Result<Lsn> {
        self.check_available()?;
        let state = self.state.lock().await;
        if state.in_recovery {
            return Err(Error::PreconditionFailed(
                "recovery is in progress".to_string(),
            ));
        }
        Ok(Lsn(state.wal_lsn))
    }

    async fn last_replay_lsn(&self) -> Result<Option<Lsn>> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(if state.in_recovery {
            state.replay_lsn.map(Lsn)
        } else {
            None
        })
    }

    async fn promote(&self) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if !state.in_recovery {
            return Err(Error::PreconditionFailed(
                "server is not in standby mode".to_string(),
            ));
        }
        if !self.promote_sticks.load(Ordering::SeqCst) {
            state.in_recovery = false;
            if let Some(replayed) = state.replay_lsn.take() {
                state.wal_lsn = state.wal_lsn.max(replayed);
            }
        }
        Ok(())
    }

    async fn backup_start(&self, label: &str, _major_version: u32) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if state.backup_label.is_some() {
            return Err(Error::PreconditionFailed(
                "a backup is already in progress".to_string(),
            ));
        }
        state.backup_label = Some(label.to_string());
        Ok(())
    }

    async fn backup_stop(&self, _major_version: u32) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if state.backup_label.take().is_none() {
            return Err(Error::PreconditionFailed(
                "backup is not in progress".to_string(),
            ));
        }
        Ok(())
    }

    async fn server_version_major(&self) -> Result<u32> {
        self.check_available()?;
        Ok(self.major_version)
    }

    async fn role_exists(&self, name: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self.state.lock().await.roles.contains_key(name))
    }

    async fn create_replication_role(&self, name: &str, password: &str) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if state.roles.contains_key(name) {
            return Err(Error::AlreadyExists(name.to_string()));
        }
        state.roles.insert(
            name.to_string(),
            MockRole {
                password: Some(password.to_string()),
                superuser: true,
                login: true,
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn drop_role(&self, name: &str) -> Result<()> {
        self.check_available()?;
        self.state.lock().await.roles.remove(name);
        Ok(())
    }

    async fn setting(&self, name: &str) -> Result<Option<String>> {
        self.check_available()?;
        Ok(self.state.lock().await.settings.get(name).cloned())
    }

    async fn reload_configuration(&self) -> Result<()> {
        self.check_available()?;
        self.state.lock().await.reloads += 1;
        Ok(())
    }

    async fn reset_connection(&self) {}
}
