// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The engine container and its status.
//!
//! [`PgApp`] owns the supervisor handle and the [`StatusTracker`]. It knows
//! how the engine container is laid out (mounts, user, command) and how to
//! probe it, but nothing about configuration contents or SQL.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::os::{self, MODE_SECRET, Owner, PASSWORD_LENGTH};
use crate::poll::poll_until;
use crate::status::{ProbeResult, ServiceStatus, StatusTracker};
use crate::supervisor::{ContainerSpec, ContainerState, Supervisor, SupervisorError, VolumeMount};

/// Name of the engine container.
pub const CONTAINER_NAME: &str = "database";
/// Configuration directory inside the container.
pub const CONTAINER_CONFIG_DIR: &str = "/etc/postgresql";
/// Socket directory inside the container.
pub const CONTAINER_RUN_DIR: &str = "/var/run/postgresql";
/// Mount point of the data volume inside the container.
pub const CONTAINER_MOUNT: &str = "/var/lib/postgresql";
/// Data directory inside the container.
pub const CONTAINER_DATA_DIR: &str = "/var/lib/postgresql/data/pgdata";
/// WAL archive inside the container.
pub const CONTAINER_ARCHIVE_DIR: &str = "/var/lib/postgresql/data/wal_archive";

/// Command executed inside the engine container to check liveness.
pub fn probe_command(admin_user: &str, port: u16) -> Vec<String> {
    [
        "psql",
        "-h",
        CONTAINER_RUN_DIR,
        "-p",
        &port.to_string(),
        "-U",
        admin_user,
        "-d",
        "postgres",
        "-tAc",
        "SELECT 1",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// The engine container.
pub struct PgApp {
    config: Arc<Config>,
    supervisor: Arc<dyn Supervisor>,
    status: StatusTracker,
    version: Option<String>,
}

impl PgApp {
    /// Create the application handle.
    pub fn new(config: Arc<Config>, supervisor: Arc<dyn Supervisor>) -> Self {
        let status = StatusTracker::new(config.prepare_marker());
        Self {
            config,
            supervisor,
            status,
            version: None,
        }
    }

    /// Status tracker.
    pub fn status(&self) -> &StatusTracker {
        &self.status
    }

    /// Mutable status tracker.
    pub fn status_mut(&mut self) -> &mut StatusTracker {
        &mut self.status
    }

    /// Supervisor handle, shared with sidecar runners.
    pub fn supervisor(&self) -> &Arc<dyn Supervisor> {
        &self.supervisor
    }

    /// Datastore version (image tag).
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Set the datastore version used for the next start.
    pub fn set_version(&mut self, version: Option<String>) {
        if let Some(v) = &version {
            debug!(version = %v, "Datastore version set");
        }
        self.version = version;
    }

    /// Image reference of the engine container.
    pub fn image(&self) -> String {
        format!(
            "{}:{}",
            self.config.docker_image,
            self.version.as_deref().unwrap_or("latest")
        )
    }

    /// Create the host directories mounted into the container.
    pub async fn ensure_host_dirs(&self) -> Result<()> {
        let owner = self.config.owner();
        os::ensure_dir(&self.config.config_dir, owner, 0o755).await?;
        os::ensure_dir(&self.config.run_dir, owner, 0o775).await?;
        os::ensure_dir(&self.config.mount_point, owner, 0o755).await?;
        Ok(())
    }

    /// Superuser password stored for reconnects, if any.
    pub async fn read_admin_password(&self) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.config.password_file()).await {
            Ok(text) => Ok(Some(text.trim().to_string()).filter(|p| !p.is_empty())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Store the superuser password (mode 0600).
    pub async fn write_admin_password(&self, password: &str) -> Result<()> {
        os::write_atomic(
            &self.config.password_file(),
            password.as_bytes(),
            Owner::current(),
            MODE_SECRET,
        )
        .await
    }

    /// Stored superuser password, generating and storing one on first use.
    pub async fn ensure_admin_password(&self) -> Result<String> {
        if let Some(password) = self.read_admin_password().await? {
            return Ok(password);
        }
        let password = os::generate_password(PASSWORD_LENGTH);
        self.write_admin_password(&password).await?;
        info!("Generated superuser password");
        Ok(password)
    }

    /// Definition of the engine container.
    pub fn container_spec(&self, admin_password: &str) -> ContainerSpec {
        let mut env = BTreeMap::new();
        env.insert("POSTGRES_USER".to_string(), self.config.admin_user.clone());
        env.insert("POSTGRES_PASSWORD".to_string(), admin_password.to_string());
        env.insert("PGDATA".to_string(), CONTAINER_DATA_DIR.to_string());

        ContainerSpec {
            name: CONTAINER_NAME.to_string(),
            image: self.image(),
            env,
            volumes: vec![
                VolumeMount::rw(&self.config.config_dir, CONTAINER_CONFIG_DIR),
                VolumeMount::rw(&self.config.run_dir, CONTAINER_RUN_DIR),
                VolumeMount::rw(&self.config.mount_point, CONTAINER_MOUNT),
            ],
            ports: vec![(self.config.port, self.config.port)],
            command: Some(vec![
                "postgres".to_string(),
                "-c".to_string(),
                format!("config_file={}/postgresql.conf", CONTAINER_CONFIG_DIR),
            ]),
            user: Some(self.config.owner()),
            host_network: true,
        }
    }

    /// Probe the container and the engine inside it.
    pub async fn probe(&self) -> ServiceStatus {
        let state = match self.supervisor.state(CONTAINER_NAME).await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "Failed to query container state");
                return ServiceStatus::Unknown;
            }
        };
        let probe = if state == ContainerState::Running {
            let command = probe_command(&self.config.admin_user, self.config.port);
            match self
                .supervisor
                .exec(CONTAINER_NAME, &command, self.config.probe_timeout)
                .await
            {
                Ok(output) if output.success() => ProbeResult::Ok,
                Ok(_) => ProbeResult::Failed,
                Err(SupervisorError::Timeout(_)) => ProbeResult::TimedOut,
                Err(e) => {
                    debug!(error = %e, "Liveness probe failed");
                    ProbeResult::Failed
                }
            }
        } else {
            ProbeResult::Failed
        };
        ServiceStatus::from_container(&state, probe)
    }

    /// Periodic status refresh. Skipped while installing or before prepare.
    pub async fn update_status(&mut self) {
        if self.status.is_installing() {
            debug!("Install in progress, skipping status probe");
            return;
        }
        if !self.status.is_installed() {
            return;
        }
        let observed = self.probe().await;
        self.status.set_status(observed, false);
    }

    /// Poll until the observed status equals `target`.
    ///
    /// Returns false when `timeout` elapses. With `update_db` the last
    /// observation is recorded in the tracker.
    pub async fn wait_for_status(
        &mut self,
        target: ServiceStatus,
        timeout: Duration,
        update_db: bool,
    ) -> bool {
        let this = &*self;
        let outcome = poll_until(
            move || async move {
                let observed = this.probe().await;
                (observed == target).then_some(observed)
            },
            self.config.state_change_poll_interval,
            timeout,
        )
        .await;

        let reached = !outcome.timed_out();
        if update_db {
            let observed = if reached { target } else { self.probe().await };
            self.status.set_status(observed, false);
        }
        if !reached {
            warn!(target = %target, ?timeout, "Timed out waiting for status");
        }
        reached
    }

    /// Start the engine and wait for it to answer queries.
    ///
    /// A container that was created but never became healthy is left in place
    /// so its logs stay inspectable.
    pub async fn start_db(&mut self, update_db: bool) -> Result<()> {
        self.ensure_host_dirs().await?;
        let password = self.ensure_admin_password().await?;
        let spec = self.container_spec(&password);

        info!(image = %spec.image, "Starting database");
        self.supervisor.start(&spec).await.map_err(|e| match e {
            SupervisorError::StartFailed(msg) => Error::DatastoreStartFailed(msg),
            other => Error::Supervisor(other),
        })?;

        let wait = self.config.state_change_wait_time;
        if !self
            .wait_for_status(ServiceStatus::Healthy, wait, false)
            .await
        {
            return Err(Error::DatastoreStartFailed(format!(
                "database did not become healthy within {:?}",
                wait
            )));
        }
        if update_db {
            self.status.transition(ServiceStatus::Healthy);
        }
        info!("Database started");
        Ok(())
    }

    /// Stop the engine. Stopping a stopped engine succeeds.
    pub async fn stop_db(&mut self, update_db: bool) -> Result<()> {
        info!("Stopping database");
        self.supervisor.stop(CONTAINER_NAME).await?;
        let wait = self.config.state_change_wait_time;
        if !self
            .wait_for_status(ServiceStatus::Shutdown, wait, false)
            .await
        {
            return Err(Error::PollTimeout("database shutdown".to_string()));
        }
        if update_db {
            self.status.transition(ServiceStatus::Shutdown);
        }
        Ok(())
    }

    /// Restart the engine container; starts it when it does not exist.
    pub async fn restart(&mut self) -> Result<()> {
        info!("Restarting database");
        match self.supervisor.restart(CONTAINER_NAME).await {
            Ok(()) => {}
            Err(SupervisorError::NotFound(_)) => return self.start_db(true).await,
            Err(e) => return Err(e.into()),
        }
        let wait = self.config.state_change_wait_time;
        if !self
            .wait_for_status(ServiceStatus::Healthy, wait, false)
            .await
        {
            return Err(Error::DatastoreStartFailed(
                "database did not come back after restart".to_string(),
            ));
        }
        self.status.transition(ServiceStatus::Healthy);
        Ok(())
    }

    /// Flag that a configuration change needs a restart.
    pub fn mark_restart_required(&mut self) {
        self.status.transition(ServiceStatus::RestartRequired);
    }

    /// Last `tail` lines of the engine container log.
    pub async fn logs(&self, tail: usize) -> Result<Vec<String>> {
        Ok(self.supervisor.logs(CONTAINER_NAME, tail).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::MockSupervisor;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        let owner = Owner::current();
        Config {
            instance_id: "inst-1".to_string(),
            home_dir: dir.path().join("home"),
            config_dir: dir.path().join("etc"),
            run_dir: dir.path().join("run"),
            mount_point: dir.path().join("mnt"),
            engine_uid: owner.uid,
            engine_gid: owner.gid,
            state_change_wait_time: Duration::from_millis(200),
            state_change_poll_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn app(dir: &TempDir) -> (PgApp, Arc<MockSupervisor>) {
        let supervisor = Arc::new(MockSupervisor::new());
        let app = PgApp::new(Arc::new(config(dir)), supervisor.clone());
        (app, supervisor)
    }

    #[tokio::test]
    async fn test_start_db_reaches_healthy_and_writes_password() {
        let dir = TempDir::new().unwrap();
        let (mut app, supervisor) = app(&dir);
        app.set_version(Some("16".to_string()));

        app.start_db(true).await.unwrap();

        assert_eq!(app.status().current(), ServiceStatus::Healthy);
        let password = app.read_admin_password().await.unwrap().unwrap();
        assert_eq!(password.len(), PASSWORD_LENGTH);
        let calls = supervisor.calls().await;
        let spec = calls
            .iter()
            .find_map(|c| match c {
                crate::supervisor::SupervisorCall::Start(spec) => Some(spec.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(spec.image, "postgres:16");
        assert_eq!(spec.env["POSTGRES_PASSWORD"], password);
        assert!(dir.path().join("etc").is_dir());
        assert!(dir.path().join("run").is_dir());
    }

    #[tokio::test]
    async fn test_start_failure_is_datastore_start_failed() {
        let dir = TempDir::new().unwrap();
        let (mut app, supervisor) = app(&dir);
        supervisor.fail_start.store(true, Ordering::SeqCst);

        let err = app.start_db(true).await.unwrap_err();
        assert!(matches!(err, Error::DatastoreStartFailed(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_unhealthy_engine_times_out() {
        let dir = TempDir::new().unwrap();
        let (mut app, supervisor) = app(&dir);
        supervisor.probe_fails.store(true, Ordering::SeqCst);

        let err = app.start_db(true).await.unwrap_err();
        assert!(matches!(err, Error::DatastoreStartFailed(_)));
        assert_eq!(app.probe().await, ServiceStatus::Running);
    }

    #[tokio::test]
    async fn test_probe_timeout_is_blocked() {
        let dir = TempDir::new().unwrap();
        let (app, supervisor) = app(&dir);
        supervisor
            .set_state(CONTAINER_NAME, ContainerState::Running)
            .await;
        supervisor.probe_hangs.store(true, Ordering::SeqCst);
        assert_eq!(app.probe().await, ServiceStatus::Blocked);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (mut app, _supervisor) = app(&dir);
        app.stop_db(true).await.unwrap();
        app.start_db(true).await.unwrap();
        app.stop_db(true).await.unwrap();
        app.stop_db(true).await.unwrap();
        assert_eq!(app.status().current(), ServiceStatus::Shutdown);
    }

    #[tokio::test]
    async fn test_update_status_skipped_before_install() {
        let dir = TempDir::new().unwrap();
        let (mut app, supervisor) = app(&dir);
        supervisor
            .set_state(CONTAINER_NAME, ContainerState::Running)
            .await;
        app.update_status().await;
        assert_eq!(app.status().current(), ServiceStatus::New);
    }

    #[tokio::test]
    async fn test_restart_clears_restart_required() {
        let dir = TempDir::new().unwrap();
        let (mut app, _supervisor) = app(&dir);
        app.start_db(true).await.unwrap();
        app.mark_restart_required();
        assert_eq!(app.status().current(), ServiceStatus::RestartRequired);
        app.restart().await.unwrap();
        assert_eq!(app.status().current(), ServiceStatus::Healthy);
    }
}
