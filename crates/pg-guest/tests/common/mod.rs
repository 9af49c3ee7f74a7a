// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for pg-guest integration tests.
//!
//! Provides TestContext: a manager wired to the mock supervisor, the
//! in-memory admin client and the in-memory object store, rooted in a
//! temporary directory.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pg_guest::admin::MockAdmin;
use pg_guest::config::Config;
use pg_guest::manager::{Manager, PrepareRequest, SharedManager};
use pg_guest::object_store::InMemoryObjectStore;
use pg_guest::os::Owner;
use pg_guest::supervisor::{MockSupervisor, OneshotOutput};
use pg_guest::volume::VolumeTools;

/// Configuration rooted at `root`, owned by the test process, with short waits.
pub fn test_config(root: &Path) -> Config {
    let owner = Owner::current();
    Config {
        instance_id: "inst-1".to_string(),
        socket_path: root.join("run/pg-guest.sock"),
        home_dir: root.join("home"),
        config_dir: root.join("etc/postgresql"),
        run_dir: root.join("run/postgresql"),
        mount_point: root.join("mnt"),
        engine_uid: owner.uid,
        engine_gid: owner.gid,
        advertise_address: Some("10.0.0.1".to_string()),
        state_change_wait_time: Duration::from_secs(2),
        state_change_poll_interval: Duration::from_millis(10),
        replication_timeout: Duration::from_millis(300),
        probe_timeout: Duration::from_secs(1),
        log_chunk_size: 16,
        guest_log_file: root.join("log/pg-guest.log"),
        ..Config::default()
    }
}

/// Test context holding the manager and handles on its mock collaborators.
pub struct TestContext {
    pub manager: Manager,
    pub supervisor: Arc<MockSupervisor>,
    pub admin: Arc<MockAdmin>,
    pub store: Arc<InMemoryObjectStore>,
    pub config: Config,
    pub temp_dir: tempfile::TempDir,
}

impl TestContext {
    /// Create a fresh, unprepared instance.
    pub fn new() -> Self {
        let temp_dir = tempfile::TempDir::new().expect("temp dir");
        let config = test_config(temp_dir.path());
        std::fs::create_dir_all(&config.home_dir).expect("home dir");
        Self::with_config(temp_dir, config)
    }

    /// Create an instance with a custom configuration.
    pub fn with_config(temp_dir: tempfile::TempDir, config: Config) -> Self {
        let supervisor = Arc::new(MockSupervisor::new());
        let admin = Arc::new(MockAdmin::new(&config.admin_user, &config.replication_user));
        let store = Arc::new(InMemoryObjectStore::new());
        let manager = Manager::new(
            Arc::new(config.clone()),
            supervisor.clone(),
            admin.clone(),
            store.clone(),
            VolumeTools::all("true"),
        );
        Self {
            manager,
            supervisor,
            admin,
            store,
            config,
            temp_dir,
        }
    }

    /// Run `prepare` with `request`, panicking on failure.
    pub async fn prepare(&mut self, request: PrepareRequest) {
        self.manager
            .prepare(request)
            .await
            .expect("prepare should succeed");
    }

    /// Prepare a bare primary.
    pub async fn prepared() -> Self {
        let mut ctx = Self::new();
        ctx.prepare(PrepareRequest::default()).await;
        ctx
    }

    /// Put the manager behind the shared lock used by the server and workers.
    pub fn into_shared(self) -> SharedContext {
        SharedContext {
            manager: Arc::new(tokio::sync::Mutex::new(self.manager)),
            supervisor: self.supervisor,
            admin: self.admin,
            store: self.store,
            config: self.config,
            temp_dir: self.temp_dir,
        }
    }
}

/// Test context whose manager is shared.
pub struct SharedContext {
    pub manager: SharedManager,
    pub supervisor: Arc<MockSupervisor>,
    pub admin: Arc<MockAdmin>,
    pub store: Arc<InMemoryObjectStore>,
    pub config: Config,
    pub temp_dir: tempfile::TempDir,
}

/// Sidecar output ending with a backup result line.
pub fn backup_output(location: &str, checksum: &str) -> OneshotOutput {
    OneshotOutput {
        lines: vec![
            "backup started".to_string(),
            format!(
                r#"{{"location": "{}", "checksum": "{}", "size": 1024}}"#,
                location, checksum
            ),
        ],
        success: true,
    }
}
