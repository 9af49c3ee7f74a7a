// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for pg-guest.

use std::path::PathBuf;
use std::time::Duration;

/// Datastore manager name reported to the control plane and used in log prefixes.
pub const DATASTORE_MANAGER: &str = "postgresql";

/// Controller configuration loaded from environment variables.
///
/// Every component receives the pieces it needs from this value at
/// construction time.
#[derive(Debug, Clone)]
pub struct Config {
    /// Instance ID assigned by the control plane
    pub instance_id: String,
    /// Unix socket the RPC server listens on
    pub socket_path: PathBuf,
    /// Home directory of the controller (password file, modules, markers)
    pub home_dir: PathBuf,
    /// Host directory holding postgresql.conf, pg_hba.conf and conf.d
    pub config_dir: PathBuf,
    /// Host directory holding the engine's Unix socket
    pub run_dir: PathBuf,
    /// Mount point of the data volume
    pub mount_point: PathBuf,
    /// Engine uid owning data, archive and configuration files
    pub engine_uid: u32,
    /// Engine gid owning data, archive and configuration files
    pub engine_gid: u32,
    /// Engine image repository (tag is the datastore version)
    pub docker_image: String,
    /// Image used for backup, restore and rewind sidecars
    pub backup_docker_image: String,
    /// Controller superuser
    pub admin_user: String,
    /// Replication role
    pub replication_user: String,
    /// Engine port
    pub port: u16,
    /// Address replicas use to reach this node's engine
    pub advertise_address: Option<String>,
    /// Ceiling for outstanding user override revisions
    pub max_user_overrides: usize,
    /// How often the status probe runs
    pub status_interval: Duration,
    /// Whether the WAL archive cleanup task runs
    pub wal_cleanup_enabled: bool,
    /// How often the WAL archive cleanup task runs
    pub wal_cleanup_interval: Duration,
    /// Upper bound for start/stop waits
    pub state_change_wait_time: Duration,
    /// Interval between status polls inside waits
    pub state_change_poll_interval: Duration,
    /// Upper bound for promote and wait_for_txn
    pub replication_timeout: Duration,
    /// Timeout for the in-container liveness probe
    pub probe_timeout: Duration,
    /// Swift storage URL (including account)
    pub object_store_url: Option<String>,
    /// Swift auth token
    pub object_store_token: Option<String>,
    /// Container receiving published logs
    pub log_container: String,
    /// Expiry applied to published log objects
    pub log_expiry: Duration,
    /// Maximum size of a published log chunk
    pub log_chunk_size: usize,
    /// Container holding backups
    pub backup_container: String,
    /// AES-CBC key for encrypted backups
    pub backup_encryption_key: Option<String>,
    /// The controller's own log file, exposed as the `guest` log
    pub guest_log_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instance_id: "unknown".to_string(),
            socket_path: PathBuf::from("/var/run/pg-guest/pg-guest.sock"),
            home_dir: PathBuf::from("/home/guest"),
            config_dir: PathBuf::from("/etc/postgresql"),
            run_dir: PathBuf::from("/var/run/postgresql"),
            mount_point: PathBuf::from("/var/lib/postgresql"),
            engine_uid: 999,
            engine_gid: 999,
            docker_image: "postgres".to_string(),
            backup_docker_image: "pg-guest/db-backup-postgresql:latest".to_string(),
            admin_user: "os_admin".to_string(),
            replication_user: "replicator".to_string(),
            port: 5432,
            advertise_address: None,
            max_user_overrides: 10,
            status_interval: Duration::from_secs(3),
            wal_cleanup_enabled: false,
            wal_cleanup_interval: Duration::from_secs(180),
            state_change_wait_time: Duration::from_secs(600),
            state_change_poll_interval: Duration::from_secs(3),
            replication_timeout: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(10),
            object_store_url: None,
            object_store_token: None,
            log_container: "database_logs".to_string(),
            log_expiry: Duration::from_secs(7 * 24 * 3600),
            log_chunk_size: 64 * 1024,
            backup_container: "database_backups".to_string(),
            backup_encryption_key: None,
            guest_log_file: PathBuf::from("/var/log/pg-guest/pg-guest.log"),
        }
    }
}

fn env_string(var: &str, default: String) -> String {
    std::env::var(var).unwrap_or(default)
}

fn env_path(var: &str, default: PathBuf) -> PathBuf {
    std::env::var(var).map(PathBuf::from).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue(var)),
        Err(_) => Ok(default),
    }
}

fn env_bool(var: &str, default: bool) -> bool {
    std::env::var(var)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_secs(var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(var, default.as_secs()).map(Duration::from_secs)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let instance_id = std::env::var("PG_GUEST_INSTANCE_ID")
            .map_err(|_| ConfigError::MissingEnvVar("PG_GUEST_INSTANCE_ID"))?;

        let port: u16 = env_parse("PG_GUEST_PORT", defaults.port)?;
        if port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        let max_user_overrides = env_parse("PG_GUEST_MAX_USER_OVERRIDES", defaults.max_user_overrides)?;

        Ok(Self {
            instance_id,
            socket_path: env_path("PG_GUEST_SOCKET", defaults.socket_path),
            home_dir: env_path("PG_GUEST_HOME", defaults.home_dir),
            config_dir: env_path("PG_GUEST_CONFIG_DIR", defaults.config_dir),
            run_dir: env_path("PG_GUEST_RUN_DIR", defaults.run_dir),
            mount_point: env_path("PG_GUEST_MOUNT_POINT", defaults.mount_point),
            engine_uid: env_parse("PG_GUEST_ENGINE_UID", defaults.engine_uid)?,
            engine_gid: env_parse("PG_GUEST_ENGINE_GID", defaults.engine_gid)?,
            docker_image: env_string("PG_GUEST_DOCKER_IMAGE", defaults.docker_image),
            backup_docker_image: env_string(
                "PG_GUEST_BACKUP_DOCKER_IMAGE",
                defaults.backup_docker_image,
            ),
            admin_user: env_string("PG_GUEST_ADMIN_USER", defaults.admin_user),
            replication_user: env_string("PG_GUEST_REPLICATION_USER", defaults.replication_user),
            port,
            advertise_address: std::env::var("PG_GUEST_ADVERTISE_ADDRESS").ok(),
            max_user_overrides,
            status_interval: env_secs("PG_GUEST_STATUS_INTERVAL_SECS", defaults.status_interval)?,
            wal_cleanup_enabled: env_bool("PG_GUEST_WAL_CLEANUP", defaults.wal_cleanup_enabled),
            wal_cleanup_interval: env_secs(
                "PG_GUEST_WAL_CLEANUP_INTERVAL_SECS",
                defaults.wal_cleanup_interval,
            )?,
            state_change_wait_time: env_secs(
                "PG_GUEST_STATE_CHANGE_WAIT_SECS",
                defaults.state_change_wait_time,
            )?,
            state_change_poll_interval: defaults.state_change_poll_interval,
            replication_timeout: env_secs(
                "PG_GUEST_REPLICATION_TIMEOUT_SECS",
                defaults.replication_timeout,
            )?,
            probe_timeout: env_secs("PG_GUEST_PROBE_TIMEOUT_SECS", defaults.probe_timeout)?,
            object_store_url: std::env::var("PG_GUEST_OBJECT_STORE_URL").ok(),
            object_store_token: std::env::var("PG_GUEST_OBJECT_STORE_TOKEN").ok(),
            log_container: env_string("PG_GUEST_LOG_CONTAINER", defaults.log_container),
            log_expiry: env_secs("PG_GUEST_LOG_EXPIRY_SECS", defaults.log_expiry)?,
            log_chunk_size: env_parse("PG_GUEST_LOG_CHUNK_SIZE", defaults.log_chunk_size)?,
            backup_container: env_string("PG_GUEST_BACKUP_CONTAINER", defaults.backup_container),
            backup_encryption_key: std::env::var("PG_GUEST_BACKUP_ENCRYPTION_KEY").ok(),
            guest_log_file: env_path("PG_GUEST_LOG_FILE", defaults.guest_log_file),
        })
    }

    /// Host path of the engine data directory.
    pub fn data_dir(&self) -> PathBuf {
        self.mount_point.join("data").join("pgdata")
    }

    /// Host path of the WAL archive directory.
    pub fn wal_archive_dir(&self) -> PathBuf {
        self.mount_point.join("data").join("wal_archive")
    }

    /// Host path of the base configuration file.
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("postgresql.conf")
    }

    /// Host path of the client-auth ruleset.
    pub fn hba_file(&self) -> PathBuf {
        self.config_dir.join("pg_hba.conf")
    }

    /// Directory holding override revisions.
    pub fn overrides_dir(&self) -> PathBuf {
        self.config_dir.join("conf.d")
    }

    /// Superuser password file used for reconnects.
    pub fn password_file(&self) -> PathBuf {
        self.home_dir.join("postgres.cnf")
    }

    /// Root of applied module records.
    pub fn modules_dir(&self) -> PathBuf {
        self.home_dir.join("modules")
    }

    /// Marker written once prepare has completed.
    pub fn prepare_marker(&self) -> PathBuf {
        self.home_dir.join(".guestagent.prepare.end")
    }

    /// Owner applied to engine files.
    pub fn owner(&self) -> crate::os::Owner {
        crate::os::Owner::new(self.engine_uid, self.engine_gid)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
    /// The port number is invalid.
    #[error("Invalid port number")]
    InvalidPort,
}
