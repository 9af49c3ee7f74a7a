// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Supervisor trait definitions.
//!
//! Defines the abstract interface for the container daemon hosting the engine
//! and its one-shot sidecars.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::os::Owner;

/// Errors from supervisor operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SupervisorError {
    /// The container daemon (or its CLI) cannot be reached.
    #[error("Container daemon unavailable: {0}")]
    DaemonUnavailable(String),

    /// Container was not found.
    #[error("Container not found: {0}")]
    NotFound(String),

    /// Container could not be created or started.
    #[error("Container start failed: {0}")]
    StartFailed(String),

    /// Command did not finish in time.
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    /// CLI exited with a non-zero code.
    #[error("Exit code {exit_code}: {stderr}")]
    ExitCode {
        /// Exit code from the process.
        exit_code: i32,
        /// Standard error output.
        stderr: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

impl SupervisorError {
    /// Whether the daemon itself is unreachable.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, SupervisorError::DaemonUnavailable(_))
    }
}

/// Result type for supervisor operations.
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Container state as reported by the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    /// Process running.
    Running,
    /// Created but never started.
    Created,
    /// Exited.
    Exited,
    /// No such container.
    NotFound,
    /// Paused.
    Paused,
    /// Dead (failed removal or OOM).
    Dead,
    /// Being restarted by the daemon.
    Restarting,
    /// Anything else the daemon reports.
    Unknown(String),
}

impl ContainerState {
    /// Parse the daemon's state string.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "running" => ContainerState::Running,
            "created" => ContainerState::Created,
            "exited" => ContainerState::Exited,
            "paused" => ContainerState::Paused,
            "dead" => ContainerState::Dead,
            "restarting" => ContainerState::Restarting,
            other => ContainerState::Unknown(other.to_string()),
        }
    }
}

/// Bind mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Host path
    pub host: PathBuf,
    /// Path inside the container
    pub container: String,
    /// Mount read-only
    pub read_only: bool,
}

impl VolumeMount {
    /// Read-write mount.
    pub fn rw(host: impl Into<PathBuf>, container: &str) -> Self {
        Self {
            host: host.into(),
            container: container.to_string(),
            read_only: false,
        }
    }

    /// Read-only mount.
    pub fn ro(host: impl Into<PathBuf>, container: &str) -> Self {
        Self {
            host: host.into(),
            container: container.to_string(),
            read_only: true,
        }
    }
}

/// Long-running container definition.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    /// Container name
    pub name: String,
    /// Image reference including tag
    pub image: String,
    /// Environment variables
    pub env: BTreeMap<String, String>,
    /// Bind mounts
    pub volumes: Vec<VolumeMount>,
    /// Port map (host, container); ignored with host networking
    pub ports: Vec<(u16, u16)>,
    /// Command override
    pub command: Option<Vec<String>>,
    /// uid/gid to run as
    pub user: Option<Owner>,
    /// Share the host network namespace
    pub host_network: bool,
}

/// One-shot sidecar definition.
#[derive(Debug, Clone, Default)]
pub struct OneshotSpec {
    /// Container name; an existing container with this name is removed first
    pub name: String,
    /// Image reference including tag
    pub image: String,
    /// Command and arguments
    pub command: Vec<String>,
    /// Environment variables
    pub env: BTreeMap<String, String>,
    /// Bind mounts
    pub volumes: Vec<VolumeMount>,
    /// uid/gid to run as
    pub user: Option<Owner>,
    /// Upper bound for the run
    pub timeout: Option<Duration>,
}

/// Output of a finished sidecar.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneshotOutput {
    /// Combined stdout/stderr lines
    pub lines: Vec<String>,
    /// Whether the command exited with status 0
    pub success: bool,
}

/// Output of a command executed inside a running container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code
    pub exit_code: i32,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
}

impl ExecOutput {
    /// Whether the command exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Trait for container supervisors.
///
/// Supervisors are pure container plumbing: they know nothing about the
/// engine, its status machine or its files.
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Supervisor type identifier (e.g., "docker", "mock").
    fn supervisor_type(&self) -> &'static str;

    /// Create and start a container. A stopped container with the same name
    /// is removed first; a running one is left alone.
    async fn start(&self, spec: &ContainerSpec) -> Result<()>;

    /// Stop a container. Stopping a missing or stopped container succeeds.
    async fn stop(&self, name: &str) -> Result<()>;

    /// Restart a container.
    async fn restart(&self, name: &str) -> Result<()>;

    /// Current state. A missing container is [`ContainerState::NotFound`].
    async fn state(&self, name: &str) -> Result<ContainerState>;

    /// Last `tail` log lines.
    async fn logs(&self, name: &str, tail: usize) -> Result<Vec<String>>;

    /// Run a command inside a running container.
    async fn exec(&self, name: &str, command: &[String], timeout: Duration) -> Result<ExecOutput>;

    /// Run a sidecar to completion and collect its output.
    async fn run_oneshot(&self, spec: &OneshotSpec) -> Result<OneshotOutput>;

    /// Remove a container. Removing a missing container succeeds.
    async fn remove(&self, name: &str) -> Result<()>;
}
