// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service status state machine.
//!
//! ```text
//!   NEW ──prepare──► BUILDING ──┬──► HEALTHY ◄──► RUNNING / SHUTDOWN / PAUSED
//!                               │       │          CRASHED / BLOCKED / UNKNOWN
//!                               │       └──► RESTART_REQUIRED ──restart──► HEALTHY
//!                               └──► FAILED (until the next prepare)
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::supervisor::ContainerState;

/// Status reported to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    /// Nothing has happened yet.
    New,
    /// Prepare is running.
    Building,
    /// Engine up and answering queries.
    Healthy,
    /// Container up, liveness probe failing.
    Running,
    /// Container stopped or missing.
    Shutdown,
    /// Container paused.
    Paused,
    /// Container dead.
    Crashed,
    /// Liveness probe timed out.
    Blocked,
    /// Prepare or restore failed.
    Failed,
    /// Configuration changed in a way that needs a restart.
    RestartRequired,
    /// Container state not recognized.
    Unknown,
}

/// Outcome of the in-container liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// `SELECT 1` succeeded.
    Ok,
    /// `SELECT 1` failed.
    Failed,
    /// `SELECT 1` did not answer in time.
    TimedOut,
}

impl ServiceStatus {
    /// Map container state and probe outcome onto a status.
    pub fn from_container(state: &ContainerState, probe: ProbeResult) -> Self {
        match state {
            ContainerState::Running => match probe {
                ProbeResult::Ok => ServiceStatus::Healthy,
                ProbeResult::Failed => ServiceStatus::Running,
                ProbeResult::TimedOut => ServiceStatus::Blocked,
            },
            ContainerState::Created | ContainerState::Exited | ContainerState::NotFound => {
                ServiceStatus::Shutdown
            }
            ContainerState::Paused => ServiceStatus::Paused,
            ContainerState::Dead => ServiceStatus::Crashed,
            ContainerState::Restarting | ContainerState::Unknown(_) => ServiceStatus::Unknown,
        }
    }

    /// Upper-case wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::New => "NEW",
            ServiceStatus::Building => "BUILDING",
            ServiceStatus::Healthy => "HEALTHY",
            ServiceStatus::Running => "RUNNING",
            ServiceStatus::Shutdown => "SHUTDOWN",
            ServiceStatus::Paused => "PAUSED",
            ServiceStatus::Crashed => "CRASHED",
            ServiceStatus::Blocked => "BLOCKED",
            ServiceStatus::Failed => "FAILED",
            ServiceStatus::RestartRequired => "RESTART_REQUIRED",
            ServiceStatus::Unknown => "UNKNOWN",
        }
    }

    /// Whether the engine process is up (possibly unhealthy).
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            ServiceStatus::Healthy
                | ServiceStatus::Running
                | ServiceStatus::Blocked
                | ServiceStatus::RestartRequired
        )
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Holder of the current status.
///
/// Only the dispatch path mutates it, so no locking happens here.
#[derive(Debug)]
pub struct StatusTracker {
    current: ServiceStatus,
    installing: bool,
    prepare_marker: PathBuf,
}

impl StatusTracker {
    /// Create a tracker; `prepare_marker` records a completed prepare across restarts.
    pub fn new(prepare_marker: PathBuf) -> Self {
        Self {
            current: ServiceStatus::New,
            installing: false,
            prepare_marker,
        }
    }

    /// Current status.
    pub fn current(&self) -> ServiceStatus {
        self.current
    }

    /// Whether prepare has completed on this guest.
    pub fn is_installed(&self) -> bool {
        self.prepare_marker.exists()
    }

    /// Whether prepare is in progress.
    pub fn is_installing(&self) -> bool {
        self.installing
    }

    /// Enter BUILDING and suppress the periodic probe.
    pub fn begin_install(&mut self) {
        info!("Beginning install");
        self.installing = true;
        self.current = ServiceStatus::Building;
    }

    /// Leave BUILDING, landing in FAILED or `final_status`.
    pub async fn end_install(&mut self, error_occurred: bool, final_status: ServiceStatus) {
        self.installing = false;
        if error_occurred {
            info!("Install ended with an error");
            self.current = ServiceStatus::Failed;
            return;
        }
        if let Err(e) = tokio::fs::write(&self.prepare_marker, b"").await {
            tracing::warn!(error = %e, "Failed to write prepare marker");
        }
        info!(status = %final_status, "Install completed");
        self.current = final_status;
    }

    /// Record a status observed by the probe or set by a transition.
    ///
    /// FAILED only yields to `force`; RESTART_REQUIRED survives probes that
    /// find the engine still up.
    pub fn set_status(&mut self, status: ServiceStatus, force: bool) {
        if !force {
            if self.current == ServiceStatus::Failed {
                return;
            }
            if self.current == ServiceStatus::RestartRequired && status.is_running() {
                return;
            }
        }
        if self.current != status {
            debug!(from = %self.current, to = %status, "Status change");
        }
        self.current = status;
    }

    /// Record an explicit start, stop or restart.
    ///
    /// Clears RESTART_REQUIRED; FAILED stays until the next prepare or restore.
    pub fn transition(&mut self, status: ServiceStatus) {
        if self.current == ServiceStatus::Failed {
            debug!(to = %status, "Status stays FAILED");
            return;
        }
        self.set_status(status, true);
    }
}
