// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock supervisor for testing.
//!
//! Simulates containers in memory and records every call so tests can assert
//! on what the controller asked the daemon to do.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::traits::*;

/// A recorded supervisor call.
#[derive(Debug, Clone)]
pub enum SupervisorCall {
    /// `start`
    Start(ContainerSpec),
    /// `stop`
    Stop(String),
    /// `restart`
    Restart(String),
    /// `exec`
    Exec {
        /// Container name
        name: String,
        /// Command
        command: Vec<String>,
    },
    /// `run_oneshot`
    Oneshot(OneshotSpec),
    /// `remove`
    Remove(String),
}

/// Mock supervisor for testing.
pub struct MockSupervisor {
    containers: Mutex<HashMap<String, ContainerState>>,
    calls: Mutex<Vec<SupervisorCall>>,
    oneshot_outputs: Mutex<HashMap<String, OneshotOutput>>,
    /// If true, `start` fails as if the container could not be created
    pub fail_start: AtomicBool,
    /// If true, the in-container probe fails
    pub probe_fails: AtomicBool,
    /// If true, the in-container probe times out
    pub probe_hangs: AtomicBool,
    /// If true, every call fails as if the daemon were down
    pub daemon_down: AtomicBool,
}

impl Default for MockSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSupervisor {
    /// Create a new mock supervisor.
    pub fn new() -> Self {
        Self {
            containers: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            oneshot_outputs: Mutex::new(HashMap::new()),
            fail_start: AtomicBool::new(false),
            probe_fails: AtomicBool::new(false),
            probe_hangs: AtomicBool::new(false),
            daemon_down: AtomicBool::new(false),
        }
    }

    /// Force a container into `state`.
    pub async fn set_state(&self, name: &str, state: ContainerState) {
        self.containers.lock().await.insert(name.to_string(), state);
    }

    /// Output returned by the next sidecars named `name`.
    pub async fn set_oneshot_output(&self, name: &str, output: OneshotOutput) {
        self.oneshot_outputs
            .lock()
            .await
            .insert(name.to_string(), output);
    }

    /// Every call recorded so far.
    pub async fn calls(&self) -> Vec<SupervisorCall> {
        self.calls.lock().await.clone()
    }

    /// Sidecars run so far.
    pub async fn oneshots(&self) -> Vec<OneshotSpec> {
        self.calls
            .lock()
            .await
            .iter()
            .filter_map(|c| match c {
                SupervisorCall::Oneshot(spec) => Some(spec.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of `start` calls.
    pub async fn start_count(&self) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| matches!(c, SupervisorCall::Start(_)))
            .count()
    }

    /// Forget recorded calls.
    pub async fn clear_calls(&self) {
        self.calls.lock().await.clear();
    }

    async fn record(&self, call: SupervisorCall) -> Result<()> {
        if self.daemon_down.load(Ordering::SeqCst) {
            return Err(SupervisorError::DaemonUnavailable("mock daemon down".into()));
        }
        self.calls.lock().await.push(call);
        Ok(())
    }
}

#[async_trait]
impl Supervisor for MockSupervisor {
    fn supervisor_type(&self) -> &'static str {
        "mock"
    }

    async fn start(&self, spec: &ContainerSpec) -> Result<()> {
        self.record(SupervisorCall::Start(spec.clone())).await?;
        let mut containers = self.containers.lock().await;
        if self.fail_start.load(Ordering::SeqCst) {
            containers.insert(spec.name.clone(), ContainerState::Exited);
            return Err(SupervisorError::StartFailed("mock start failure".into()));
        }
        containers.insert(spec.name.clone(), ContainerState::Running);
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.record(SupervisorCall::Stop(name.to_string())).await?;
        if let Some(state) = self.containers.lock().await.get_mut(name) {
            *state = ContainerState::Exited;
        }
        Ok(())
    }

    async fn restart(&self, name: &str) -> Result<()> {
        self.record(SupervisorCall::Restart(name.to_string())).await?;
        match self.containers.lock().await.get_mut(name) {
            Some(state) => {
                *state = ContainerState::Running;
                Ok(())
            }
            None => Err(SupervisorError::NotFound(name.to_string())),
        }
    }

    async fn state(&self, name: &str) -> Result<ContainerState> {
        if self.daemon_down.load(Ordering::SeqCst) {
            return Err(SupervisorError::DaemonUnavailable("mock daemon down".into()));
        }
        Ok(self
            .containers
            .lock()
            .await
            .get(name)
            .cloned()
            .unwrap_or(ContainerState::NotFound))
    }

    async fn logs(&self, name: &str, tail: usize) -> Result<Vec<String>> {
        if !self.containers.lock().await.contains_key(name) {
            return Err(SupervisorError::NotFound(name.to_string()));
        }
        Ok((0..tail.min(3)).map(|i| format!("mock log line {}", i)).collect())
    }

    async fn exec(&self, name: &str, command: &[String], timeout: Duration) -> Result<ExecOutput> {
        self.record(SupervisorCall::Exec {
            name: name.to_string(),
            command: command.to_vec(),
        })
        .await?;
        if self.containers.lock().await.get(name) != Some(&ContainerState::Running) {
            return Ok(ExecOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: format!("container {} is not running", name),
            });
        }
        if self.probe_hangs.load(Ordering::SeqCst) {
            return Err(SupervisorError::Timeout(timeout));
        }
        if self.probe_fails.load(Ordering::SeqCst) {
            return Ok(ExecOutput {
                exit_code: 2,
                stdout: String::new(),
                stderr: "connection refused".to_string(),
            });
        }
        Ok(ExecOutput {
            exit_code: 0,
            stdout: "1\n".to_string(),
            stderr: String::new(),
        })
    }

    async fn run_oneshot(&self, spec: &OneshotSpec) -> Result<OneshotOutput> {
        self.record(SupervisorCall::Oneshot(spec.clone())).await?;
        Ok(self
            .oneshot_outputs
            .lock()
            .await
            .get(&spec.name)
            .cloned()
            .unwrap_or(OneshotOutput {
                lines: Vec::new(),
                success: true,
            }))
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.record(SupervisorCall::Remove(name.to_string())).await?;
        self.containers.lock().await.remove(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_lifecycle() {
        let supervisor = MockSupervisor::new();
        let spec = ContainerSpec {
            name: "database".to_string(),
            image: "postgres:16".to_string(),
            ..Default::default()
        };

        assert_eq!(
            supervisor.state("database").await.unwrap(),
            ContainerState::NotFound
        );
        supervisor.start(&spec).await.unwrap();
        assert_eq!(
            supervisor.state("database").await.unwrap(),
            ContainerState::Running
        );
        supervisor.stop("database").await.unwrap();
        supervisor.stop("database").await.unwrap();
        assert_eq!(
            supervisor.state("database").await.unwrap(),
            ContainerState::Exited
        );
        assert_eq!(supervisor.start_count().await, 1);
    }

    #[tokio::test]
    async fn test_mock_daemon_down() {
        let supervisor = MockSupervisor::new();
        supervisor.daemon_down.store(true, Ordering::SeqCst);
        assert!(supervisor.state("database").await.unwrap_err().is_unavailable());
    }
}
