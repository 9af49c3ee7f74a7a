// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker CLI supervisor.
//!
//! Drives the `docker` binary through `tokio::process::Command`. Every
//! invocation carries a timeout; the child is killed when it elapses.

use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::traits::{
    ContainerSpec, ContainerState, ExecOutput, OneshotOutput, OneshotSpec, Result, Supervisor,
    SupervisorError, VolumeMount,
};
use crate::os::Owner;

/// Docker supervisor configuration
#[derive(Debug, Clone)]
pub struct DockerSupervisorConfig {
    /// Path or name of the docker binary
    pub docker_bin: String,
    /// Grace period passed to `docker stop` / `docker restart`
    pub stop_timeout: Duration,
    /// Upper bound for plain CLI calls (inspect, rm, logs)
    pub command_timeout: Duration,
    /// Upper bound for sidecars that do not set their own
    pub oneshot_timeout: Duration,
}

impl Default for DockerSupervisorConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            stop_timeout: Duration::from_secs(60),
            command_timeout: Duration::from_secs(120),
            oneshot_timeout: Duration::from_secs(6 * 3600),
        }
    }
}

/// Supervisor backed by the docker CLI.
pub struct DockerSupervisor {
    config: DockerSupervisorConfig,
}

fn user_arg(owner: Owner) -> String {
    format!("{}:{}", owner.uid, owner.gid)
}

fn volume_arg(volume: &VolumeMount) -> String {
    let mut arg = format!("{}:{}", volume.host.display(), volume.container);
    if volume.read_only {
        arg.push_str(":ro");
    }
    arg
}

fn is_missing(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("no such container") || stderr.contains("no such object")
}

fn is_daemon_down(stderr: &str) -> bool {
    stderr.contains("Cannot connect to the Docker daemon")
        || stderr.contains("Is the docker daemon running")
}

fn output_lines(output: &Output) -> Vec<String> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .chain(String::from_utf8_lossy(&output.stderr).lines())
        .map(str::to_string)
        .collect()
}

/// Arguments for `docker run` of a long-running container.
pub(crate) fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        spec.name.clone(),
    ];
    if spec.host_network {
        args.extend(["--network".to_string(), "host".to_string()]);
    } else {
        for (host, container) in &spec.ports {
            args.extend(["-p".to_string(), format!("{}:{}", host, container)]);
        }
    }
    if let Some(owner) = spec.user {
        args.extend(["--user".to_string(), user_arg(owner)]);
    }
    for volume in &spec.volumes {
        args.extend(["-v".to_string(), volume_arg(volume)]);
    }
    for (key, value) in &spec.env {
        args.extend(["-e".to_string(), format!("{}={}", key, value)]);
    }
    args.push(spec.image.clone());
    if let Some(command) = &spec.command {
        args.extend(command.iter().cloned());
    }
    args
}

/// Arguments for `docker run --rm` of a sidecar.
pub(crate) fn oneshot_args(spec: &OneshotSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--network".to_string(),
        "host".to_string(),
    ];
    if let Some(owner) = spec.user {
        args.extend(["--user".to_string(), user_arg(owner)]);
    }
    for volume in &spec.volumes {
        args.extend(["-v".to_string(), volume_arg(volume)]);
    }
    for (key, value) in &spec.env {
        args.extend(["-e".to_string(), format!("{}={}", key, value)]);
    }
    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

impl DockerSupervisor {
    /// Create a new docker supervisor.
    pub fn new(config: DockerSupervisorConfig) -> Self {
        Self { config }
    }

    /// Run the CLI and collect its output.
    async fn docker(&self, args: &[String], timeout: Duration) -> Result<Output> {
        let mut cmd = Command::new(&self.config.docker_bin);
        cmd.args(args).kill_on_drop(true);
        debug!(args = ?args, "Running docker");

        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SupervisorError::DaemonUnavailable(format!(
                    "{} not found",
                    self.config.docker_bin
                )));
            }
            Ok(Err(e)) => return Err(SupervisorError::Io(e)),
            Err(_) => return Err(SupervisorError::Timeout(timeout)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if is_daemon_down(&stderr) {
                return Err(SupervisorError::DaemonUnavailable(stderr));
            }
        }
        Ok(output)
    }

    fn exit_error(output: &Output) -> SupervisorError {
        SupervisorError::ExitCode {
            exit_code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }

    fn stop_secs(&self) -> String {
        self.config.stop_timeout.as_secs().to_string()
    }
}

#[async_trait]
impl Supervisor for DockerSupervisor {
    fn supervisor_type(&self) -> &'static str {
        "docker"
    }

    async fn start(&self, spec: &ContainerSpec) -> Result<()> {
        match self.state(&spec.name).await? {
            ContainerState::Running => {
                debug!(name = %spec.name, "Container already running");
                return Ok(());
            }
            ContainerState::NotFound => {}
            state => {
                info!(name = %spec.name, ?state, "Removing stale container");
                self.remove(&spec.name).await?;
            }
        }

        let output = self
            .docker(&run_args(spec), self.config.command_timeout)
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(SupervisorError::StartFailed(stderr));
        }
        info!(name = %spec.name, image = %spec.image, "Container started");
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let args = [
            "stop".to_string(),
            "-t".to_string(),
            self.stop_secs(),
            name.to_string(),
        ];
        let output = self
            .docker(&args, self.config.stop_timeout + self.config.command_timeout)
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing(&stderr) {
                debug!(name, "Container already gone");
                return Ok(());
            }
            return Err(Self::exit_error(&output));
        }
        info!(name, "Container stopped");
        Ok(())
    }

    async fn restart(&self, name: &str) -> Result<()> {
        let args = [
            "restart".to_string(),
            "-t".to_string(),
            self.stop_secs(),
            name.to_string(),
        ];
        let output = self
            .docker(&args, self.config.stop_timeout + self.config.command_timeout)
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing(&stderr) {
                return Err(SupervisorError::NotFound(name.to_string()));
            }
            return Err(Self::exit_error(&output));
        }
        info!(name, "Container restarted");
        Ok(())
    }

    async fn state(&self, name: &str) -> Result<ContainerState> {
        let args = [
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Status}}".to_string(),
            name.to_string(),
        ];
        let output = self.docker(&args, self.config.command_timeout).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing(&stderr) {
                return Ok(ContainerState::NotFound);
            }
            return Err(Self::exit_error(&output));
        }
        Ok(ContainerState::parse(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }

    async fn logs(&self, name: &str, tail: usize) -> Result<Vec<String>> {
        let args = [
            "logs".to_string(),
            "--tail".to_string(),
            tail.to_string(),
            name.to_string(),
        ];
        let output = self.docker(&args, self.config.command_timeout).await?;
        if !output.status.success() {
            if is_missing(&String::from_utf8_lossy(&output.stderr)) {
                return Err(SupervisorError::NotFound(name.to_string()));
            }
            return Err(Self::exit_error(&output));
        }
        Ok(output_lines(&output))
    }

    async fn exec(&self, name: &str, command: &[String], timeout: Duration) -> Result<ExecOutput> {
        let mut args = vec!["exec".to_string(), name.to_string()];
        args.extend(command.iter().cloned());
        let output = self.docker(&args, timeout).await?;
        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn run_oneshot(&self, spec: &OneshotSpec) -> Result<OneshotOutput> {
        self.remove(&spec.name).await?;

        let timeout = spec.timeout.unwrap_or(self.config.oneshot_timeout);
        info!(name = %spec.name, image = %spec.image, "Running sidecar");
        let output = self.docker(&oneshot_args(spec), timeout).await?;
        let success = output.status.success();
        if !success {
            warn!(
                name = %spec.name,
                exit_code = ?output.status.code(),
                "Sidecar exited with an error"
            );
        }
        Ok(OneshotOutput {
            lines: output_lines(&output),
            success,
        })
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let args = ["rm".to_string(), "-f".to_string(), name.to_string()];
        let output = self.docker(&args, self.config.command_timeout).await?;
        if !output.status.success() && !is_missing(&String::from_utf8_lossy(&output.stderr)) {
            return Err(Self::exit_error(&output));
        }
        Ok(())
    }
}
