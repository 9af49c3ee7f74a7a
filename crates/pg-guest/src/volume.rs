// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Data volume helpers: mount, resize, freeze, statistics.
//!
//! The volume is provisioned and attached by the control plane; these
//! helpers only drive the standard util-linux / e2fsprogs tools.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::os::{self, Owner};

/// External tools used on the data volume.
#[derive(Debug, Clone)]
pub struct VolumeTools {
    /// `mount`
    pub mount: String,
    /// `umount`
    pub umount: String,
    /// `e2fsck`
    pub fsck: String,
    /// `resize2fs`
    pub resize: String,
    /// `fsfreeze`
    pub fsfreeze: String,
    /// `sync`
    pub sync: String,
    /// Upper bound for each tool invocation
    pub timeout: Duration,
}

impl Default for VolumeTools {
    fn default() -> Self {
        Self {
            mount: "mount".to_string(),
            umount: "umount".to_string(),
            fsck: "e2fsck".to_string(),
            resize: "resize2fs".to_string(),
            fsfreeze: "fsfreeze".to_string(),
            sync: "sync".to_string(),
            timeout: Duration::from_secs(600),
        }
    }
}

impl VolumeTools {
    /// Every tool replaced by `bin` (tests use `true`/`false`).
    pub fn all(bin: &str) -> Self {
        Self {
            mount: bin.to_string(),
            umount: bin.to_string(),
            fsck: bin.to_string(),
            resize: bin.to_string(),
            fsfreeze: bin.to_string(),
            sync: bin.to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<()> {
        debug!(program, args = ?args, "Running volume tool");
        let mut cmd = Command::new(program);
        cmd.args(args).kill_on_drop(true);
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| Error::PollTimeout(format!("{} {}", program, args.join(" "))))??;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Error::Other(format!(
                "{} {} failed: {}",
                program,
                args.join(" "),
                stderr
            )));
        }
        Ok(())
    }

    /// Mount `device` on `mount_point`, creating the directory.
    pub async fn mount(&self, device: &str, mount_point: &Path, owner: Owner) -> Result<()> {
        tokio::fs::create_dir_all(mount_point).await?;
        let target = mount_point.to_string_lossy();
        self.run(&self.mount, &[device, &*target]).await?;
        os::chown(mount_point, owner)?;
        info!(device, mount_point = %mount_point.display(), "Volume mounted");
        Ok(())
    }

    /// Unmount `mount_point`.
    pub async fn unmount(&self, mount_point: &Path) -> Result<()> {
        self.run(&self.umount, &[&*mount_point.to_string_lossy()])
            .await?;
        info!(mount_point = %mount_point.display(), "Volume unmounted");
        Ok(())
    }

    /// Grow the filesystem on `device` to the device size, then remount.
    pub async fn resize(&self, device: &str, mount_point: &Path, owner: Owner) -> Result<()> {
        self.unmount(mount_point).await?;
        self.run(&self.fsck, &["-f", "-y", device]).await?;
        self.run(&self.resize, &[device]).await?;
        self.mount(device, mount_point, owner).await?;
        info!(device, "Filesystem resized");
        Ok(())
    }

    /// Flush dirty pages to disk.
    pub async fn sync(&self) -> Result<()> {
        self.run(&self.sync, &[]).await
    }

    /// Sync and freeze `mount_point`.
    ///
    /// The returned guard thaws the filesystem when released or dropped.
    pub async fn freeze(&self, mount_point: &Path) -> Result<FreezeGuard> {
        self.sync().await?;
        self.run(&self.fsfreeze, &["-f", &*mount_point.to_string_lossy()])
            .await?;
        info!(mount_point = %mount_point.display(), "Filesystem frozen");
        Ok(FreezeGuard {
            mount_point: mount_point.to_path_buf(),
            tools: self.clone(),
            active: true,
        })
    }
}

/// A frozen filesystem. Thawed on [`release`](FreezeGuard::release) or drop.
pub struct FreezeGuard {
    mount_point: PathBuf,
    tools: VolumeTools,
    active: bool,
}

impl FreezeGuard {
    /// Mount point held frozen.
    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Thaw the filesystem.
    pub async fn release(mut self) -> Result<()> {
        self.active = false;
        let target = self.mount_point.to_string_lossy().into_owned();
        self.tools.run(&self.tools.fsfreeze, &["-u", target.as_str()]).await?;
        info!(mount_point = %target, "Filesystem thawed");
        Ok(())
    }
}

impl Drop for FreezeGuard {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        warn!(mount_point = %self.mount_point.display(), "Thawing filesystem on drop");
        let status = std::process::Command::new(&self.tools.fsfreeze)
            .arg("-u")
            .arg(&self.mount_point)
            .status();
        if let Err(e) = status {
            error!(error = %e, "Failed to thaw filesystem");
        }
    }
}

/// Filesystem usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemStats {
    /// Fundamental block size
    pub block_size: u64,
    /// Total blocks
    pub total_blocks: u64,
    /// Free blocks
    pub free_blocks: u64,
    /// Total size in bytes
    pub total: u64,
    /// Free bytes
    pub free: u64,
    /// Used bytes
    pub used: u64,
}

/// Usage of the filesystem holding `path`.
pub fn filesystem_stats(path: &Path) -> Result<FilesystemStats> {
    let stat = nix::sys::statvfs::statvfs(path).map_err(|e| Error::Io(std::io::Error::from(e)))?;
    let block_size = stat.fragment_size() as u64;
    let total_blocks = stat.blocks() as u64;
    let free_blocks = stat.blocks_free() as u64;
    let total = total_blocks * block_size;
    let free = free_blocks * block_size;
    Ok(FilesystemStats {
        block_size,
        total_blocks,
        free_blocks,
        total,
        free,
        used: total.saturating_sub(free),
    })
}
