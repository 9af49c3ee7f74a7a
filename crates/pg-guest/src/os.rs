// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Filesystem helpers for engine-owned files.
//!
//! The controller is the only writer of the configuration tree, the data
//! directory and the WAL archive. Writes go through a temporary file that is
//! renamed into place, then ownership and mode are fixed up.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::unistd::{Gid, Uid};
use rand::Rng;
use rand::distributions::Alphanumeric;
use tokio::fs;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Mode for credential-bearing files.
pub const MODE_SECRET: u32 = 0o600;
/// Mode for group-readable configuration files.
pub const MODE_CONFIG: u32 = 0o640;
/// Mode for engine directories.
pub const MODE_PRIVATE_DIR: u32 = 0o700;

/// uid/gid pair applied to engine files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    /// Owning user id
    pub uid: u32,
    /// Owning group id
    pub gid: u32,
}

impl Owner {
    /// Create an owner from raw ids.
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    /// The uid/gid of the running process.
    pub fn current() -> Self {
        Self {
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }
}

/// Change ownership of a single path.
pub fn chown(path: &Path, owner: Owner) -> Result<()> {
    nix::unistd::chown(
        path,
        Some(Uid::from_raw(owner.uid)),
        Some(Gid::from_raw(owner.gid)),
    )
    .map_err(|e| Error::Io(std::io::Error::from(e)))
}

/// Change ownership of a directory tree.
pub async fn chown_recursive(path: &Path, owner: Owner) -> Result<()> {
    let mut stack = vec![path.to_path_buf()];
    while let Some(current) = stack.pop() {
        chown(&current, owner)?;
        let metadata = fs::symlink_metadata(&current).await?;
        if metadata.is_dir() {
            let mut entries = fs::read_dir(&current).await?;
            while let Some(entry) = entries.next_entry().await? {
                stack.push(entry.path());
            }
        }
    }
    Ok(())
}

/// Set the permission bits of a path.
pub async fn chmod(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

/// Create a directory (and parents), then fix owner and mode.
pub async fn ensure_dir(path: &Path, owner: Owner, mode: u32) -> Result<()> {
    fs::create_dir_all(path).await?;
    chown(path, owner)?;
    chmod(path, mode).await
}

fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4().simple()))
}

/// Write a file atomically: temp file, chown, chmod, rename.
///
/// The temporary file is removed if any step fails, so a failed write never
/// leaves partial files next to the target.
pub async fn write_atomic(path: &Path, contents: &[u8], owner: Owner, mode: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp = temp_path_for(path);
    let result = async {
        fs::write(&tmp, contents).await?;
        chown(&tmp, owner)?;
        chmod(&tmp, mode).await?;
        fs::rename(&tmp, path).await?;
        Ok::<(), Error>(())
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&tmp).await;
    }
    result
}

/// Create an empty file owned by `owner`, leaving existing contents alone.
pub async fn touch(path: &Path, owner: Owner) -> Result<()> {
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    chown(path, owner)
}

/// Remove every entry inside `dir` without removing `dir` itself.
///
/// A missing directory is treated as already empty.
pub async fn remove_dir_contents(dir: &Path) -> Result<()> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            fs::remove_dir_all(&path).await?;
        } else {
            fs::remove_file(&path).await?;
        }
    }
    debug!(path = %dir.display(), "Removed directory contents");
    Ok(())
}

/// Total size in bytes of the regular files directly inside `dir`.
pub async fn dir_size(dir: &Path) -> Result<u64> {
    let mut total = 0u64;
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        match entry.metadata().await {
            Ok(metadata) if metadata.is_file() => total += metadata.len(),
            Ok(_) => {}
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "Failed to stat file");
            }
        }
    }
    Ok(total)
}

/// Sorted names of the entries directly inside `dir`.
pub async fn list_names(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

/// Generate a random alphanumeric password.
pub fn generate_password(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Length of generated passwords.
pub const PASSWORD_LENGTH: usize = 28;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_atomic_sets_mode_and_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("secret.cnf");

        write_atomic(&path, b"pw", Owner::current(), MODE_SECRET)
            .await
            .unwrap();

        let metadata = std::fs::metadata(&path).unwrap();
        assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
        assert_eq!(std::fs::read(&path).unwrap(), b"pw");
        assert_eq!(list_names(dir.path()).await.unwrap(), vec!["secret.cnf"]);
    }

    #[tokio::test]
    async fn test_remove_dir_contents_keeps_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a"), "1").unwrap();
        std::fs::create_dir_all(dir.path().join("nested/deeper")).unwrap();

        remove_dir_contents(dir.path()).await.unwrap();

        assert!(dir.path().exists());
        assert!(list_names(dir.path()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_dir_contents_missing_dir_is_noop() {
        let dir = TempDir::new().unwrap();
        remove_dir_contents(&dir.path().join("missing")).await.unwrap();
    }

    #[tokio::test]
    async fn test_dir_size_counts_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a"), vec![0u8; 10]).unwrap();
        std::fs::write(dir.path().join("b"), vec![0u8; 5]).unwrap();
        assert_eq!(dir_size(dir.path()).await.unwrap(), 15);
    }

    #[test]
    fn test_generate_password() {
        let a = generate_password(PASSWORD_LENGTH);
        let b = generate_password(PASSWORD_LENGTH);
        assert_eq!(a.len(), 28);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }
}
