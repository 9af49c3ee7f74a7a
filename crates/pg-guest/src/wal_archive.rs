// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! WAL archive space reclamation.
//!
//! Archived segment names are 24 zero-padded hex characters, so sorting
//! names lexicographically sorts them chronologically. A completed base
//! backup leaves a history file `<segment>.<offset>.backup`; every segment
//! sorting below that history file's segment is no longer needed for
//! recovery from the newest backup.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::os;

/// Length of a WAL segment file name.
pub const SEGMENT_NAME_LEN: usize = 24;

/// Suffix of backup history files.
pub const BACKUP_HISTORY_SUFFIX: &str = ".backup";

/// Outcome of one reclamation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    /// Archive size before reclamation
    pub size_before: u64,
    /// Archive size afterwards
    pub size_after: u64,
    /// Files deleted
    pub removed: Vec<String>,
    /// Whether the keep-newest-only pass ran
    pub forced: bool,
}

/// Segment prefix of an archive file name, if it has one.
fn segment_prefix(name: &str) -> Option<&str> {
    let prefix = name.get(..SEGMENT_NAME_LEN)?;
    prefix
        .bytes()
        .all(|b| b.is_ascii_hexdigit())
        .then_some(prefix)
}

fn is_segment(name: &str) -> bool {
    name.len() == SEGMENT_NAME_LEN && segment_prefix(name).is_some()
}

/// Enforces the space bound on the WAL archive directory.
#[derive(Debug, Clone)]
pub struct WalArchiveManager {
    archive_dir: PathBuf,
}

impl WalArchiveManager {
    /// Manage the archive at `archive_dir`.
    pub fn new(archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            archive_dir: archive_dir.into(),
        }
    }

    /// Archive directory.
    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    /// Current archive size in bytes; 0 if the directory is missing or unreadable.
    pub async fn size(&self) -> u64 {
        match os::dir_size(&self.archive_dir).await {
            Ok(size) => size,
            Err(e) => {
                warn!(path = %self.archive_dir.display(), error = %e, "Failed to size WAL archive");
                0
            }
        }
    }

    /// Bring the archive under half of `volume_size`.
    ///
    /// Never fails: a missing directory is a no-op and files that cannot be
    /// removed are logged and skipped.
    pub async fn reclaim(&self, volume_size: u64) -> ReclaimReport {
        let bound = volume_size / 2;
        let size_before = self.size().await;
        let mut report = ReclaimReport {
            size_before,
            size_after: size_before,
            ..Default::default()
        };
        if size_before <= bound {
            debug!(size = size_before, bound, "WAL archive within bound");
            return report;
        }

        info!(size = size_before, bound, "WAL archive over bound, reclaiming");
        report.removed.extend(self.remove_wals(false).await);
        report.size_after = self.size().await;

        if report.size_after > bound {
            info!(size = report.size_after, bound, "WAL archive still over bound, keeping newest segment only");
            report.forced = true;
            report.removed.extend(self.remove_wals(true).await);
            report.size_after = self.size().await;
        }

        info!(
            removed = report.removed.len(),
            size_before = report.size_before,
            size_after = report.size_after,
            forced = report.forced,
            "WAL archive reclaimed"
        );
        report
    }

    /// Archive file names, newest first.
    async fn names_descending(&self) -> Vec<String> {
        let mut names = match os::list_names(&self.archive_dir).await {
            Ok(names) => names,
            Err(e) => {
                warn!(path = %self.archive_dir.display(), error = %e, "Failed to list WAL archive");
                return Vec::new();
            }
        };
        names.reverse();
        names
    }

    /// One deletion pass. Without `force`, everything older than the newest
    /// backup history file goes; with `force`, everything but the newest
    /// segment goes.
    async fn remove_wals(&self, force: bool) -> Vec<String> {
        let names = self.names_descending().await;

        let keep_from = if force {
            names.iter().find(|n| is_segment(n)).cloned()
        } else {
            names
                .iter()
                .find(|n| n.ends_with(BACKUP_HISTORY_SUFFIX))
                .and_then(|n| segment_prefix(n))
                .map(str::to_string)
        };
        let Some(keep_from) = keep_from else {
            debug!(force, "No reference file in WAL archive, nothing to remove");
            return Vec::new();
        };

        let mut removed = Vec::new();
        for name in &names {
            let doomed = match segment_prefix(name) {
                Some(prefix) if force => name != &keep_from && prefix <= keep_from.as_str(),
                Some(prefix) => prefix < keep_from.as_str(),
                None => false,
            };
            if !doomed {
                continue;
            }
            let path = self.archive_dir.join(name);
            match fs::remove_file(&path).await {
                Ok(()) => removed.push(name.clone()),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove archived WAL file"),
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_prefix() {
        assert_eq!(
            segment_prefix("000000010000000000000010.00000028.backup"),
            Some("000000010000000000000010")
        );
        assert_eq!(segment_prefix("00000002.history"), None);
        assert_eq!(segment_prefix("archive_status_xxxxxxxxxxxxxxxxxx"), None);
        assert!(is_segment("00000001000000000000000A"));
        assert!(!is_segment("000000010000000000000010.00000028.backup"));
    }

    #[tokio::test]
    async fn test_missing_directory_is_noop() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = WalArchiveManager::new(dir.path().join("missing"));
        let report = manager.reclaim(0).await;
        assert!(report.removed.is_empty());
        assert_eq!(report.size_before, 0);
    }

    #[tokio::test]
    async fn test_empty_archive_is_noop() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = WalArchiveManager::new(dir.path());
        let report = manager.reclaim(0).await;
        assert_eq!(report, ReclaimReport::default());
    }

    #[tokio::test]
    async fn test_under_bound_leaves_archive_alone() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("000000010000000000000001"), b"wal").unwrap();
        let report = WalArchiveManager::new(dir.path()).reclaim(1024).await;
        assert!(report.removed.is_empty());
        assert!(dir.path().join("000000010000000000000001").exists());
    }

    #[tokio::test]
    async fn test_without_history_file_only_force_removes() {
        let dir = tempfile::TempDir::new().unwrap();
        for seg in ["000000010000000000000001", "000000010000000000000002"] {
            std::fs::write(dir.path().join(seg), [0u8; 100]).unwrap();
        }
        let report = WalArchiveManager::new(dir.path()).reclaim(100).await;
        assert!(report.forced);
        assert_eq!(report.removed, vec!["000000010000000000000001".to_string()]);
    }
}
