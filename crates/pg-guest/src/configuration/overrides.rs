// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Override revision strategies.
//!
//! Two layouts are supported:
//!
//! | Strategy | Layout |
//! |----------|--------|
//! | [`ImportOverrideStrategy`] | one file per revision in a directory the base file includes |
//! | [`RollingOverrideStrategy`] | in-place edits of the live file with numbered `.old` backups |

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use super::codec::{ConfigCodec, ConfigDict, merge_into};
use crate::error::{Error, Result};
use crate::os::{self, MODE_CONFIG, Owner};

/// Change id used when the caller does not name one.
pub const DEFAULT_CHANGE_ID: &str = "common";

/// Owner of an override revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideGroup {
    /// Tenant-owned revisions.
    User,
    /// Controller-owned revisions; always win over user revisions.
    System,
}

impl OverrideGroup {
    /// File name prefix. The numeric part makes the engine's alphabetical
    /// include order match precedence.
    pub fn file_prefix(&self) -> &'static str {
        match self {
            OverrideGroup::User => "20-user",
            OverrideGroup::System => "50-system",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "20-user" => Some(OverrideGroup::User),
            "50-system" => Some(OverrideGroup::System),
            _ => None,
        }
    }
}

/// Storage of override revisions.
#[async_trait]
pub trait OverrideStrategy: Send + Sync {
    /// Apply `kv` as revision `change_id` of `group`.
    async fn apply(&self, group: OverrideGroup, change_id: &str, kv: &ConfigDict) -> Result<()>;

    /// Remove revision `change_id` of `group`, or every revision of the group.
    ///
    /// Returns the number of revisions removed.
    async fn remove(&self, group: OverrideGroup, change_id: Option<&str>) -> Result<usize>;

    /// Merge of all revisions in precedence order (user, then system).
    async fn parse_updates(&self) -> Result<ConfigDict>;

    /// Number of revisions in `group`.
    async fn count_revisions(&self, group: OverrideGroup) -> Result<usize>;

    /// Whether `group` holds revision `change_id`.
    async fn has_revision(&self, group: OverrideGroup, change_id: &str) -> Result<bool>;
}

static REVISION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(20-user|50-system)-(\d{3,})-(.+)\.([A-Za-z0-9]+)$").expect("static regex")
});

#[derive(Debug, Clone)]
struct Revision {
    group: OverrideGroup,
    sequence: u32,
    change_id: String,
    path: PathBuf,
}

fn validate_change_id(change_id: &str) -> Result<()> {
    if change_id.is_empty()
        || change_id.contains(['/', '\\'])
        || change_id.starts_with('.')
        || change_id.chars().any(char::is_whitespace)
    {
        return Err(Error::InvalidInput(format!(
            "invalid change id '{}'",
            change_id
        )));
    }
    Ok(())
}

/// Hidden name a revision file is moved to while a removal is in progress.
fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.removing", name))
}

/// One file per revision, named `<NN-group>-<NNN>-<change-id>.<ext>`.
pub struct ImportOverrideStrategy {
    dir: PathBuf,
    extension: String,
    codec: Arc<dyn ConfigCodec>,
    owner: Owner,
}

impl ImportOverrideStrategy {
    /// Create a strategy writing revisions into `dir`.
    pub fn new(dir: impl Into<PathBuf>, extension: &str, codec: Arc<dyn ConfigCodec>, owner: Owner) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.to_string(),
            codec,
            owner,
        }
    }

    /// Directory holding the revision files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn revisions(&self) -> Result<Vec<Revision>> {
        let mut revisions: Vec<Revision> = os::list_names(&self.dir)
            .await?
            .into_iter()
            .filter_map(|name| {
                let caps = REVISION_RE.captures(&name)?;
                if caps[4] != *self.extension {
                    return None;
                }
                Some(Revision {
                    group: OverrideGroup::from_prefix(&caps[1])?,
                    sequence: caps[2].parse().ok()?,
                    change_id: caps[3].to_string(),
                    path: self.dir.join(&name),
                })
            })
            .collect();
        revisions.sort_by(|a, b| {
            (a.group, a.sequence, &a.change_id).cmp(&(b.group, b.sequence, &b.change_id))
        });
        Ok(revisions)
    }

    async fn read_revision(&self, path: &Path) -> Result<ConfigDict> {
        let text = fs::read_to_string(path).await?;
        self.codec.parse(&text)
    }
}

#[async_trait]
impl OverrideStrategy for ImportOverrideStrategy {
    async fn apply(&self, group: OverrideGroup, change_id: &str, kv: &ConfigDict) -> Result<()> {
        validate_change_id(change_id)?;
        os::ensure_dir(&self.dir, self.owner, 0o750).await?;

        let revisions = self.revisions().await?;
        let existing = revisions
            .iter()
            .find(|r| r.group == group && r.change_id == change_id);

        let (path, contents) = match existing {
            Some(revision) => {
                let mut current = self.read_revision(&revision.path).await?;
                merge_into(&mut current, kv);
                (revision.path.clone(), current)
            }
            None => {
                let sequence = revisions
                    .iter()
                    .filter(|r| r.group == group)
                    .map(|r| r.sequence)
                    .max()
                    .unwrap_or(0)
                    + 1;
                let name = format!(
                    "{}-{:03}-{}.{}",
                    group.file_prefix(),
                    sequence,
                    change_id,
                    self.extension
                );
                (self.dir.join(name), kv.clone())
            }
        };

        os::write_atomic(
            &path,
            self.codec.render(&contents).as_bytes(),
            self.owner,
            MODE_CONFIG,
        )
        .await?;
        debug!(path = %path.display(), ?group, change_id, "Applied override revision");
        Ok(())
    }

    async fn remove(&self, group: OverrideGroup, change_id: Option<&str>) -> Result<usize> {
        let targets: Vec<Revision> = self
            .revisions()
            .await?
            .into_iter()
            .filter(|r| r.group == group && change_id.is_none_or(|id| r.change_id == id))
            .collect();
        if targets.is_empty() {
            return Ok(0);
        }

        // Move every target aside first so a failure leaves all of them in place.
        let mut staged: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(targets.len());
        for revision in &targets {
            let aside = staging_path(&revision.path);
            if let Err(e) = fs::rename(&revision.path, &aside).await {
                for (original, moved) in staged.iter().rev() {
                    if let Err(undo) = fs::rename(moved, original).await {
                        warn!(path = %original.display(), error = %undo, "Failed to restore override revision");
                    }
                }
                return Err(e.into());
            }
            staged.push((revision.path.clone(), aside));
        }
        for (_, moved) in &staged {
            if let Err(e) = fs::remove_file(moved).await {
                warn!(path = %moved.display(), error = %e, "Failed to delete removed override revision");
            }
        }

        info!(?group, change_id = ?change_id, removed = targets.len(), "Removed override revisions");
        Ok(targets.len())
    }

    async fn parse_updates(&self) -> Result<ConfigDict> {
        let mut merged = ConfigDict::new();
        for revision in self.revisions().await? {
            let dict = self.read_revision(&revision.path).await?;
            merge_into(&mut merged, &dict);
        }
        Ok(merged)
    }

    async fn count_revisions(&self, group: OverrideGroup) -> Result<usize> {
        Ok(self
            .revisions()
            .await?
            .iter()
            .filter(|r| r.group == group)
            .count())
    }

    async fn has_revision(&self, group: OverrideGroup, change_id: &str) -> Result<bool> {
        Ok(self
            .revisions()
            .await?
            .iter()
            .any(|r| r.group == group && r.change_id == change_id))
    }
}

/// Entry of the rolling strategy's revision ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RollingRevision {
    group: OverrideGroup,
    change_id: String,
    values: ConfigDict,
}

/// In-place edits of the live file with numbered `<name>.<NNN>.old` backups.
///
/// Backup `k` holds the live file as it was before revision `k`; backup
/// `000` is the untouched original. Revisions are recorded in a
/// `<name>.revisions` ledger so that any group or change id can be removed,
/// after which the live file and the newer backups are rebuilt from the
/// original.
pub struct RollingOverrideStrategy {
    live_file: PathBuf,
    codec: Arc<dyn ConfigCodec>,
    owner: Owner,
}

impl RollingOverrideStrategy {
    /// Create a strategy editing `live_file`.
    pub fn new(live_file: impl Into<PathBuf>, codec: Arc<dyn ConfigCodec>, owner: Owner) -> Self {
        Self {
            live_file: live_file.into(),
            codec,
            owner,
        }
    }

    fn sibling(&self, suffix: &str) -> PathBuf {
        let name = self
            .live_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.live_file.with_file_name(format!("{}{}", name, suffix))
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        self.sibling(&format!(".{:03}.old", index))
    }

    fn ledger_path(&self) -> PathBuf {
        self.sibling(".revisions")
    }

    async fn backup_count(&self) -> Result<usize> {
        let mut count = 0;
        while fs::try_exists(self.backup_path(count)).await? {
            count += 1;
        }
        Ok(count)
    }

    /// Number of applied revisions, which is also the number of backups.
    pub async fn current_revision(&self) -> Result<usize> {
        self.backup_count().await
    }

    async fn ledger(&self) -> Result<Vec<RollingRevision>> {
        match fs::read_to_string(self.ledger_path()).await {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Text of the live file before any revision was applied.
    async fn original(&self) -> Result<String> {
        for path in [self.backup_path(0), self.live_file.clone()] {
            match fs::read_to_string(&path).await {
                Ok(text) => return Ok(text),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(String::new())
    }

    /// Base merged with `revisions`, user group first, then system.
    fn effective(base: &ConfigDict, revisions: &[RollingRevision]) -> ConfigDict {
        let mut merged = base.clone();
        for group in [OverrideGroup::User, OverrideGroup::System] {
            for revision in revisions.iter().filter(|r| r.group == group) {
                merge_into(&mut merged, &revision.values);
            }
        }
        merged
    }

    /// Rewrite backups, ledger and live file for `revisions`.
    async fn commit(&self, original: &str, revisions: &[RollingRevision]) -> Result<()> {
        if revisions.is_empty() {
            let first = self.backup_path(0);
            if fs::try_exists(&first).await? {
                fs::rename(&first, &self.live_file).await?;
            }
            self.prune_backups(1).await?;
            if let Err(e) = fs::remove_file(self.ledger_path()).await
                && e.kind() != std::io::ErrorKind::NotFound
            {
                return Err(e.into());
            }
            return Ok(());
        }

        let base = self.codec.parse(original)?;
        os::write_atomic(&self.backup_path(0), original.as_bytes(), self.owner, MODE_CONFIG).await?;
        for index in 1..revisions.len() {
            let rendered = self.codec.render(&Self::effective(&base, &revisions[..index]));
            os::write_atomic(&self.backup_path(index), rendered.as_bytes(), self.owner, MODE_CONFIG)
                .await?;
        }
        self.prune_backups(revisions.len()).await?;

        let ledger = serde_json::to_vec_pretty(revisions)?;
        os::write_atomic(&self.ledger_path(), &ledger, self.owner, MODE_CONFIG).await?;
        let live = self.codec.render(&Self::effective(&base, revisions));
        os::write_atomic(&self.live_file, live.as_bytes(), self.owner, MODE_CONFIG).await?;
        Ok(())
    }

    /// Delete backups numbered `from` and above.
    async fn prune_backups(&self, from: usize) -> Result<()> {
        let mut index = from;
        loop {
            match fs::remove_file(self.backup_path(index)).await {
                Ok(()) => index += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[async_trait]
impl OverrideStrategy for RollingOverrideStrategy {
    async fn apply(&self, group: OverrideGroup, change_id: &str, kv: &ConfigDict) -> Result<()> {
        validate_change_id(change_id)?;
        let original = self.original().await?;
        let mut revisions = self.ledger().await?;
        match revisions
            .iter_mut()
            .find(|r| r.group == group && r.change_id == change_id)
        {
            Some(revision) => merge_into(&mut revision.values, kv),
            None => revisions.push(RollingRevision {
                group,
                change_id: change_id.to_string(),
                values: kv.clone(),
            }),
        }
        self.commit(&original, &revisions).await?;
        debug!(live = %self.live_file.display(), ?group, change_id, "Applied rolling override");
        Ok(())
    }

    async fn remove(&self, group: OverrideGroup, change_id: Option<&str>) -> Result<usize> {
        let mut revisions = self.ledger().await?;
        let before = revisions.len();
        revisions.retain(|r| r.group != group || change_id.is_some_and(|id| r.change_id != id));
        let removed = before - revisions.len();
        if removed == 0 {
            return Ok(0);
        }
        let original = self.original().await?;
        self.commit(&original, &revisions).await?;
        info!(?group, change_id = ?change_id, removed, "Removed rolling override revisions");
        Ok(removed)
    }

    async fn parse_updates(&self) -> Result<ConfigDict> {
        Ok(Self::effective(&ConfigDict::new(), &self.ledger().await?))
    }

    async fn count_revisions(&self, group: OverrideGroup) -> Result<usize> {
        Ok(self
            .ledger()
            .await?
            .iter()
            .filter(|r| r.group == group)
            .count())
    }

    async fn has_revision(&self, group: OverrideGroup, change_id: &str) -> Result<bool> {
        Ok(self
            .ledger()
            .await?
            .iter()
            .any(|r| r.group == group && r.change_id == change_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::codec::PostgresCodec;
    use serde_json::json;
    use tempfile::TempDir;

    fn kv(value: serde_json::Value) -> ConfigDict {
        value.as_object().cloned().unwrap()
    }

    fn import(dir: &Path) -> ImportOverrideStrategy {
        ImportOverrideStrategy::new(dir, "conf", Arc::new(PostgresCodec), Owner::current())
    }

    #[tokio::test]
    async fn test_import_file_names_and_sequence() {
        let dir = TempDir::new().unwrap();
        let strategy = import(dir.path());

        strategy
            .apply(OverrideGroup::User, "c1", &kv(json!({"work_mem": "16MB"})))
            .await
            .unwrap();
        strategy
            .apply(OverrideGroup::User, "c2", &kv(json!({"work_mem": "32MB"})))
            .await
            .unwrap();
        strategy
            .apply(OverrideGroup::System, "s1", &kv(json!({"port": 5433})))
            .await
            .unwrap();

        assert_eq!(
            os::list_names(dir.path()).await.unwrap(),
            vec!["20-user-001-c1.conf", "20-user-002-c2.conf", "50-system-001-s1.conf"]
        );
        assert_eq!(strategy.count_revisions(OverrideGroup::User).await.unwrap(), 2);
        let merged = strategy.parse_updates().await.unwrap();
        assert_eq!(merged["work_mem"], json!("32MB"));
    }

    #[tokio::test]
    async fn test_import_reapply_keeps_sequence() {
        let dir = TempDir::new().unwrap();
        let strategy = import(dir.path());
        strategy
            .apply(OverrideGroup::User, "c1", &kv(json!({"a": 1})))
            .await
            .unwrap();
        strategy
            .apply(OverrideGroup::User, "c2", &kv(json!({"b": 1})))
            .await
            .unwrap();
        strategy
            .apply(OverrideGroup::User, "c1", &kv(json!({"a": 2, "c": 3})))
            .await
            .unwrap();

        assert_eq!(strategy.count_revisions(OverrideGroup::User).await.unwrap(), 2);
        let text = std::fs::read_to_string(dir.path().join("20-user-001-c1.conf")).unwrap();
        let parsed = PostgresCodec.parse(&text).unwrap();
        assert_eq!(parsed, kv(json!({"a": 2, "c": 3})));
    }

    #[tokio::test]
    async fn test_import_remove_group() {
        let dir = TempDir::new().unwrap();
        let strategy = import(dir.path());
        for id in ["a", "b"] {
            strategy
                .apply(OverrideGroup::User, id, &kv(json!({"k": id})))
                .await
                .unwrap();
        }
        strategy
            .apply(OverrideGroup::System, "s", &kv(json!({"k": "sys"})))
            .await
            .unwrap();

        assert_eq!(strategy.remove(OverrideGroup::User, None).await.unwrap(), 2);
        assert_eq!(
            os::list_names(dir.path()).await.unwrap(),
            vec!["50-system-001-s.conf"]
        );
    }

    #[tokio::test]
    async fn test_import_rejects_path_like_change_id() {
        let dir = TempDir::new().unwrap();
        let strategy = import(dir.path());
        let err = strategy
            .apply(OverrideGroup::User, "../x", &kv(json!({"a": 1})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_import_remove_is_all_or_nothing() {
        let dir = TempDir::new().unwrap();
        let strategy = import(dir.path());
        for id in ["a", "b"] {
            strategy
                .apply(OverrideGroup::User, id, &kv(json!({"k": id})))
                .await
                .unwrap();
        }
        let first = dir.path().join("20-user-001-a.conf");
        let second = dir.path().join("20-user-002-b.conf");
        let before = std::fs::read(&first).unwrap();
        // a directory in the way of the second file's staging name
        let blocker = dir.path().join(".20-user-002-b.conf.removing");
        std::fs::create_dir(&blocker).unwrap();
        std::fs::write(blocker.join("keep"), b"x").unwrap();

        strategy.remove(OverrideGroup::User, None).await.unwrap_err();

        assert_eq!(std::fs::read(&first).unwrap(), before);
        assert!(second.is_file());
        assert!(!dir.path().join(".20-user-001-a.conf.removing").exists());
        assert_eq!(strategy.count_revisions(OverrideGroup::User).await.unwrap(), 2);

        std::fs::remove_dir_all(&blocker).unwrap();
        assert_eq!(strategy.remove(OverrideGroup::User, None).await.unwrap(), 2);
        assert!(os::list_names(dir.path()).await.unwrap().is_empty());
    }

    fn rolling(dir: &Path) -> (PathBuf, RollingOverrideStrategy) {
        let live = dir.join("postgresql.conf");
        std::fs::write(&live, "# base\nport = 5432\n").unwrap();
        let strategy = RollingOverrideStrategy::new(&live, Arc::new(PostgresCodec), Owner::current());
        (live, strategy)
    }

    fn live_values(live: &Path) -> ConfigDict {
        PostgresCodec
            .parse(&std::fs::read_to_string(live).unwrap())
            .unwrap()
    }

    #[tokio::test]
    async fn test_rolling_backups_track_revisions() {
        let dir = TempDir::new().unwrap();
        let (live, strategy) = rolling(dir.path());

        strategy
            .apply(OverrideGroup::User, "x", &kv(json!({"work_mem": "8MB"})))
            .await
            .unwrap();
        strategy
            .apply(OverrideGroup::User, "y", &kv(json!({"work_mem": "9MB"})))
            .await
            .unwrap();
        assert_eq!(strategy.count_revisions(OverrideGroup::User).await.unwrap(), 2);
        assert_eq!(strategy.current_revision().await.unwrap(), 2);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("postgresql.conf.000.old")).unwrap(),
            "# base\nport = 5432\n"
        );
        assert_eq!(
            live_values(&dir.path().join("postgresql.conf.001.old"))["work_mem"],
            json!("8MB")
        );

        // removing the newest revision restores the newest backup
        let newest = std::fs::read(dir.path().join("postgresql.conf.001.old")).unwrap();
        assert_eq!(strategy.remove(OverrideGroup::User, Some("y")).await.unwrap(), 1);
        assert_eq!(std::fs::read(&live).unwrap(), newest);
        assert_eq!(strategy.current_revision().await.unwrap(), 1);

        assert_eq!(strategy.remove(OverrideGroup::User, None).await.unwrap(), 1);
        assert_eq!(std::fs::read_to_string(&live).unwrap(), "# base\nport = 5432\n");
        assert_eq!(strategy.current_revision().await.unwrap(), 0);
        assert_eq!(strategy.remove(OverrideGroup::User, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rolling_honors_group_and_change_id() {
        let dir = TempDir::new().unwrap();
        let (live, strategy) = rolling(dir.path());

        strategy
            .apply(OverrideGroup::User, "u1", &kv(json!({"work_mem": "8MB"})))
            .await
            .unwrap();
        strategy
            .apply(OverrideGroup::System, "s1", &kv(json!({"work_mem": "64MB"})))
            .await
            .unwrap();
        strategy
            .apply(OverrideGroup::User, "u2", &kv(json!({"work_mem": "16MB", "port": 5433})))
            .await
            .unwrap();

        // system wins even though the user revision came later
        assert_eq!(live_values(&live)["work_mem"], json!("64MB"));
        assert_eq!(live_values(&live)["port"], json!(5433));
        assert!(strategy.has_revision(OverrideGroup::System, "s1").await.unwrap());
        assert!(!strategy.has_revision(OverrideGroup::User, "s1").await.unwrap());
        assert_eq!(strategy.count_revisions(OverrideGroup::User).await.unwrap(), 2);
        assert_eq!(strategy.count_revisions(OverrideGroup::System).await.unwrap(), 1);
        assert_eq!(strategy.parse_updates().await.unwrap()["work_mem"], json!("64MB"));

        // re-applying a change id merges into it without a new backup
        strategy
            .apply(OverrideGroup::User, "u1", &kv(json!({"shared_buffers": "1GB"})))
            .await
            .unwrap();
        assert_eq!(strategy.current_revision().await.unwrap(), 3);
        assert_eq!(live_values(&live)["shared_buffers"], json!("1GB"));

        // removing a revision from the middle rebuilds from the original
        assert_eq!(strategy.remove(OverrideGroup::System, Some("s1")).await.unwrap(), 1);
        assert_eq!(live_values(&live)["work_mem"], json!("16MB"));
        assert_eq!(strategy.current_revision().await.unwrap(), 2);
        assert_eq!(strategy.remove(OverrideGroup::System, Some("s1")).await.unwrap(), 0);

        assert_eq!(strategy.remove(OverrideGroup::User, Some("u2")).await.unwrap(), 1);
        let values = live_values(&live);
        assert_eq!(values["work_mem"], json!("8MB"));
        assert_eq!(values["port"], json!(5432));
        assert_eq!(values["shared_buffers"], json!("1GB"));
    }
}
