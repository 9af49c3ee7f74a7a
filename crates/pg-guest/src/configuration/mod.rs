// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine configuration management.
//!
//! The effective configuration is the base file merged with user override
//! revisions and then system override revisions. Nothing is cached: every
//! read goes back to disk so the engine and the controller always agree.

pub mod codec;
pub mod overrides;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio::fs;
use tracing::{debug, info};

pub use codec::{ConfigCodec, ConfigDict, PostgresCodec};
pub use overrides::{
    DEFAULT_CHANGE_ID, ImportOverrideStrategy, OverrideGroup, OverrideStrategy,
    RollingOverrideStrategy,
};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::os::{self, MODE_CONFIG, Owner};

/// Name of the directory (relative to the base file) holding import revisions.
pub const OVERRIDES_DIR_NAME: &str = "conf.d";

/// Composes the effective configuration from a base file and override revisions.
pub struct ConfigurationManager {
    base_path: PathBuf,
    owner: Owner,
    codec: Arc<dyn ConfigCodec>,
    strategy: Box<dyn OverrideStrategy>,
    max_user_overrides: usize,
    include_dir: Option<String>,
}

impl ConfigurationManager {
    /// Create a manager for `base_path`.
    pub fn new(
        base_path: impl Into<PathBuf>,
        owner: Owner,
        codec: Arc<dyn ConfigCodec>,
        strategy: Box<dyn OverrideStrategy>,
        max_user_overrides: usize,
    ) -> Self {
        Self {
            base_path: base_path.into(),
            owner,
            codec,
            strategy,
            max_user_overrides,
            include_dir: None,
        }
    }

    /// Make `reset_configuration` append an include directive for `dir`.
    pub fn with_include_dir(mut self, dir: impl Into<String>) -> Self {
        self.include_dir = Some(dir.into());
        self
    }

    /// PostgreSQL layout: `postgresql.conf` plus import revisions in `conf.d`.
    pub fn for_postgres(config: &Config) -> Self {
        let codec: Arc<dyn ConfigCodec> = Arc::new(PostgresCodec);
        let strategy = ImportOverrideStrategy::new(
            config.overrides_dir(),
            "conf",
            codec.clone(),
            config.owner(),
        );
        Self::new(
            config.config_file(),
            config.owner(),
            codec,
            Box::new(strategy),
            config.max_user_overrides,
        )
        .with_include_dir(OVERRIDES_DIR_NAME)
    }

    /// Path of the base file.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Rewrite the base file.
    ///
    /// The contents are validated first; an unparseable file is rejected
    /// without touching disk.
    pub async fn reset_configuration(&self, contents: &str) -> Result<()> {
        self.codec.parse(contents)?;

        let mut text = contents.to_string();
        if let Some(dir) = &self.include_dir
            && !codec::has_include_dir(&text)
        {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&codec::include_dir_directive(dir));
        }

        os::write_atomic(&self.base_path, text.as_bytes(), self.owner, MODE_CONFIG).await?;
        info!(path = %self.base_path.display(), "Base configuration written");
        Ok(())
    }

    /// Parse the base file alone. A missing file parses as empty.
    pub async fn parse_base(&self) -> Result<ConfigDict> {
        match fs::read_to_string(&self.base_path).await {
            Ok(text) => self.codec.parse(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigDict::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Effective configuration: base, then user revisions, then system revisions.
    pub async fn parse_configuration(&self) -> Result<ConfigDict> {
        let mut effective = self.parse_base().await?;
        let updates = self.strategy.parse_updates().await?;
        codec::merge_into(&mut effective, &updates);
        Ok(effective)
    }

    /// Effective value of `key`, or `default` when unset.
    ///
    /// Dotted keys address nested sections of hierarchical formats.
    pub async fn get_value(&self, key: &str, default: Option<Value>) -> Result<Option<Value>> {
        let effective = self.parse_configuration().await?;
        if let Some(value) = effective.get(key) {
            return Ok(Some(value.clone()));
        }
        let mut current: Option<&Value> = None;
        for (idx, part) in key.split('.').enumerate() {
            current = if idx == 0 {
                effective.get(part)
            } else {
                current.and_then(|v| v.get(part))
            };
            if current.is_none() {
                break;
            }
        }
        Ok(current.cloned().or(default))
    }

    fn prepare_overrides(&self, kv: &ConfigDict) -> Result<ConfigDict> {
        let hierarchical = self.codec.is_hierarchical();
        codec::validate_overrides(kv, hierarchical)?;
        Ok(if hierarchical {
            codec::expand_dotted_keys(kv)
        } else {
            kv.clone()
        })
    }

    /// Apply a controller-owned revision.
    pub async fn apply_system_override(&self, kv: &ConfigDict, change_id: Option<&str>) -> Result<()> {
        let kv = self.prepare_overrides(kv)?;
        let change_id = change_id.unwrap_or(DEFAULT_CHANGE_ID);
        self.strategy
            .apply(OverrideGroup::System, change_id, &kv)
            .await?;
        info!(change_id, keys = kv.len(), "Applied system override");
        Ok(())
    }

    /// Apply a tenant-owned revision.
    ///
    /// Fails with [`Error::TooManyOverrides`] when a new revision would exceed
    /// the configured ceiling; re-applying an existing change id does not count.
    pub async fn apply_user_override(&self, kv: &ConfigDict, change_id: Option<&str>) -> Result<()> {
        let kv = self.prepare_overrides(kv)?;
        let change_id = change_id.unwrap_or(DEFAULT_CHANGE_ID);

        let existing = self
            .strategy
            .has_revision(OverrideGroup::User, change_id)
            .await?;
        if !existing {
            let count = self.strategy.count_revisions(OverrideGroup::User).await?;
            if count >= self.max_user_overrides {
                return Err(Error::TooManyOverrides {
                    limit: self.max_user_overrides,
                });
            }
        }

        self.strategy
            .apply(OverrideGroup::User, change_id, &kv)
            .await?;
        info!(change_id, keys = kv.len(), "Applied user override");
        Ok(())
    }

    /// Remove a controller-owned revision. Missing revisions are ignored.
    pub async fn remove_system_override(&self, change_id: Option<&str>) -> Result<()> {
        let change_id = change_id.unwrap_or(DEFAULT_CHANGE_ID);
        let removed = self
            .strategy
            .remove(OverrideGroup::System, Some(change_id))
            .await?;
        debug!(change_id, removed, "Removed system override");
        Ok(())
    }

    /// Remove a tenant-owned revision.
    pub async fn remove_user_override(&self, change_id: Option<&str>) -> Result<()> {
        if self.strategy.count_revisions(OverrideGroup::User).await? == 0 {
            return Err(Error::NoOverridesToRemove);
        }
        let change_id = change_id.unwrap_or(DEFAULT_CHANGE_ID);
        let removed = self
            .strategy
            .remove(OverrideGroup::User, Some(change_id))
            .await?;
        if removed == 0 {
            return Err(Error::RevisionNotFound(change_id.to_string()));
        }
        info!(change_id, "Removed user override");
        Ok(())
    }

    /// Whether a controller-owned revision exists.
    pub async fn has_system_override(&self, change_id: &str) -> Result<bool> {
        self.strategy
            .has_revision(OverrideGroup::System, change_id)
            .await
    }

    /// Number of outstanding tenant-owned revisions.
    pub async fn count_user_overrides(&self) -> Result<usize> {
        self.strategy.count_revisions(OverrideGroup::User).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn kv(value: Value) -> ConfigDict {
        value.as_object().cloned().unwrap()
    }

    fn manager(dir: &Path, max: usize) -> ConfigurationManager {
        let codec: Arc<dyn ConfigCodec> = Arc::new(PostgresCodec);
        let strategy =
            ImportOverrideStrategy::new(dir.join("conf.d"), "conf", codec.clone(), Owner::current());
        ConfigurationManager::new(
            dir.join("postgresql.conf"),
            Owner::current(),
            codec,
            Box::new(strategy),
            max,
        )
        .with_include_dir(OVERRIDES_DIR_NAME)
    }

    #[tokio::test]
    async fn test_reset_then_parse_round_trips() {
        let dir = TempDir::new().unwrap();
        let config = manager(dir.path(), 10);
        let contents = "listen_addresses='*'\nport=5432\n";

        config.reset_configuration(contents).await.unwrap();

        assert_eq!(
            config.parse_configuration().await.unwrap(),
            PostgresCodec.parse(contents).unwrap()
        );
        let written = std::fs::read_to_string(dir.path().join("postgresql.conf")).unwrap();
        assert!(written.ends_with("include_dir = 'conf.d'\n"));
    }

    #[tokio::test]
    async fn test_reset_rejects_garbage_without_writing() {
        let dir = TempDir::new().unwrap();
        let config = manager(dir.path(), 10);
        let err = config.reset_configuration("a = 'open").await.unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
        assert!(!dir.path().join("postgresql.conf").exists());
    }

    #[tokio::test]
    async fn test_system_override_wins() {
        let dir = TempDir::new().unwrap();
        let config = manager(dir.path(), 10);
        config.reset_configuration("work_mem = '4MB'\n").await.unwrap();

        config
            .apply_system_override(&kv(json!({"work_mem": "64MB"})), Some("s1"))
            .await
            .unwrap();
        config
            .apply_user_override(&kv(json!({"work_mem": "16MB"})), Some("c1"))
            .await
            .unwrap();

        assert_eq!(
            config.get_value("work_mem", None).await.unwrap(),
            Some(json!("64MB"))
        );
    }

    #[tokio::test]
    async fn test_too_many_overrides() {
        let dir = TempDir::new().unwrap();
        let config = manager(dir.path(), 2);
        for id in ["a", "b"] {
            config
                .apply_user_override(&kv(json!({"k": id})), Some(id))
                .await
                .unwrap();
        }
        // Re-applying an existing change id stays within the ceiling.
        config
            .apply_user_override(&kv(json!({"k": "a2"})), Some("a"))
            .await
            .unwrap();

        let err = config
            .apply_user_override(&kv(json!({"k": "c"})), Some("c"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TooManyOverrides { limit: 2 }));
        assert_eq!(config.count_user_overrides().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_remove_user_override_errors() {
        let dir = TempDir::new().unwrap();
        let config = manager(dir.path(), 10);
        assert!(matches!(
            config.remove_user_override(None).await.unwrap_err(),
            Error::NoOverridesToRemove
        ));

        config
            .apply_user_override(&kv(json!({"k": 1})), Some("c1"))
            .await
            .unwrap();
        assert!(matches!(
            config.remove_user_override(Some("other")).await.unwrap_err(),
            Error::RevisionNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_get_value_default() {
        let dir = TempDir::new().unwrap();
        let config = manager(dir.path(), 10);
        assert_eq!(
            config
                .get_value("missing", Some(json!("fallback")))
                .await
                .unwrap(),
            Some(json!("fallback"))
        );
        assert_eq!(config.get_value("missing", None).await.unwrap(), None);
    }
}
