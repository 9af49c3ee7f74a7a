// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Module application.
//!
//! Modules are opaque, typed packages delivered by the control plane. Each
//! type has a [`ModuleDriver`]. Applied modules are recorded under
//! `<modules_dir>/<type>/<id>/` as `contents.dat` (base64) and `result.json`.

pub mod drivers;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use drivers::{DriverOutcome, ModuleDriver, PingDriver};

use crate::error::{Error, Result};
use crate::os::{self, MODE_SECRET, Owner};

/// Tenant value marking a module applied to every tenant.
pub const MODULE_APPLY_TO_ALL: &str = "all";
/// Contents file name.
pub const CONTENTS_FILE: &str = "contents.dat";
/// Result record file name.
pub const RESULT_FILE: &str = "result.json";

fn default_tenant() -> String {
    MODULE_APPLY_TO_ALL.to_string()
}

fn default_apply_order() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

/// Module as delivered by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDescriptor {
    /// Module id
    pub id: String,
    /// Module name
    pub name: String,
    /// Module type (selects the driver)
    #[serde(rename = "type")]
    pub module_type: String,
    /// Owning tenant, or `all`
    #[serde(default = "default_tenant")]
    pub tenant: String,
    /// Datastore
    #[serde(default)]
    pub datastore: String,
    /// Datastore version
    #[serde(default)]
    pub datastore_version: String,
    /// Hex md5 of the decoded contents
    pub md5: String,
    /// Base64 contents
    pub contents: String,
    /// Lower applies first
    #[serde(default = "default_apply_order")]
    pub apply_order: u32,
    /// Applied before others with the same order
    #[serde(default)]
    pub priority_apply: bool,
    /// Applied automatically by the platform
    #[serde(default)]
    pub auto_apply: bool,
    /// Visible to the tenant
    #[serde(default = "default_true")]
    pub visible: bool,
}

impl ModuleDescriptor {
    /// Whether only an admin may manage this module.
    pub fn admin_only(&self) -> bool {
        self.tenant == MODULE_APPLY_TO_ALL || self.auto_apply || !self.visible
    }
}

/// Identifies a module to remove.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRef {
    /// Module id
    pub id: String,
    /// Module type
    #[serde(rename = "type")]
    pub module_type: String,
}

/// Driver result status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModuleStatus {
    /// Driver succeeded
    Ok,
    /// Driver failed
    Error,
}

/// Persisted result of applying a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRecord {
    /// Module id
    pub id: String,
    /// Module name
    pub name: String,
    /// Module type
    #[serde(rename = "type")]
    pub module_type: String,
    /// Owning tenant
    pub tenant: String,
    /// Datastore
    pub datastore: String,
    /// Datastore version
    pub datastore_version: String,
    /// md5 of the applied contents
    pub md5: String,
    /// Driver result
    pub status: ModuleStatus,
    /// Driver message
    pub message: String,
    /// First application
    pub created: DateTime<Utc>,
    /// Last application or removal
    pub updated: DateTime<Utc>,
    /// Removal time, if removed
    #[serde(default)]
    pub removed: Option<DateTime<Utc>>,
    /// Apply order
    pub apply_order: u32,
    /// Priority flag
    pub priority_apply: bool,
    /// Only admins may manage the module
    pub admin_only: bool,
    /// Base64 contents, only when requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents: Option<String>,
}

fn check_path_component(what: &str, value: &str) -> Result<()> {
    if value.is_empty() || value == "." || value == ".." || value.contains(['/', '\\']) {
        return Err(Error::InvalidInput(format!("invalid module {}: '{}'", what, value)));
    }
    Ok(())
}

/// Applies modules through registered drivers.
pub struct ModuleApplier {
    modules_dir: PathBuf,
    drivers: BTreeMap<String, Arc<dyn ModuleDriver>>,
}

impl ModuleApplier {
    /// Applier rooted at `modules_dir` with the built-in drivers.
    pub fn new(modules_dir: impl Into<PathBuf>) -> Self {
        let mut applier = Self {
            modules_dir: modules_dir.into(),
            drivers: BTreeMap::new(),
        };
        applier.register(Arc::new(PingDriver));
        applier
    }

    /// Register (or replace) the driver for its module type.
    pub fn register(&mut self, driver: Arc<dyn ModuleDriver>) {
        self.drivers.insert(driver.module_type().to_string(), driver);
    }

    /// Registered module types.
    pub fn module_types(&self) -> Vec<&str> {
        self.drivers.keys().map(String::as_str).collect()
    }

    fn module_dir(&self, module_type: &str, id: &str) -> PathBuf {
        self.modules_dir.join(module_type).join(id)
    }

    fn driver(&self, module_type: &str) -> Result<&Arc<dyn ModuleDriver>> {
        self.drivers
            .get(module_type)
            .ok_or_else(|| Error::ModuleTypeNotFound(module_type.to_string()))
    }

    async fn read_record(dir: &Path) -> Result<Option<ModuleRecord>> {
        match tokio::fs::read(dir.join(RESULT_FILE)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_record(dir: &Path, record: &ModuleRecord) -> Result<()> {
        let body = serde_json::to_vec_pretty(record)?;
        os::write_atomic(&dir.join(RESULT_FILE), &body, Owner::current(), MODE_SECRET).await
    }

    /// Apply modules in order: `apply_order` ascending, then priority first.
    pub async fn apply(&self, modules: &[ModuleDescriptor], is_admin: bool) -> Result<Vec<ModuleRecord>> {
        let mut ordered: Vec<&ModuleDescriptor> = modules.iter().collect();
        ordered.sort_by(|a, b| {
            a.apply_order
                .cmp(&b.apply_order)
                .then(b.priority_apply.cmp(&a.priority_apply))
        });

        for module in &ordered {
            check_path_component("id", &module.id)?;
            check_path_component("type", &module.module_type)?;
            self.driver(&module.module_type)?;
        }

        let mut records = Vec::with_capacity(ordered.len());
        for module in ordered {
            records.push(self.apply_one(module, is_admin).await?);
        }
        Ok(records)
    }

    async fn apply_one(&self, module: &ModuleDescriptor, is_admin: bool) -> Result<ModuleRecord> {
        let driver = self.driver(&module.module_type)?;
        let decoded = STANDARD
            .decode(module.contents.trim())
            .map_err(|e| Error::InvalidInput(format!("module {} contents are not base64: {}", module.id, e)))?;
        let digest = hex::encode(Md5::digest(&decoded));
        if !digest.eq_ignore_ascii_case(&module.md5) {
            return Err(Error::InvalidInput(format!(
                "module {} md5 mismatch: expected {}, got {}",
                module.id, module.md5, digest
            )));
        }

        let dir = self.module_dir(&module.module_type, &module.id);
        let previous = Self::read_record(&dir).await?;
        let admin_only = module.admin_only();
        if !is_admin && (admin_only || previous.as_ref().is_some_and(|r| r.admin_only)) {
            return Err(Error::ModuleAdminOnly(module.name.clone()));
        }

        let contents_file = dir.join(CONTENTS_FILE);
        os::write_atomic(&contents_file, module.contents.trim().as_bytes(), Owner::current(), MODE_SECRET)
            .await?;

        let outcome = match driver
            .apply(&module.name, &module.datastore, &module.datastore_version, &contents_file)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => DriverOutcome::failed(e.to_string()),
        };

        let now = Utc::now();
        let record = ModuleRecord {
            id: module.id.clone(),
            name: module.name.clone(),
            module_type: module.module_type.clone(),
            tenant: module.tenant.clone(),
            datastore: module.datastore.clone(),
            datastore_version: module.datastore_version.clone(),
            md5: module.md5.clone(),
            status: if outcome.ok { ModuleStatus::Ok } else { ModuleStatus::Error },
            message: outcome.message,
            created: previous.map(|r| r.created).unwrap_or(now),
            updated: now,
            removed: None,
            apply_order: module.apply_order,
            priority_apply: module.priority_apply,
            admin_only,
            contents: None,
        };
        Self::write_record(&dir, &record).await?;

        if outcome.ok {
            info!(module = %module.name, module_type = %module.module_type, "Module applied");
        } else {
            warn!(module = %module.name, message = %record.message, "Module apply failed");
        }
        Ok(record)
    }

    /// Undo an applied module. The contents file is kept.
    pub async fn remove(&self, module: &ModuleRef, is_admin: bool) -> Result<ModuleRecord> {
        check_path_component("id", &module.id)?;
        check_path_component("type", &module.module_type)?;
        let dir = self.module_dir(&module.module_type, &module.id);
        let mut record = Self::read_record(&dir)
            .await?
            .ok_or_else(|| Error::ModuleNotApplied(module.id.clone()))?;
        if record.admin_only && !is_admin {
            return Err(Error::ModuleAdminOnly(record.name.clone()));
        }
        let driver = self.driver(&module.module_type)?;
        let outcome = driver
            .remove(
                &record.name,
                &record.datastore,
                &record.datastore_version,
                &dir.join(CONTENTS_FILE),
            )
            .await?;

        let now = Utc::now();
        record.removed = Some(now);
        record.updated = now;
        record.message = outcome.message;
        record.status = if outcome.ok { ModuleStatus::Ok } else { ModuleStatus::Error };
        Self::write_record(&dir, &record).await?;
        info!(module = %record.name, "Module removed");
        Ok(record)
    }

    /// Every recorded module the caller may see.
    pub async fn list(&self, include_contents: bool, is_admin: bool) -> Result<Vec<ModuleRecord>> {
        let mut records = Vec::new();
        for module_type in os::list_names(&self.modules_dir).await? {
            let type_dir = self.modules_dir.join(&module_type);
            for id in os::list_names(&type_dir).await? {
                let dir = type_dir.join(&id);
                let Some(mut record) = Self::read_record(&dir).await? else {
                    continue;
                };
                if record.admin_only && !is_admin {
                    continue;
                }
                if include_contents {
                    record.contents = match tokio::fs::read_to_string(dir.join(CONTENTS_FILE)).await {
                        Ok(text) => Some(text),
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                        Err(e) => return Err(e.into()),
                    };
                }
                records.push(record);
            }
        }
        records.sort_by(|a, b| {
            a.apply_order
                .cmp(&b.apply_order)
                .then(b.priority_apply.cmp(&a.priority_apply))
                .then(a.name.cmp(&b.name))
        });
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(id: &str, message: &str) -> ModuleDescriptor {
        let raw = format!("message={}\n", message);
        ModuleDescriptor {
            id: id.to_string(),
            name: format!("mod-{}", id),
            module_type: "ping".to_string(),
            tenant: "t1".to_string(),
            datastore: "postgresql".to_string(),
            datastore_version: "16".to_string(),
            md5: hex::encode(Md5::digest(raw.as_bytes())),
            contents: STANDARD.encode(raw),
            apply_order: 5,
            priority_apply: false,
            auto_apply: false,
            visible: true,
        }
    }

    #[test]
    fn test_admin_only_derivation() {
        let mut m = module("1", "x");
        assert!(!m.admin_only());
        m.tenant = MODULE_APPLY_TO_ALL.into();
        assert!(m.admin_only());
        m.tenant = "t1".into();
        m.visible = false;
        assert!(m.admin_only());
        m.visible = true;
        m.auto_apply = true;
        assert!(m.admin_only());
    }

    #[tokio::test]
    async fn test_md5_mismatch_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let applier = ModuleApplier::new(dir.path());
        let mut m = module("1", "hi");
        m.md5 = "00000000000000000000000000000000".into();
        let err = applier.apply(&[m], false).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_path_components_validated() {
        let dir = tempfile::TempDir::new().unwrap();
        let applier = ModuleApplier::new(dir.path());
        let mut m = module("1", "hi");
        m.id = "../escape".into();
        assert!(applier.apply(&[m], true).await.is_err());
    }
}
