// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Guest log shipping.
//!
//! Each known log is a local file that can be published to the object store
//! in chunks. The first line's hash identifies a file generation: when it
//! changes, or the file shrinks, the file was rotated and everything
//! previously published is discarded before publishing again.
//!
//! Object layout inside the log container:
//!
//! ```text
//! <instance>/<datastore>-<log>/log-<timestamp>   one object per chunk
//! <instance>/<datastore>-<log>_metafile          publish state (JSON)
//! ```

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader};
use tracing::{debug, info, warn};

use crate::config::{Config, DATASTORE_MANAGER};
use crate::configuration::{ConfigDict, ConfigurationManager};
use crate::error::{Error, Result};
use crate::object_store::ObjectStore;

/// Name of the controller's own log.
pub const GUEST_LOG: &str = "guest";
/// Name of the engine's general log.
pub const GENERAL_LOG: &str = "general";

/// Who owns a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogType {
    /// Written by the platform; can only be published or discarded
    Sys,
    /// Written by the engine at the tenant's request; can be toggled
    User,
}

/// Publish state of a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStatus {
    /// User log switched off
    Disabled,
    /// Switched on, nothing written yet
    Enabled,
    /// Local file missing
    Unavailable,
    /// Has content, nothing published
    Ready,
    /// Published, with unpublished content pending
    Partial,
    /// Fully published
    Published,
    /// File rotated since the last publish
    Rotated,
    /// Toggled; takes effect at the next restart
    #[serde(rename = "Restart_Required")]
    RestartRequired,
}

/// Static description of a log.
#[derive(Debug, Clone)]
pub struct LogDefinition {
    /// Log name
    pub name: String,
    /// Log type
    pub log_type: LogType,
    /// Local file
    pub file: PathBuf,
    /// Visible to the tenant
    pub exposed: bool,
    /// Toggling needs an engine restart
    pub restart_required: bool,
    /// Overrides applied to switch the log on
    pub enable_overrides: ConfigDict,
    /// Overrides applied to switch the log off
    pub disable_overrides: ConfigDict,
}

impl LogDefinition {
    /// Logs known to a PostgreSQL guest.
    pub fn postgres(config: &Config) -> Vec<Self> {
        let mut enable = Map::new();
        enable.insert("logging_collector".into(), Value::Bool(true));
        enable.insert("log_destination".into(), Value::String("stderr".into()));
        enable.insert("log_directory".into(), Value::String("log".into()));
        enable.insert("log_filename".into(), Value::String("postgresql.log".into()));
        enable.insert("log_file_mode".into(), Value::String("0644".into()));
        enable.insert("log_rotation_size".into(), Value::String("100MB".into()));
        enable.insert("log_truncate_on_rotation".into(), Value::Bool(true));
        enable.insert("log_min_duration_statement".into(), Value::from(0));
        let mut disable = Map::new();
        disable.insert("logging_collector".into(), Value::Bool(false));

        vec![
            Self {
                name: GUEST_LOG.to_string(),
                log_type: LogType::Sys,
                file: config.guest_log_file.clone(),
                exposed: false,
                restart_required: false,
                enable_overrides: Map::new(),
                disable_overrides: Map::new(),
            },
            Self {
                name: GENERAL_LOG.to_string(),
                log_type: LogType::User,
                file: config.data_dir().join("log").join("postgresql.log"),
                exposed: true,
                restart_required: true,
                enable_overrides: enable,
                disable_overrides: disable,
            },
        ]
    }

    fn enable_change_id(&self) -> String {
        format!("{}_enable", self.name)
    }

    fn disable_change_id(&self) -> String {
        format!("{}_disable", self.name)
    }
}

/// Publish state kept in the store next to the chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMetafile {
    /// Log name
    pub log_name: String,
    /// Log type
    pub log_type: LogType,
    /// Local file
    pub log_file: String,
    /// Bytes published
    pub log_size: u64,
    /// Header hash of the published generation
    pub log_header_digest: Option<String>,
}

/// Log state reported to the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestLogInfo {
    /// Log name
    pub name: String,
    /// Log type
    #[serde(rename = "type")]
    pub log_type: LogType,
    /// Publish state
    pub status: LogStatus,
    /// Bytes published
    pub published: u64,
    /// Bytes not yet published
    pub pending: u64,
    /// Object store container
    pub container: String,
    /// Object name prefix
    pub prefix: String,
    /// Metafile object name
    pub metafile: String,
}

/// Action requested through `guest_log_action`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogAction {
    /// Log name
    pub name: String,
    /// Switch the log on
    #[serde(default)]
    pub enable: bool,
    /// Switch the log off
    #[serde(default)]
    pub disable: bool,
    /// Publish pending content
    #[serde(default)]
    pub publish: bool,
    /// Delete published content
    #[serde(default)]
    pub discard: bool,
}

/// Runtime state of one log.
#[derive(Debug, Clone)]
pub struct GuestLog {
    definition: LogDefinition,
    enabled: bool,
    restart_pending: bool,
    discarded: bool,
    size: u64,
    header_hash: Option<String>,
    published_size: u64,
    published_header_hash: Option<String>,
    container: String,
    prefix: String,
    metafile: String,
    status: LogStatus,
}

impl GuestLog {
    fn new(definition: LogDefinition, config: &Config) -> Self {
        let prefix = format!(
            "{}/{}-{}/",
            config.instance_id, DATASTORE_MANAGER, definition.name
        );
        let metafile = format!("{}_metafile", prefix.trim_end_matches('/'));
        let enabled = definition.log_type == LogType::Sys;
        Self {
            definition,
            enabled,
            restart_pending: false,
            discarded: false,
            size: 0,
            header_hash: None,
            published_size: 0,
            published_header_hash: None,
            container: config.log_container.clone(),
            prefix,
            metafile,
            status: LogStatus::Disabled,
        }
    }

    /// Log name.
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Current status.
    pub fn status(&self) -> LogStatus {
        self.status
    }

    /// Bytes published so far.
    pub fn published_size(&self) -> u64 {
        self.published_size
    }

    /// Size of the local file at the last refresh.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Object name prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Metafile object name.
    pub fn metafile(&self) -> &str {
        &self.metafile
    }

    fn rotated(&self) -> bool {
        self.published_size > 0
            && (self.size < self.published_size
                || (self.published_header_hash.is_some()
                    && self.header_hash != self.published_header_hash))
    }

    fn derive_status(&self, file_exists: bool) -> LogStatus {
        if self.restart_pending {
            return LogStatus::RestartRequired;
        }
        if self.definition.log_type == LogType::User && !self.enabled {
            return LogStatus::Disabled;
        }
        if self.discarded {
            return LogStatus::Enabled;
        }
        if !file_exists {
            return if self.definition.log_type == LogType::User {
                LogStatus::Enabled
            } else {
                LogStatus::Unavailable
            };
        }
        if self.rotated() {
            LogStatus::Rotated
        } else if self.published_size == 0 {
            if self.size == 0 { LogStatus::Enabled } else { LogStatus::Ready }
        } else if self.size > self.published_size {
            LogStatus::Partial
        } else {
            LogStatus::Published
        }
    }

    /// Re-read size and header hash of the local file.
    async fn refresh_local(&mut self) -> Result<()> {
        let exists = match tokio::fs::metadata(&self.definition.file).await {
            Ok(metadata) => {
                self.size = metadata.len();
                self.header_hash = header_hash(&self.definition.file).await?;
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.size = 0;
                self.header_hash = None;
                false
            }
            Err(e) => return Err(e.into()),
        };
        self.status = self.derive_status(exists);
        Ok(())
    }

    fn info(&self) -> GuestLogInfo {
        GuestLogInfo {
            name: self.definition.name.clone(),
            log_type: self.definition.log_type,
            status: self.status,
            published: self.published_size,
            pending: self.size.saturating_sub(self.published_size),
            container: self.container.clone(),
            prefix: self.prefix.clone(),
            metafile: self.metafile.clone(),
        }
    }

    fn metafile_body(&self) -> LogMetafile {
        LogMetafile {
            log_name: self.definition.name.clone(),
            log_type: self.definition.log_type,
            log_file: self.definition.file.display().to_string(),
            log_size: self.published_size,
            log_header_digest: self.published_header_hash.clone(),
        }
    }
}

/// Hex sha256 of the first line of `path`, or `None` until that line is
/// terminated by a newline.
pub async fn header_hash(path: &std::path::Path) -> Result<Option<String>> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut first = Vec::new();
    reader.read_until(b'\n', &mut first).await?;
    if first.last() != Some(&b'\n') {
        return Ok(None);
    }
    Ok(Some(hex::encode(Sha256::digest(&first))))
}

/// Name of a chunk object; strictly increasing within one publish round.
fn chunk_name(prefix: &str, previous: &mut Option<DateTime<Utc>>) -> String {
    let mut ts = Utc::now();
    if let Some(last) = *previous
        && ts <= last
    {
        ts = last + chrono::Duration::microseconds(1);
    }
    *previous = Some(ts);
    format!("{}log-{}", prefix, ts.format("%Y-%m-%dT%H:%M:%S%.6f"))
}

/// Publishes guest logs to the object store.
pub struct LogShipper {
    store: Arc<dyn ObjectStore>,
    chunk_size: usize,
    expiry: std::time::Duration,
    logs: BTreeMap<String, GuestLog>,
}

impl LogShipper {
    /// Create a shipper for `definitions`.
    pub fn new(config: &Config, store: Arc<dyn ObjectStore>, definitions: Vec<LogDefinition>) -> Self {
        let logs = definitions
            .into_iter()
            .map(|d| (d.name.clone(), GuestLog::new(d, config)))
            .collect();
        Self {
            store,
            chunk_size: config.log_chunk_size.max(1),
            expiry: config.log_expiry,
            logs,
        }
    }

    /// Shipper for the PostgreSQL logs.
    pub fn for_postgres(config: &Config, store: Arc<dyn ObjectStore>) -> Self {
        Self::new(config, store, LogDefinition::postgres(config))
    }

    /// A log by name.
    pub fn get(&self, name: &str) -> Option<&GuestLog> {
        self.logs.get(name)
    }

    fn authorized(&mut self, name: &str, is_admin: bool) -> Result<&mut GuestLog> {
        let log = self
            .logs
            .get_mut(name)
            .ok_or_else(|| Error::LogNotFound(name.to_string()))?;
        if !is_admin && !log.definition.exposed {
            return Err(Error::LogAccessForbidden(name.to_string()));
        }
        Ok(log)
    }

    /// Logs visible to the caller.
    pub async fn list(
        &mut self,
        configuration: &ConfigurationManager,
        is_admin: bool,
    ) -> Result<Vec<GuestLogInfo>> {
        let mut infos = Vec::new();
        for log in self.logs.values_mut() {
            if !is_admin && !log.definition.exposed {
                continue;
            }
            sync_enabled(log, configuration).await?;
            log.refresh_local().await?;
            infos.push(log.info());
        }
        Ok(infos)
    }

    /// Clear the pending-restart marker after the engine restarted.
    pub fn clear_restart_required(&mut self) {
        for log in self.logs.values_mut() {
            log.restart_pending = false;
        }
    }

    /// Apply enable/disable/publish/discard to a log.
    pub async fn action(
        &mut self,
        configuration: &ConfigurationManager,
        action: &LogAction,
        is_admin: bool,
    ) -> Result<GuestLogInfo> {
        if action.enable && action.disable {
            return Err(Error::InvalidInput(
                "cannot enable and disable a log at the same time".to_string(),
            ));
        }
        let store = self.store.clone();
        let chunk_size = self.chunk_size;
        let expiry = self.expiry;
        let log = self.authorized(&action.name, is_admin)?;

        sync_enabled(log, configuration).await?;
        if action.enable || action.disable {
            if log.definition.log_type != LogType::User {
                return Err(Error::InvalidInput(format!(
                    "log '{}' is a system log and cannot be enabled or disabled",
                    log.definition.name
                )));
            }
            toggle(log, configuration, action.enable).await?;
        }

        log.refresh_local().await?;
        if action.discard {
            discard(log, store.as_ref()).await?;
        }
        if action.publish {
            publish(log, store.as_ref(), chunk_size, expiry).await?;
        }
        log.refresh_local().await?;
        Ok(log.info())
    }
}

/// User logs are on while their enable override is in place.
async fn sync_enabled(log: &mut GuestLog, configuration: &ConfigurationManager) -> Result<()> {
    if log.definition.log_type == LogType::User {
        log.enabled = configuration
            .has_system_override(&log.definition.enable_change_id())
            .await?;
    }
    Ok(())
}

async fn toggle(log: &mut GuestLog, configuration: &ConfigurationManager, enable: bool) -> Result<()> {
    let def = &log.definition;
    let (apply_id, apply_set, remove_id) = if enable {
        (def.enable_change_id(), &def.enable_overrides, def.disable_change_id())
    } else {
        (def.disable_change_id(), &def.disable_overrides, def.enable_change_id())
    };
    if !apply_set.is_empty() {
        configuration.apply_system_override(apply_set, Some(&apply_id)).await?;
    }
    configuration.remove_system_override(Some(&remove_id)).await?;

    log.enabled = enable;
    if def.restart_required {
        log.restart_pending = true;
    }
    info!(log = %def.name, enable, restart_required = def.restart_required, "Log toggled");
    Ok(())
}

async fn discard(log: &mut GuestLog, store: &dyn ObjectStore) -> Result<()> {
    let objects = store.list_objects(&log.container, &log.prefix).await?;
    for object in &objects {
        store.delete_object(&log.container, &object.name).await?;
    }
    store.delete_object(&log.container, &log.metafile).await?;
    log.published_size = 0;
    log.published_header_hash = None;
    log.discarded = true;
    info!(log = %log.definition.name, removed = objects.len(), "Log discarded");
    Ok(())
}

async fn read_metafile(log: &GuestLog, store: &dyn ObjectStore) -> Result<Option<LogMetafile>> {
    match store.get_object(&log.container, &log.metafile).await? {
        Some(body) => match serde_json::from_slice(&body) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) => {
                warn!(log = %log.definition.name, error = %e, "Ignoring unreadable metafile");
                Ok(None)
            }
        },
        None => Ok(None),
    }
}

async fn write_metafile(
    log: &GuestLog,
    store: &dyn ObjectStore,
    expiry: std::time::Duration,
) -> Result<()> {
    let body = serde_json::to_vec(&log.metafile_body())?;
    store
        .put_object(&log.container, &log.metafile, body, Some(expiry))
        .await?;
    Ok(())
}

async fn publish(
    log: &mut GuestLog,
    store: &dyn ObjectStore,
    chunk_size: usize,
    expiry: std::time::Duration,
) -> Result<()> {
    store.ensure_container(&log.container).await?;
    log.discarded = false;
    match read_metafile(log, store).await? {
        Some(meta) => {
            log.published_size = meta.log_size;
            log.published_header_hash = meta.log_header_digest;
        }
        None => {
            log.published_size = 0;
            log.published_header_hash = None;
        }
    }
    log.refresh_local().await?;

    if log.status == LogStatus::Unavailable || log.size == 0 {
        debug!(log = %log.definition.name, "Nothing to publish");
        return Ok(());
    }
    if log.rotated() {
        info!(log = %log.definition.name, "Log rotated since last publish, discarding published content");
        discard(log, store).await?;
        log.discarded = false;
    }
    log.published_header_hash = log.header_hash.clone();
    write_metafile(log, store, expiry).await?;

    let target = log.size;
    let mut file = File::open(&log.definition.file).await?;
    file.seek(SeekFrom::Start(log.published_size)).await?;
    let mut previous = None;
    let mut chunks = 0usize;
    while log.published_size < target {
        let want = chunk_size.min((target - log.published_size) as usize);
        let mut buf = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        buf.truncate(filled);
        let name = chunk_name(&log.prefix, &mut previous);
        store.put_object(&log.container, &name, buf, Some(expiry)).await?;
        log.published_size += filled as u64;
        chunks += 1;
    }

    write_metafile(log, store, expiry).await?;
    match read_metafile(log, store).await? {
        Some(meta) if meta.log_size == log.published_size => {}
        other => warn!(
            log = %log.definition.name,
            expected = log.published_size,
            found = ?other.map(|m| m.log_size),
            "Metafile not yet visible after publish"
        ),
    }
    info!(log = %log.definition.name, chunks, published = log.published_size, "Log published");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_names_strictly_increase() {
        let mut previous = None;
        let a = chunk_name("i/postgresql-general/", &mut previous);
        let b = chunk_name("i/postgresql-general/", &mut previous);
        assert!(a.starts_with("i/postgresql-general/log-"));
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_header_hash_uses_first_line() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("log");
        std::fs::write(&path, "first\nsecond\n").unwrap();
        let a = header_hash(&path).await.unwrap();
        std::fs::write(&path, "first\nother\nmore\n").unwrap();
        let b = header_hash(&path).await.unwrap();
        assert_eq!(a, b);
        std::fs::write(&path, "").unwrap();
        assert_eq!(header_hash(&path).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unterminated_first_line_has_no_header() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("log");
        std::fs::write(&path, "2025-01-01 star").unwrap();
        assert_eq!(header_hash(&path).await.unwrap(), None);
        std::fs::write(&path, "2025-01-01 starting up").unwrap();
        assert_eq!(header_hash(&path).await.unwrap(), None);
        std::fs::write(&path, "2025-01-01 starting up\n").unwrap();
        assert!(header_hash(&path).await.unwrap().is_some());
    }

    #[test]
    fn test_growing_first_line_is_not_rotation() {
        let config = Config::default();
        let mut log = GuestLog::new(LogDefinition::postgres(&config).remove(0), &config);
        log.published_size = 15;
        log.published_header_hash = None;
        log.size = 23;
        log.header_hash = Some("complete".to_string());
        assert!(!log.rotated());

        log.published_header_hash = Some("complete".to_string());
        log.header_hash = Some("other".to_string());
        assert!(log.rotated());

        log.header_hash = Some("complete".to_string());
        log.size = 10;
        assert!(log.rotated());
    }

    #[test]
    fn test_prefix_and_metafile_names() {
        let config = Config {
            instance_id: "inst-1".into(),
            ..Default::default()
        };
        let log = GuestLog::new(LogDefinition::postgres(&config).remove(1), &config);
        assert_eq!(log.prefix(), "inst-1/postgresql-general/");
        assert_eq!(log.metafile(), "inst-1/postgresql-general_metafile");
    }

    #[test]
    fn test_status_serializes_like_control_plane() {
        assert_eq!(
            serde_json::to_string(&LogStatus::RestartRequired).unwrap(),
            "\"Restart_Required\""
        );
        assert_eq!(serde_json::to_string(&LogType::Sys).unwrap(), "\"SYS\"");
    }
}
