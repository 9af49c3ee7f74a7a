// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Module drivers.

use std::path::Path;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::{Error, Result};

/// Outcome reported by a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverOutcome {
    /// Whether the driver succeeded
    pub ok: bool,
    /// Human readable result
    pub message: String,
}

impl DriverOutcome {
    /// Successful outcome.
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    /// Failed outcome.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

/// Applies one module type.
///
/// `contents_file` holds the module contents base64 encoded; use
/// [`read_contents`] to decode it. Drivers must tolerate being applied
/// repeatedly with the same contents.
#[async_trait]
pub trait ModuleDriver: Send + Sync {
    /// Module type handled by this driver.
    fn module_type(&self) -> &'static str;

    /// Short description.
    fn description(&self) -> &'static str;

    /// Apply a module.
    async fn apply(
        &self,
        name: &str,
        datastore: &str,
        datastore_version: &str,
        contents_file: &Path,
    ) -> Result<DriverOutcome>;

    /// Undo a module.
    async fn remove(
        &self,
        name: &str,
        datastore: &str,
        datastore_version: &str,
        contents_file: &Path,
    ) -> Result<DriverOutcome>;
}

/// Decode a contents file written by the applier.
pub async fn read_contents(contents_file: &Path) -> Result<Vec<u8>> {
    let encoded = tokio::fs::read_to_string(contents_file).await?;
    STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::InvalidInput(format!("module contents are not base64: {}", e)))
}

/// Test driver: succeeds when the contents carry a `message=` line and
/// echoes that message.
#[derive(Debug, Default)]
pub struct PingDriver;

impl PingDriver {
    fn message(contents: &[u8]) -> Option<String> {
        String::from_utf8_lossy(contents)
            .lines()
            .find_map(|line| line.trim().strip_prefix("message=").map(|m| m.trim().to_string()))
    }
}

#[async_trait]
impl ModuleDriver for PingDriver {
    fn module_type(&self) -> &'static str {
        "ping"
    }

    fn description(&self) -> &'static str {
        "Ping guest-agent module driver"
    }

    async fn apply(
        &self,
        name: &str,
        _datastore: &str,
        _datastore_version: &str,
        contents_file: &Path,
    ) -> Result<DriverOutcome> {
        let contents = read_contents(contents_file).await?;
        Ok(match Self::message(&contents) {
            Some(message) => DriverOutcome::ok(message),
            None => DriverOutcome::failed(format!("Message not found in contents of module '{}'", name)),
        })
    }

    async fn remove(
        &self,
        _name: &str,
        _datastore: &str,
        _datastore_version: &str,
        _contents_file: &Path,
    ) -> Result<DriverOutcome> {
        Ok(DriverOutcome::ok("Removed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ping_driver_echoes_message() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("contents.dat");
        std::fs::write(&file, STANDARD.encode("# ping\nmessage=Hello World\n")).unwrap();
        let outcome = PingDriver.apply("m1", "postgresql", "16", &file).await.unwrap();
        assert_eq!(outcome, DriverOutcome::ok("Hello World"));
    }

    #[tokio::test]
    async fn test_ping_driver_without_message_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("contents.dat");
        std::fs::write(&file, STANDARD.encode("nothing here")).unwrap();
        let outcome = PingDriver.apply("m1", "postgresql", "16", &file).await.unwrap();
        assert!(!outcome.ok);
    }
}
