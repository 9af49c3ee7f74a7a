// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for module application through the manager.

mod common;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use common::TestContext;
use md5::{Digest, Md5};
use pg_guest::error::ErrorKind;
use pg_guest::module_applier::drivers::read_contents;
use pg_guest::module_applier::{DriverOutcome, ModuleDescriptor, ModuleDriver, ModuleRef, ModuleStatus};
use tokio::sync::Mutex;

fn descriptor(id: &str, module_type: &str, raw: &str, apply_order: u32) -> ModuleDescriptor {
    ModuleDescriptor {
        id: id.to_string(),
        name: format!("module-{}", id),
        module_type: module_type.to_string(),
        tenant: "tenant-a".to_string(),
        datastore: "postgresql".to_string(),
        datastore_version: "16".to_string(),
        md5: hex::encode(Md5::digest(raw.as_bytes())),
        contents: STANDARD.encode(raw),
        apply_order,
        priority_apply: false,
        auto_apply: false,
        visible: true,
    }
}

fn ping(id: &str, message: &str, apply_order: u32) -> ModuleDescriptor {
    descriptor(id, "ping", &format!("message={}\n", message), apply_order)
}

/// Driver recording the decoded contents it was given.
#[derive(Default)]
struct RecordingDriver {
    applied: Mutex<Vec<String>>,
}

#[async_trait]
impl ModuleDriver for RecordingDriver {
    fn module_type(&self) -> &'static str {
        "recording"
    }

    fn description(&self) -> &'static str {
        "Records applied contents"
    }

    async fn apply(
        &self,
        name: &str,
        _datastore: &str,
        _datastore_version: &str,
        contents_file: &Path,
    ) -> pg_guest::Result<DriverOutcome> {
        let contents = read_contents(contents_file).await?;
        self.applied
            .lock()
            .await
            .push(format!("{}:{}", name, String::from_utf8_lossy(&contents)));
        Ok(DriverOutcome::ok("recorded"))
    }

    async fn remove(
        &self,
        _name: &str,
        _datastore: &str,
        _datastore_version: &str,
        _contents_file: &Path,
    ) -> pg_guest::Result<DriverOutcome> {
        Ok(DriverOutcome::failed("cannot undo"))
    }
}

#[tokio::test]
async fn test_apply_and_list_in_order() {
    let ctx = TestContext::prepared().await;

    let records = ctx
        .manager
        .module_apply(&[ping("b", "second", 5), ping("a", "first", 1)], false)
        .await
        .unwrap();
    let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert!(records.iter().all(|r| r.status == ModuleStatus::Ok));
    assert_eq!(records[0].message, "first");

    let listed = ctx.manager.module_list(false, false).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().all(|r| r.contents.is_none()));

    let with_contents = ctx.manager.module_list(true, false).await.unwrap();
    assert_eq!(
        with_contents[0].contents.as_deref(),
        Some(STANDARD.encode("message=first\n").as_str())
    );
}

#[tokio::test]
async fn test_reapply_keeps_created_timestamp() {
    let ctx = TestContext::prepared().await;
    let first = ctx
        .manager
        .module_apply(&[ping("a", "v1", 1)], false)
        .await
        .unwrap();
    let second = ctx
        .manager
        .module_apply(&[ping("a", "v2", 1)], false)
        .await
        .unwrap();

    assert_eq!(first[0].created, second[0].created);
    assert!(second[0].updated >= first[0].updated);
    assert_eq!(second[0].message, "v2");
    assert_eq!(ctx.manager.module_list(false, true).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_driver_failure_is_recorded() {
    let ctx = TestContext::prepared().await;
    let records = ctx
        .manager
        .module_apply(&[descriptor("x", "ping", "no message here", 1)], false)
        .await
        .unwrap();
    assert_eq!(records[0].status, ModuleStatus::Error);
    assert!(records[0].message.contains("Message not found"));
}

#[tokio::test]
async fn test_admin_only_modules() {
    let ctx = TestContext::prepared().await;
    let mut module = ping("adm", "secret", 1);
    module.tenant = "all".to_string();

    let err = ctx
        .manager
        .module_apply(std::slice::from_ref(&module), false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);

    ctx.manager.module_apply(&[module], true).await.unwrap();
    assert!(ctx.manager.module_list(false, false).await.unwrap().is_empty());
    assert_eq!(ctx.manager.module_list(false, true).await.unwrap().len(), 1);

    let module_ref = ModuleRef {
        id: "adm".to_string(),
        module_type: "ping".to_string(),
    };
    let err = ctx
        .manager
        .module_remove(&module_ref, false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
    ctx.manager.module_remove(&module_ref, true).await.unwrap();
}

#[tokio::test]
async fn test_remove_marks_record() {
    let ctx = TestContext::prepared().await;
    ctx.manager
        .module_apply(&[ping("a", "hello", 1)], false)
        .await
        .unwrap();

    let module_ref = ModuleRef {
        id: "a".to_string(),
        module_type: "ping".to_string(),
    };
    ctx.manager.module_remove(&module_ref, false).await.unwrap();

    let listed = ctx.manager.module_list(false, false).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].removed.is_some());
    assert_eq!(listed[0].message, "Removed");

    let err = ctx
        .manager
        .module_remove(
            &ModuleRef {
                id: "never".to_string(),
                module_type: "ping".to_string(),
            },
            false,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_unknown_module_type_applies_nothing() {
    let ctx = TestContext::prepared().await;
    let err = ctx
        .manager
        .module_apply(&[ping("a", "ok", 1), descriptor("b", "nope", "x", 2)], false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(ctx.manager.module_list(false, true).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_registered_driver_receives_decoded_contents() {
    let mut ctx = TestContext::prepared().await;
    let driver = Arc::new(RecordingDriver::default());
    ctx.manager.modules_mut().register(driver.clone());

    let records = ctx
        .manager
        .module_apply(&[descriptor("r1", "recording", "payload", 1)], false)
        .await
        .unwrap();
    assert_eq!(records[0].status, ModuleStatus::Ok);
    assert_eq!(*driver.applied.lock().await, vec!["module-r1:payload".to_string()]);

    ctx.manager
        .module_remove(
            &ModuleRef {
                id: "r1".to_string(),
                module_type: "recording".to_string(),
            },
            false,
        )
        .await
        .unwrap();
    let listed = ctx.manager.module_list(false, false).await.unwrap();
    assert_eq!(listed[0].status, ModuleStatus::Error);
    assert_eq!(listed[0].message, "cannot undo");
}
