// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for RPC request routing.

mod common;

use common::{SharedContext, TestContext};
use pg_guest::error::ErrorKind;
use pg_guest::handlers::{Context, RpcRequest, RpcResponse, handle_request};
use serde_json::{Value, json};

async fn call(ctx: &SharedContext, method: &str, args: Value) -> RpcResponse {
    handle_request(&ctx.manager, RpcRequest::new(method, args)).await
}

async fn ok(ctx: &SharedContext, method: &str, args: Value) -> Value {
    let response = call(ctx, method, args).await;
    assert!(response.ok, "{} failed: {:?}", method, response.error);
    response.result.unwrap_or(Value::Null)
}

async fn err_kind(ctx: &SharedContext, method: &str, args: Value) -> ErrorKind {
    let response = call(ctx, method, args).await;
    assert!(!response.ok, "{} unexpectedly succeeded", method);
    response.error.unwrap().kind
}

async fn prepared() -> SharedContext {
    let ctx = TestContext::new().into_shared();
    ok(
        &ctx,
        "prepare",
        json!({
            "databases": [{"name": "app"}],
            "users": [{"name": "app_user", "password": "pw", "databases": [{"name": "app"}]}]
        }),
    )
    .await;
    ctx
}

#[tokio::test]
async fn test_prepare_and_status() {
    let ctx = TestContext::new().into_shared();
    assert_eq!(ok(&ctx, "get_service_status", Value::Null).await, json!("NEW"));

    ok(&ctx, "prepare", json!({"databases": [{"name": "app"}]})).await;

    assert_eq!(ok(&ctx, "get_service_status", Value::Null).await, json!("HEALTHY"));
    ok(&ctx, "update_status", Value::Null).await;
    assert_eq!(ok(&ctx, "get_service_status", Value::Null).await, json!("HEALTHY"));
}

#[tokio::test]
async fn test_user_and_database_methods() {
    let ctx = prepared().await;

    let databases = ok(&ctx, "list_databases", json!({})).await;
    assert_eq!(databases["items"], json!([{"name": "app"}]));

    ok(&ctx, "create_database", json!({"databases": [{"name": "reports"}]})).await;
    ok(
        &ctx,
        "grant_access",
        json!({"username": "app_user", "databases": ["reports"]}),
    )
    .await;
    let access = ok(&ctx, "list_access", json!({"username": "app_user"})).await;
    assert_eq!(access, json!([{"name": "app"}, {"name": "reports"}]));

    ok(
        &ctx,
        "revoke_access",
        json!({"username": "app_user", "database": "app"}),
    )
    .await;
    let user = ok(&ctx, "get_user", json!({"username": "app_user"})).await;
    assert_eq!(user["databases"], json!([{"name": "reports"}]));

    let page = ok(&ctx, "list_users", json!({"limit": 10})).await;
    assert_eq!(page["items"].as_array().unwrap().len(), 1);
    assert!(page["next_marker"].is_null());

    ok(&ctx, "delete_database", json!({"database": {"name": "reports"}})).await;
    ok(&ctx, "delete_user", json!({"user": {"name": "app_user"}})).await;
    assert_eq!(
        ok(&ctx, "get_user", json!({"username": "app_user"})).await,
        Value::Null
    );
}

#[tokio::test]
async fn test_root_methods() {
    let ctx = prepared().await;
    assert_eq!(ok(&ctx, "is_root_enabled", Value::Null).await, json!(false));

    let root = ok(&ctx, "enable_root", json!({"root_password": "hunter2"})).await;
    assert_eq!(root["name"], json!("root"));
    assert_eq!(root["password"], json!("hunter2"));
    assert_eq!(ok(&ctx, "is_root_enabled", Value::Null).await, json!(true));

    ok(&ctx, "disable_root", Value::Null).await;
    assert_ne!(
        ctx.admin.password_of("root").await.as_deref(),
        Some("hunter2")
    );
}

#[tokio::test]
async fn test_error_kinds_on_the_wire() {
    let ctx = prepared().await;

    assert_eq!(err_kind(&ctx, "frobnicate", Value::Null).await, ErrorKind::NotSupported);
    assert_eq!(
        err_kind(&ctx, "create_database", json!({"databases": [{"name": "postgres"}]})).await,
        ErrorKind::Forbidden
    );
    assert_eq!(
        err_kind(&ctx, "create_database", json!({"databases": [{"name": "app"}]})).await,
        ErrorKind::Conflict
    );
    assert_eq!(
        err_kind(&ctx, "delete_user", json!({"user": {"name": "ghost"}})).await,
        ErrorKind::NotFound
    );
    assert_eq!(
        err_kind(&ctx, "wait_for_txn", json!({"txn": "not-an-lsn"})).await,
        ErrorKind::InvalidInput
    );
    assert_eq!(
        err_kind(&ctx, "create_user", json!({"users": "nope"})).await,
        ErrorKind::InvalidInput
    );
    assert_eq!(
        err_kind(&ctx, "mount_volume", json!({})).await,
        ErrorKind::InvalidInput
    );
    assert_eq!(
        err_kind(&ctx, "update_overrides", json!({"remove": true})).await,
        ErrorKind::PreconditionFailed
    );

    let response = call(&ctx, "delete_user", json!({"user": {"name": "ghost"}})).await;
    let wire = serde_json::to_value(&response).unwrap();
    assert_eq!(wire["ok"], json!(false));
    assert_eq!(wire["error"]["kind"], json!("not_found"));
    assert!(wire.get("result").is_none());
}

#[tokio::test]
async fn test_txn_ids_are_lsn_strings() {
    let ctx = prepared().await;
    let lsn = ok(&ctx, "get_latest_txn_id", Value::Null).await;
    assert_eq!(lsn, json!("0/3000060"));

    ctx.admin.set_replica(true).await;
    ctx.admin.set_replay_lsn("0/3000060".parse().unwrap()).await;
    ok(&ctx, "wait_for_txn", json!({"txn": "0/3000000"})).await;
}

#[tokio::test]
async fn test_configuration_methods() {
    let ctx = prepared().await;

    ok(
        &ctx,
        "update_overrides",
        json!({"overrides": {"work_mem": "64MB"}}),
    )
    .await;
    ok(&ctx, "apply_overrides", json!({"overrides": {"work_mem": "64MB"}})).await;
    assert_eq!(ctx.admin.reload_count().await, 1);

    ok(&ctx, "update_overrides", json!({"remove": true})).await;

    ok(&ctx, "stop_db", json!({"do_not_start_on_reboot": true})).await;
    assert_eq!(ok(&ctx, "get_service_status", Value::Null).await, json!("SHUTDOWN"));
    ok(
        &ctx,
        "start_db_with_conf_changes",
        json!({"config_contents": "max_connections = 75\n"}),
    )
    .await;
    assert_eq!(ok(&ctx, "get_service_status", Value::Null).await, json!("HEALTHY"));

    assert_eq!(
        err_kind(&ctx, "reset_configuration", json!({})).await,
        ErrorKind::InvalidInput
    );
    ok(
        &ctx,
        "reset_configuration",
        json!({"config_contents": "max_connections = 80\n"}),
    )
    .await;
    ok(&ctx, "restart", Value::Null).await;
}

#[tokio::test]
async fn test_log_methods_respect_context() {
    let ctx = prepared().await;

    let tenant = RpcRequest::new("guest_log_list", Value::Null).with_context(Context {
        tenant: Some("t1".to_string()),
        is_admin: false,
    });
    let response = handle_request(&ctx.manager, tenant).await;
    let logs = response.result.unwrap();
    assert_eq!(logs.as_array().unwrap().len(), 1);
    assert_eq!(logs[0]["name"], json!("general"));
    assert_eq!(logs[0]["status"], json!("Disabled"));

    let admin = RpcRequest::new("guest_log_action", json!({"name": "guest", "publish": true}))
        .with_context(Context {
            tenant: None,
            is_admin: true,
        });
    let response = handle_request(&ctx.manager, admin).await;
    assert!(response.ok);
    assert_eq!(response.result.unwrap()["status"], json!("Unavailable"));

    let forbidden = RpcRequest::new("guest_log_action", json!({"name": "guest", "publish": true}));
    let response = handle_request(&ctx.manager, forbidden).await;
    assert_eq!(response.error.unwrap().kind, ErrorKind::Forbidden);
}

#[tokio::test]
async fn test_backup_window_methods() {
    let ctx = prepared().await;
    let label = ok(&ctx, "pre_create_backup", Value::Null).await;
    assert!(label.as_str().unwrap().starts_with("snapshot-"));
    ok(&ctx, "post_create_backup", Value::Null).await;
    assert_eq!(
        err_kind(&ctx, "post_create_backup", Value::Null).await,
        ErrorKind::PreconditionFailed
    );
}

#[tokio::test]
async fn test_filesystem_and_wal_methods() {
    let ctx = prepared().await;
    let stats = ok(
        &ctx,
        "get_filesystem_stats",
        json!({"fs_path": ctx.temp_dir.path()}),
    )
    .await;
    assert!(stats["total"].as_u64().unwrap() > 0);
    assert!(stats["block_size"].as_u64().unwrap() > 0);

    let report = ok(&ctx, "cleanup_wal_archive", Value::Null).await;
    assert_eq!(report["removed"], json!([]));
    assert_eq!(report["forced"], json!(false));

    ok(&ctx, "make_read_only", json!({"read_only": true})).await;
}

#[tokio::test]
async fn test_module_methods() {
    use base64::Engine;
    use md5::{Digest, Md5};

    let ctx = prepared().await;
    let raw = "message=hello\n";
    let module = json!({
        "id": "m1",
        "name": "hello",
        "type": "ping",
        "tenant": "t1",
        "md5": hex::encode(Md5::digest(raw.as_bytes())),
        "contents": base64::engine::general_purpose::STANDARD.encode(raw),
    });

    let applied = ok(&ctx, "module_apply", json!({"modules": [module]})).await;
    assert_eq!(applied[0]["status"], json!("OK"));
    assert_eq!(applied[0]["message"], json!("hello"));

    let listed = ok(&ctx, "module_list", json!({"include_contents": true})).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert!(listed[0]["contents"].is_string());

    ok(
        &ctx,
        "module_remove",
        json!({"module": {"id": "m1", "type": "ping"}}),
    )
    .await;
}
