// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the RPC socket server and the runtime wiring.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::TestContext;
use pg_guest::admin::MockAdmin;
use pg_guest::object_store::InMemoryObjectStore;
use pg_guest::runtime::GuestRuntime;
use pg_guest::server::run_server_with_shutdown;
use pg_guest::supervisor::MockSupervisor;
use pg_guest::volume::VolumeTools;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::watch;

async fn wait_for_socket(path: &Path) {
    for _ in 0..200 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("socket {} never appeared", path.display());
}

/// Client holding one connection to the server.
struct Client {
    reader: tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>,
    writer: tokio::net::unix::OwnedWriteHalf,
}

impl Client {
    async fn connect(path: &Path) -> Self {
        let stream = UnixStream::connect(path).await.unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn send_line(&mut self, line: &str) -> Value {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        let reply = self.reader.next_line().await.unwrap().unwrap();
        serde_json::from_str(&reply).unwrap()
    }

    async fn call(&mut self, request: Value) -> Value {
        self.send_line(&request.to_string()).await
    }
}

#[tokio::test]
async fn test_server_answers_requests_line_by_line() {
    let ctx = TestContext::new().into_shared();
    let socket = ctx.config.socket_path.clone();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(run_server_with_shutdown(
        socket.clone(),
        ctx.manager.clone(),
        shutdown_rx,
    ));
    wait_for_socket(&socket).await;

    let mut client = Client::connect(&socket).await;

    let reply = client
        .call(json!({"method": "prepare", "args": {"databases": [{"name": "app"}]}}))
        .await;
    assert_eq!(reply, json!({"ok": true, "result": null}));

    let reply = client.call(json!({"method": "get_service_status"})).await;
    assert_eq!(reply["result"], json!("HEALTHY"));

    let reply = client.send_line("{not json").await;
    assert_eq!(reply["ok"], json!(false));
    assert_eq!(reply["error"]["kind"], json!("invalid_input"));

    // the connection survives a malformed line
    let reply = client
        .call(json!({"method": "list_databases", "context": {"is_admin": true}}))
        .await;
    assert_eq!(reply["result"]["items"], json!([{"name": "app"}]));

    let reply = client.call(json!({"method": "explode"})).await;
    assert_eq!(reply["error"]["kind"], json!("not_supported"));

    shutdown_tx.send(true).unwrap();
    server.await.unwrap().unwrap();
    assert!(!socket.exists());
}

#[tokio::test]
async fn test_server_replaces_stale_socket_file() {
    let ctx = TestContext::new().into_shared();
    let socket = ctx.config.socket_path.clone();
    std::fs::create_dir_all(socket.parent().unwrap()).unwrap();
    std::fs::write(&socket, b"stale").unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(run_server_with_shutdown(
        socket.clone(),
        ctx.manager.clone(),
        shutdown_rx,
    ));

    let mut client = None;
    for _ in 0..200 {
        if let Ok(stream) = UnixStream::connect(&socket).await {
            drop(stream);
            client = Some(Client::connect(&socket).await);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let mut client = client.expect("server should accept connections");
    let reply = client.call(json!({"method": "get_service_status"})).await;
    assert_eq!(reply["result"], json!("NEW"));

    shutdown_tx.send(true).unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_runtime_start_and_shutdown() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let config = common::test_config(temp_dir.path());
    std::fs::create_dir_all(&config.home_dir).unwrap();

    let supervisor = Arc::new(MockSupervisor::new());
    let runtime = GuestRuntime::builder()
        .config(config.clone())
        .supervisor(supervisor.clone())
        .admin(Arc::new(MockAdmin::default()))
        .object_store(Arc::new(InMemoryObjectStore::new()))
        .volume_tools(VolumeTools::all("true"))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap();

    assert_eq!(runtime.socket_path(), &config.socket_path);
    wait_for_socket(runtime.socket_path()).await;
    assert!(runtime.is_running());

    let mut client = Client::connect(runtime.socket_path()).await;
    let reply = client.call(json!({"method": "prepare"})).await;
    assert_eq!(reply["ok"], json!(true));
    assert_eq!(supervisor.start_count().await, 1);
    drop(client);

    runtime.shutdown().await.unwrap();
    assert!(!config.socket_path.exists());
}

#[tokio::test]
async fn test_runtime_build_requires_parts() {
    let err = GuestRuntime::builder().build().err().unwrap();
    assert!(err.to_string().contains("config is required"));

    let temp_dir = tempfile::TempDir::new().unwrap();
    let err = GuestRuntime::builder()
        .config(common::test_config(temp_dir.path()))
        .supervisor(Arc::new(MockSupervisor::new()))
        .build()
        .err()
        .unwrap();
    assert!(err.to_string().contains("admin is required"));
}
