// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for the Swift object store client against a mock HTTP server.

use std::time::Duration;

use pg_guest::object_store::{ObjectStore, ObjectStoreError, SwiftObjectStore};
use serde_json::json;
use wiremock::matchers::{body_bytes, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOKEN: &str = "tok-123";

fn store(server: &MockServer) -> SwiftObjectStore {
    // trailing slash is trimmed
    SwiftObjectStore::new(format!("{}/v1/AUTH_t/", server.uri()), TOKEN, Duration::from_secs(5))
        .unwrap()
}

#[tokio::test]
async fn test_put_object_sends_token_and_expiry() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/v1/AUTH_t/logs"))
        .and(header("X-Auth-Token", TOKEN))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("PUT"))
        .and(path("/v1/AUTH_t/logs/inst-1/guest/log-0001"))
        .and(header("X-Auth-Token", TOKEN))
        .and(header("X-Delete-After", "604800"))
        .and(body_bytes(b"chunk".to_vec()))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let store = store(&server);
    store.ensure_container("logs").await.unwrap();
    store
        .put_object(
            "logs",
            "inst-1/guest/log-0001",
            b"chunk".to_vec(),
            Some(Duration::from_secs(7 * 24 * 3600)),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_get_and_delete_missing_objects() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/AUTH_t/logs/meta"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"{\"log_size\": 3}".to_vec()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/AUTH_t/logs/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/v1/AUTH_t/logs/gone"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let store = store(&server);
    assert_eq!(
        store.get_object("logs", "meta").await.unwrap(),
        Some(b"{\"log_size\": 3}".to_vec())
    );
    assert_eq!(store.get_object("logs", "gone").await.unwrap(), None);
    store.delete_object("logs", "gone").await.unwrap();
}

#[tokio::test]
async fn test_list_objects_follows_markers() {
    let server = MockServer::start().await;

    let first: Vec<_> = (0..SwiftObjectStore::LIST_LIMIT)
        .map(|i| json!({"name": format!("p/{:05}", i), "bytes": 10}))
        .collect();
    let last_name = format!("p/{:05}", SwiftObjectStore::LIST_LIMIT - 1);

    Mock::given(method("GET"))
        .and(path("/v1/AUTH_t/logs"))
        .and(query_param("prefix", "p/"))
        .and(query_param("marker", last_name.as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"name": "p/99999", "bytes": 3}
        ])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/AUTH_t/logs"))
        .and(query_param("format", "json"))
        .and(query_param("prefix", "p/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(first))
        .expect(1)
        .mount(&server)
        .await;

    let objects = store(&server).list_objects("logs", "p/").await.unwrap();
    assert_eq!(objects.len(), SwiftObjectStore::LIST_LIMIT + 1);
    assert_eq!(objects[0].name, "p/00000");
    assert_eq!(objects[0].bytes, 10);
    assert_eq!(objects.last().unwrap().name, "p/99999");
}

#[tokio::test]
async fn test_list_missing_container_is_empty() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/AUTH_t/nothing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let objects = store(&server).list_objects("nothing", "").await.unwrap();
    assert!(objects.is_empty());
}

#[tokio::test]
async fn test_error_status_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad token"))
        .mount(&server)
        .await;

    let err = store(&server)
        .put_object("logs", "x", Vec::new(), None)
        .await
        .unwrap_err();
    match err {
        ObjectStoreError::Status {
            operation,
            status,
            message,
        } => {
            assert_eq!(operation, "put_object");
            assert_eq!(status, 401);
            assert_eq!(message, "bad token");
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_unreachable_store() {
    let store = SwiftObjectStore::new("http://127.0.0.1:1/v1/AUTH_t", TOKEN, Duration::from_secs(2))
        .unwrap();
    let err = store.get_object("logs", "x").await.unwrap_err();
    assert!(matches!(err, ObjectStoreError::Unreachable(_)));
}
