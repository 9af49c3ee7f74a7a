// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Object store client used for log shipping.
//!
//! The store speaks the Swift object API: containers hold flat object names,
//! listings are marker-paginated, and `X-Delete-After` sets per-object
//! retention. [`SwiftObjectStore`] talks HTTP; [`InMemoryObjectStore`] is
//! used in tests and when no store is configured.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Errors from the object store.
#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreError {
    /// Transport failure (connect, timeout, TLS).
    #[error("object store unreachable: {0}")]
    Unreachable(String),

    /// The store answered with an unexpected status.
    #[error("object store returned {status} for {operation}: {message}")]
    Status {
        /// Operation attempted
        operation: String,
        /// HTTP status
        status: u16,
        /// Response body
        message: String,
    },

    /// Malformed response body.
    #[error("invalid object store response: {0}")]
    InvalidResponse(String),

    /// No store configured for this instance.
    #[error("object store not configured")]
    NotConfigured,
}

impl From<reqwest::Error> for ObjectStoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ObjectStoreError::InvalidResponse(err.to_string())
        } else {
            ObjectStoreError::Unreachable(err.to_string())
        }
    }
}

/// Result type for object store operations.
pub type Result<T> = std::result::Result<T, ObjectStoreError>;

/// Entry of a container listing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ObjectInfo {
    /// Object name
    pub name: String,
    /// Object size
    #[serde(default)]
    pub bytes: u64,
}

/// Object storage operations.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create the container if needed.
    async fn ensure_container(&self, container: &str) -> Result<()>;

    /// Store an object, replacing any previous value.
    ///
    /// `delete_after` sets the retention of the object.
    async fn put_object(
        &self,
        container: &str,
        name: &str,
        body: Vec<u8>,
        delete_after: Option<Duration>,
    ) -> Result<()>;

    /// Fetch an object, or `None` if it does not exist.
    async fn get_object(&self, container: &str, name: &str) -> Result<Option<Vec<u8>>>;

    /// Delete an object. Deleting a missing object succeeds.
    async fn delete_object(&self, container: &str, name: &str) -> Result<()>;

    /// All objects whose name starts with `prefix`, sorted by name.
    async fn list_objects(&self, container: &str, prefix: &str) -> Result<Vec<ObjectInfo>>;
}

/// Swift object store over HTTP.
pub struct SwiftObjectStore {
    client: reqwest::Client,
    storage_url: String,
    token: String,
}

impl SwiftObjectStore {
    /// Page size requested from container listings.
    pub const LIST_LIMIT: usize = 1000;

    /// Create a client for `storage_url` (the account URL) authenticated by `token`.
    pub fn new(storage_url: impl Into<String>, token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ObjectStoreError::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            storage_url: storage_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    fn container_url(&self, container: &str) -> String {
        format!("{}/{}", self.storage_url, container)
    }

    fn object_url(&self, container: &str, name: &str) -> String {
        format!("{}/{}/{}", self.storage_url, container, name)
    }

    async fn check(operation: &str, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(ObjectStoreError::Status {
            operation: operation.to_string(),
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl ObjectStore for SwiftObjectStore {
    async fn ensure_container(&self, container: &str) -> Result<()> {
        let response = self
            .client
            .put(self.container_url(container))
            .header("X-Auth-Token", &self.token)
            .header("Content-Length", "0")
            .send()
            .await?;
        Self::check("ensure_container", response).await?;
        debug!(container, "Container ensured");
        Ok(())
    }

    async fn put_object(
        &self,
        container: &str,
        name: &str,
        body: Vec<u8>,
        delete_after: Option<Duration>,
    ) -> Result<()> {
        let size = body.len();
        let mut request = self
            .client
            .put(self.object_url(container, name))
            .header("X-Auth-Token", &self.token)
            .body(body);
        if let Some(expiry) = delete_after {
            request = request.header("X-Delete-After", expiry.as_secs().to_string());
        }
        let response = request.send().await?;
        Self::check("put_object", response).await?;
        debug!(container, object = name, size, "Object stored");
        Ok(())
    }

    async fn get_object(&self, container: &str, name: &str) -> Result<Option<Vec<u8>>> {
        let response = self
            .client
            .get(self.object_url(container, name))
            .header("X-Auth-Token", &self.token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check("get_object", response).await?;
        Ok(Some(response.bytes().await?.to_vec()))
    }

    async fn delete_object(&self, container: &str, name: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.object_url(container, name))
            .header("X-Auth-Token", &self.token)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check("delete_object", response).await?;
        debug!(container, object = name, "Object deleted");
        Ok(())
    }

    async fn list_objects(&self, container: &str, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let mut objects: Vec<ObjectInfo> = Vec::new();
        loop {
            let limit = Self::LIST_LIMIT.to_string();
            let mut query = vec![("format", "json"), ("prefix", prefix), ("limit", limit.as_str())];
            let marker = objects.last().map(|o| o.name.clone());
            if let Some(marker) = marker.as_deref() {
                query.push(("marker", marker));
            }
            let response = self
                .client
                .get(self.container_url(container))
                .header("X-Auth-Token", &self.token)
                .query(&query)
                .send()
                .await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(objects);
            }
            let response = Self::check("list_objects", response).await?;
            let page: Vec<ObjectInfo> = response.json().await?;
            let done = page.len() < Self::LIST_LIMIT;
            objects.extend(page);
            if done {
                break;
            }
        }
        Ok(objects)
    }
}

/// Stored object plus retention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Object bytes
    pub body: Vec<u8>,
    /// Retention requested at upload
    pub delete_after: Option<Duration>,
}

/// Object store kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    containers: RwLock<BTreeMap<String, BTreeMap<String, StoredObject>>>,
}

impl InMemoryObjectStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// A stored object with its retention.
    pub async fn object(&self, container: &str, name: &str) -> Option<StoredObject> {
        self.containers
            .read()
            .await
            .get(container)
            .and_then(|objects| objects.get(name))
            .cloned()
    }

    /// Names of every object in `container`.
    pub async fn names(&self, container: &str) -> Vec<String> {
        self.containers
            .read()
            .await
            .get(container)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn ensure_container(&self, container: &str) -> Result<()> {
        self.containers
            .write()
            .await
            .entry(container.to_string())
            .or_default();
        Ok(())
    }

    async fn put_object(
        &self,
        container: &str,
        name: &str,
        body: Vec<u8>,
        delete_after: Option<Duration>,
    ) -> Result<()> {
        let mut containers = self.containers.write().await;
        let objects = containers
            .get_mut(container)
            .ok_or_else(|| ObjectStoreError::Status {
                operation: "put_object".to_string(),
                status: 404,
                message: format!("container '{}' not found", container),
            })?;
        objects.insert(name.to_string(), StoredObject { body, delete_after });
        Ok(())
    }

    async fn get_object(&self, container: &str, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.object(container, name).await.map(|o| o.body))
    }

    async fn delete_object(&self, container: &str, name: &str) -> Result<()> {
        if let Some(objects) = self.containers.write().await.get_mut(container) {
            objects.remove(name);
        }
        Ok(())
    }

    async fn list_objects(&self, container: &str, prefix: &str) -> Result<Vec<ObjectInfo>> {
        Ok(self
            .containers
            .read()
            .await
            .get(container)
            .map(|objects| {
                objects
                    .iter()
                    .filter(|(name, _)| name.starts_with(prefix))
                    .map(|(name, object)| ObjectInfo {
                        name: name.clone(),
                        bytes: object.body.len() as u64,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Store that fails every call; used when no object store is configured.
#[derive(Debug, Default)]
pub struct UnconfiguredObjectStore;

#[async_trait]
impl ObjectStore for UnconfiguredObjectStore {
    async fn ensure_container(&self, _container: &str) -> Result<()> {
        Err(ObjectStoreError::NotConfigured)
    }

    async fn put_object(&self, _: &str, _: &str, _: Vec<u8>, _: Option<Duration>) -> Result<()> {
        Err(ObjectStoreError::NotConfigured)
    }

    async fn get_object(&self, _: &str, _: &str) -> Result<Option<Vec<u8>>> {
        Err(ObjectStoreError::NotConfigured)
    }

    async fn delete_object(&self, _: &str, _: &str) -> Result<()> {
        Err(ObjectStoreError::NotConfigured)
    }

    async fn list_objects(&self, _: &str, _: &str) -> Result<Vec<ObjectInfo>> {
        Err(ObjectStoreError::NotConfigured)
    }
}

/// Build the configured store.
pub fn from_config(config: &crate::config::Config) -> Result<std::sync::Arc<dyn ObjectStore>> {
    match (&config.object_store_url, &config.object_store_token) {
        (Some(url), Some(token)) => {
            info!(url = %url, "Using Swift object store");
            Ok(std::sync::Arc::new(SwiftObjectStore::new(
                url.clone(),
                token.clone(),
                Duration::from_secs(60),
            )?))
        }
        _ => {
            info!("No object store configured, log publishing disabled");
            Ok(std::sync::Arc::new(UnconfiguredObjectStore))
        }
    }
}
