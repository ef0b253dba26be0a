//! Object storage for uploaded files.
//!
//! Each tenant's files live under `uploads/<tenant>/`. The knowledge-base
//! service indexes a file by fetching it through a pre-signed URL, so the
//! store must be able to hand those out.

pub mod tos;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::ClientError;

const UPLOAD_ROOT: &str = "uploads";

/// Key prefix for everything `tenant_id` has uploaded.
pub fn tenant_prefix(tenant_id: &str) -> String {
    format!("{UPLOAD_ROOT}/{tenant_id}/")
}

/// Storage key for `file_name` owned by `tenant_id`.
pub fn object_key(tenant_id: &str, file_name: &str) -> String {
    format!("{}{file_name}", tenant_prefix(tenant_id))
}

/// A stored object as returned by a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredObject {
    pub key: String,
    /// Last path segment of the key.
    pub name: String,
    pub size: u64,
    pub last_modified: Option<String>,
}

impl StoredObject {
    pub fn new(key: impl Into<String>, size: u64, last_modified: Option<String>) -> Self {
        let key = key.into();
        let name = key.rsplit('/').next().unwrap_or(&key).to_string();
        Self {
            key,
            name,
            size,
            last_modified,
        }
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), ClientError>;

    /// A time-limited URL from which anyone can `GET` the object.
    fn presigned_get_url(&self, key: &str) -> Result<String, ClientError>;

    async fn list(&self, prefix: &str) -> Result<Vec<StoredObject>, ClientError>;

    async fn exists(&self, key: &str) -> Result<bool, ClientError>;

    async fn delete(&self, key: &str) -> Result<(), ClientError>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn ObjectStore) {}
};
