//! Blob byte storage.
//!
//! The op log only records *who* holds a blob; the bytes live behind
//! [`BlobStore`]. Writes are idempotent because keys are content addresses.

pub mod fs_store;
pub mod memory;

pub use fs_store::FsBlobStore;
pub use memory::MemoryBlobStore;

use crate::{Result, StashError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobAttributes {
    pub key: String,
    pub size: u64,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Fails with `BlobNotFound` when absent.
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Deleting a missing blob is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn attributes(&self, key: &str) -> Result<Option<BlobAttributes>>;
}

/// Compute SHA256 hash of data
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Verify that data matches the expected hash
pub fn verify_hash(data: &[u8], expected_hash: &str) -> Result<()> {
    let actual_hash = compute_hash(data);
    if actual_hash != expected_hash {
        return Err(StashError::HashMismatch {
            expected: expected_hash.to_string(),
            actual: actual_hash,
        });
    }
    Ok(())
}

/// Keys minted at ingest are the lowercase hex SHA256 of the bytes.
pub fn is_content_hash(key: &str) -> bool {
    key.len() == 64 && key.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Blob keys may contain `/` (e.g. `cid/150x150.jpg`) but no empty, `.` or
/// `..` components.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.starts_with('/') {
        return Err(StashError::InvalidKey(key.to_string()));
    }

    for component in key.split('/') {
        if component.is_empty() || component == "." || component == ".." || component.contains('\\') {
            return Err(StashError::InvalidKey(key.to_string()));
        }
    }

    Ok(())
}
