use crate::storage::{BlobAttributes, BlobStore, validate_key};
use crate::{Result, StashError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Filesystem blob store. Blobs live at `blobs/{shard}/{file name}` under
/// the base path so no single directory grows too large.
///
/// Keys are flattened into one file name each (`/` and `%` are escaped),
/// so `cid` and `cid/150x150.jpg` can be stored side by side.
pub struct FsBlobStore {
    base_path: PathBuf,
}

impl FsBlobStore {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(base_path.join("blobs"))?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &PathBuf {
        &self.base_path
    }

    fn blob_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        let name = file_name(key);
        let shard: String = name
            .chars()
            .take(2)
            .map(|c| if c == '.' { '_' } else { c })
            .collect();
        Ok(self.base_path.join("blobs").join(shard).join(name))
    }
}

fn file_name(key: &str) -> String {
    let mut name = String::with_capacity(key.len());
    for c in key.chars() {
        match c {
            '%' => name.push_str("%25"),
            '/' => name.push_str("%2F"),
            c => name.push(c),
        }
    }
    name
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let blob_path = self.blob_path(key)?;

        // Same key, same bytes
        if fs::try_exists(&blob_path).await? {
            return Ok(());
        }

        if let Some(parent) = blob_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write to a unique temporary file first, then rename for atomicity
        let file_name = blob_path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| StashError::InvalidKey(key.to_string()))?;
        let temp_path = blob_path.with_file_name(format!("{}.{}.tmp", file_name, ulid::Ulid::new()));

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(error) = fs::rename(&temp_path, &blob_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(error.into());
        }

        tracing::debug!("Stored blob {} ({} bytes)", key, data.len());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let blob_path = self.blob_path(key)?;

        match fs::read(&blob_path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(error) if error.kind() == ErrorKind::NotFound => {
                Err(StashError::BlobNotFound(key.to_string()))
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let blob_path = self.blob_path(key)?;

        match fs::remove_file(&blob_path).await {
            Ok(()) => {
                tracing::debug!("Deleted blob {}", key);
                Ok(())
            }
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(fs::try_exists(self.blob_path(key)?).await?)
    }

    async fn attributes(&self, key: &str) -> Result<Option<BlobAttributes>> {
        let blob_path = self.blob_path(key)?;

        match fs::metadata(&blob_path).await {
            Ok(meta) => Ok(Some(BlobAttributes {
                key: key.to_string(),
                size: meta.len(),
                modified_at: meta.modified().ok().map(DateTime::<Utc>::from),
            })),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }
}
