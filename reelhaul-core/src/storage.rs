//! Object store seam.
//!
//! Objects are addressed by `(bucket, path)`. The pipeline only ever writes
//! whole objects and reads them back whole, so the trait stays that small.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object {bucket}/{path} not found")]
    NotFound { bucket: String, path: String },
    #[error("invalid object key {bucket}/{path}: {reason}")]
    InvalidKey {
        bucket: String,
        path: String,
        reason: &'static str,
    },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, bucket: &str, path: &str, bytes: Vec<u8>) -> StorageResult<()>;

    async fn get(&self, bucket: &str, path: &str) -> StorageResult<Vec<u8>>;
}

/// Filesystem-backed store laid out as `<root>/<bucket>/<path>`.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, bucket: &str, path: &str) -> StorageResult<PathBuf> {
        let invalid = |reason| StorageError::InvalidKey {
            bucket: bucket.to_string(),
            path: path.to_string(),
            reason,
        };
        if bucket.is_empty() || bucket.contains(['/', '\\']) || bucket == ".." {
            return Err(invalid("bucket must be a single path segment"));
        }
        if path.is_empty() {
            return Err(invalid("path must not be empty"));
        }
        let relative = Path::new(path);
        if !relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
        {
            return Err(invalid("path must be relative without parent segments"));
        }
        Ok(self.root.join(bucket).join(relative))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, bucket: &str, path: &str, bytes: Vec<u8>) -> StorageResult<()> {
        let target = self.object_path(bucket, path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| StorageError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        // Readers never observe a half-written object.
        let staging = target.with_extension("partial");
        let mut file = fs::File::create(&staging)
            .await
            .map_err(|source| StorageError::Io {
                path: staging.clone(),
                source,
            })?;
        file.write_all(&bytes)
            .await
            .map_err(|source| StorageError::Io {
                path: staging.clone(),
                source,
            })?;
        file.sync_all().await.map_err(|source| StorageError::Io {
            path: staging.clone(),
            source,
        })?;
        drop(file);
        fs::rename(&staging, &target)
            .await
            .map_err(|source| StorageError::Io {
                path: target.clone(),
                source,
            })?;
        debug!(bucket, path, size_bytes = bytes.len(), "blob stored");
        Ok(())
    }

    async fn get(&self, bucket: &str, path: &str) -> StorageResult<Vec<u8>> {
        let target = self.object_path(bucket, path)?;
        match fs::read(&target).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound {
                    bucket: bucket.to_string(),
                    path: path.to_string(),
                })
            }
            Err(source) => Err(StorageError::Io {
                path: target,
                source,
            }),
        }
    }
}
