//! Blob storage for checkpoint artifacts and final assets.
//!
//! Checkpoint artifacts live under `checkpoints/{job_id}/...`, hosted assets
//! under `assets/...`.

use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjPath;
use object_store::{ObjectStore, PutPayload, WriteMultipart};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::config::{StorageBackend, StorageConfig};
use crate::{Error, Result};

/// Chunk size for streamed uploads.
const UPLOAD_CHUNK: usize = 8 * 1024 * 1024;
/// Parts in flight during a multipart upload.
const UPLOAD_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMeta {
    pub key: String,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` under `key` and return the key.
    async fn put(&self, key: &str, data: Bytes) -> Result<String>;

    /// Stream a local file to `key`; returns the number of bytes uploaded.
    /// `on_progress` is called with the running total after each chunk.
    async fn put_file(
        &self,
        key: &str,
        path: &Path,
        on_progress: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<u64>;

    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Stream `key` into a local file. Returns false if the key is missing.
    async fn get_to_file(&self, key: &str, path: &Path) -> Result<bool>;

    async fn get_range(&self, key: &str, range: Range<u64>) -> Result<Option<Bytes>>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete every object under `prefix`; returns how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;

    async fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>>;

    async fn exists(&self, key: &str) -> Result<bool>;
}

/// [`BlobStore`] over any `object_store` backend.
#[derive(Clone)]
pub struct ObjectBlobStore {
    store: Arc<dyn ObjectStore>,
    local_root: Option<PathBuf>,
}

impl ObjectBlobStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            local_root: None,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()))
    }

    pub async fn local(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        let store = LocalFileSystem::new_with_prefix(&root)?;
        Ok(Self {
            store: Arc::new(store),
            local_root: Some(root),
        })
    }

    pub async fn from_config(config: &StorageConfig) -> Result<Self> {
        match config.backend {
            StorageBackend::Local => Self::local(&config.root).await,
            StorageBackend::Memory => Ok(Self::in_memory()),
        }
    }

    /// Root directory for the local backend.
    pub fn local_root(&self) -> Option<&Path> {
        self.local_root.as_deref()
    }
}

fn is_not_found(e: &object_store::Error) -> bool {
    matches!(e, object_store::Error::NotFound { .. })
}

#[async_trait]
impl BlobStore for ObjectBlobStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<String> {
        let path = ObjPath::from(key);
        self.store.put(&path, PutPayload::from_bytes(data)).await?;
        Ok(key.to_string())
    }

    async fn put_file(
        &self,
        key: &str,
        path: &Path,
        on_progress: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<u64> {
        let location = ObjPath::from(key);
        let mut file = tokio::fs::File::open(path).await?;
        let upload = self.store.put_multipart(&location).await?;
        let mut writer = WriteMultipart::new_with_chunk_size(upload, UPLOAD_CHUNK);

        let mut buf = vec![0u8; 1024 * 1024];
        let mut total: u64 = 0;
        loop {
            let n = match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    let _ = writer.abort().await;
                    return Err(e.into());
                }
            };
            if let Err(e) = writer.wait_for_capacity(UPLOAD_CONCURRENCY).await {
                return Err(e.into());
            }
            writer.write(&buf[..n]);
            total += n as u64;
            on_progress(total);
        }
        writer.finish().await?;
        debug!(key, bytes = total, "uploaded file");
        Ok(total)
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        match self.store.get(&ObjPath::from(key)).await {
            Ok(result) => Ok(Some(result.bytes().await?)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_to_file(&self, key: &str, path: &Path) -> Result<bool> {
        let result = match self.store.get(&ObjPath::from(key)).await {
            Ok(result) => result,
            Err(e) if is_not_found(&e) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(path).await?;
        let mut stream = result.into_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(true)
    }

    async fn get_range(&self, key: &str, range: Range<u64>) -> Result<Option<Bytes>> {
        let range = usize::try_from(range.start)
            .ok()
            .zip(usize::try_from(range.end).ok())
            .map(|(start, end)| start..end)
            .ok_or_else(|| Error::validation("range exceeds addressable size"))?;
        match self.store.get_range(&ObjPath::from(key), range).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self.store.delete(&ObjPath::from(key)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let prefix_path = ObjPath::from(prefix);
        let locations = self
            .store
            .list(Some(&prefix_path))
            .map_ok(|m| m.location)
            .boxed();
        let deleted: Vec<ObjPath> = self.store.delete_stream(locations).try_collect().await?;

        if let Some(root) = &self.local_root {
            remove_empty_dirs(root, prefix).await;
        }
        Ok(deleted.len())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobMeta>> {
        let prefix_path = ObjPath::from(prefix);
        let metas: Vec<object_store::ObjectMeta> =
            self.store.list(Some(&prefix_path)).try_collect().await?;
        Ok(metas
            .into_iter()
            .map(|m| BlobMeta {
                key: m.location.to_string(),
                size: m.size as u64,
                modified_at: m.last_modified,
            })
            .collect())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self.store.head(&ObjPath::from(key)).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Best effort: drop directories left empty after a prefix delete.
async fn remove_empty_dirs(root: &Path, prefix: &str) {
    let relative = Path::new(prefix.trim_end_matches('/'));
    if relative.is_absolute()
        || relative
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return;
    }
    let mut current = root.join(relative);
    while current.starts_with(root) && current != root {
        if tokio::fs::remove_dir(&current).await.is_err() {
            break;
        }
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }
}
