//! Content-addressed blob storage for listing photos.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::sha256_hex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    /// Key relative to the store root, e.g. `dogs/<listing>/<sha256>.jpg`.
    pub key: String,
    pub content_hash: String,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, prefix: &str, extension: &str, bytes: &[u8]) -> anyhow::Result<StoredBlob>;

    /// Returns `false` when nothing was stored under `key`.
    async fn delete(&self, key: &str) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn key_for(prefix: &str, content_hash: &str, extension: &str) -> String {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("{content_hash}.{ext}")
        } else {
            format!("{prefix}/{content_hash}.{ext}")
        }
    }

    fn resolve(&self, key: &str) -> anyhow::Result<PathBuf> {
        if key.split('/').any(|segment| segment == "..") {
            anyhow::bail!("blob key escapes the store root: {key}");
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    /// Writes through a temp file and an atomic rename; identical content
    /// under the same prefix is stored once.
    async fn put(&self, prefix: &str, extension: &str, bytes: &[u8]) -> anyhow::Result<StoredBlob> {
        let content_hash = sha256_hex(bytes);
        let key = Self::key_for(prefix, &content_hash, extension);
        let path = self.resolve(&key)?;
        let blob = |deduplicated| StoredBlob {
            key: key.clone(),
            content_hash: content_hash.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating blob directory {}", parent.display()))?;

        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking blob path {}", path.display()))?
        {
            return Ok(blob(true));
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp blob {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp blob {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp blob {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &path).await {
            Ok(()) => Ok(blob(false)),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                if err.kind() == std::io::ErrorKind::AlreadyExists {
                    Ok(blob(true))
                } else {
                    Err(err).with_context(|| {
                        format!("renaming {} -> {}", temp_path.display(), path.display())
                    })
                }
            }
        }
    }

    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("deleting blob {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn identical_photos_are_stored_once() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());

        let first = store.put("dogs/abc", "jpg", b"jpeg-bytes").await.expect("first put");
        let second = store.put("dogs/abc", ".jpg", b"jpeg-bytes").await.expect("second put");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.key, second.key);
        assert!(dir.path().join(&first.key).exists());
    }

    #[tokio::test]
    async fn delete_reports_whether_anything_was_removed() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());
        let stored = store.put("dogs/x", "png", b"png").await.expect("put");

        assert!(store.delete(&stored.key).await.expect("delete"));
        assert!(!store.delete(&stored.key).await.expect("second delete"));
    }

    #[tokio::test]
    async fn keys_cannot_escape_the_root() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());
        assert!(store.delete("../etc/passwd").await.is_err());
    }
}
