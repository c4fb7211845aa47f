//! Blob storage abstraction backing the persistent cache tier.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as BASE64;
use bytes::Bytes;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Abstraction over a durable name → bytes store for testability.
///
/// Each call is expected to be atomic, and a `write` followed by a `read` of
/// the same name must see the written bytes.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Lists the names of every stored blob.
    async fn list(&self) -> Result<Vec<String>>;

    /// Reads a blob. Missing blobs are [`Error::NotFound`].
    async fn read(&self, name: &str) -> Result<Bytes>;

    /// Writes (or replaces) a blob.
    async fn write(&self, name: &str, data: &[u8]) -> Result<()>;

    /// Removes a blob. Removing a missing blob is not an error.
    async fn remove(&self, name: &str) -> Result<()>;
}

/// Stores every blob as one file in a directory, using `tokio::fs`.
///
/// File names are the URL-safe base64 of the blob name, so any key maps to a
/// valid, flat file name.
#[derive(Debug, Clone)]
pub struct DiskBlobStore {
    root: PathBuf,
}

impl DiskBlobStore {
    /// Opens (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Directory holding the blobs.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(BASE64.encode(name))
    }
}

fn decode_name(file_name: &str) -> Option<String> {
    let raw = BASE64.decode(file_name).ok()?;
    String::from_utf8(raw).ok()
}

#[async_trait]
impl BlobStore for DiskBlobStore {
    async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if file_name.ends_with(".tmp") {
                continue;
            }
            match decode_name(file_name) {
                Some(name) => names.push(name),
                None => log::warn!("Ignoring foreign file in blob store: {file_name}"),
            }
        }
        Ok(names)
    }

    async fn read(&self, name: &str) -> Result<Bytes> {
        match tokio::fs::read(self.path_for(name)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.path_for(name);
        // One temp file per write, so concurrent writers never share one.
        let tmp_path = self
            .root
            .join(format!("{}.{}.tmp", BASE64.encode(name), Uuid::new_v4()));
        let written = match tokio::fs::write(&tmp_path, data).await {
            Ok(()) => tokio::fs::rename(&tmp_path, &path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(name)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn write_then_read() {
        let dir = TempDir::new().unwrap();
        let store = DiskBlobStore::open(dir.path()).await.unwrap();

        store.write("a.png", b"hello").await.unwrap();
        assert_eq!(store.read("a.png").await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn read_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = DiskBlobStore::open(dir.path()).await.unwrap();
        assert!(matches!(store.read("nope").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn names_with_separators_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = DiskBlobStore::open(dir.path().join("nested/cache")).await.unwrap();

        store.write("https://host/img/1.png", b"x").await.unwrap();
        store.write("plain", b"y").await.unwrap();

        let mut names = store.list().await.unwrap();
        names.sort();
        assert_eq!(names, vec!["https://host/img/1.png", "plain"]);
    }

    #[tokio::test]
    async fn list_skips_foreign_files() {
        let dir = TempDir::new().unwrap();
        let store = DiskBlobStore::open(dir.path()).await.unwrap();
        std::fs::write(dir.path().join("!!not-base64!!"), b"?").unwrap();
        std::fs::write(dir.path().join("leftover.tmp"), b"?").unwrap();
        store.write("k", b"v").await.unwrap();

        assert_eq!(store.list().await.unwrap(), vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = DiskBlobStore::open(dir.path()).await.unwrap();
        store.write("k", b"v").await.unwrap();

        store.remove("k").await.unwrap();
        store.remove("k").await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn overwrite_replaces_content() {
        let dir = TempDir::new().unwrap();
        let store = DiskBlobStore::open(dir.path()).await.unwrap();
        store.write("k", b"old").await.unwrap();
        store.write("k", b"new").await.unwrap();
        assert_eq!(store.read("k").await.unwrap(), Bytes::from_static(b"new"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writes_of_one_name_leave_a_whole_blob() {
        let dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(DiskBlobStore::open(dir.path()).await.unwrap());
        let payloads: Vec<Vec<u8>> = (1..=16u8).map(|n| vec![n; usize::from(n) * 1024]).collect();

        let writers: Vec<_> = payloads
            .iter()
            .cloned()
            .map(|payload| {
                let store = std::sync::Arc::clone(&store);
                tokio::spawn(async move { store.write("k", &payload).await })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let stored = store.read("k").await.unwrap();
        assert!(payloads.iter().any(|p| p.as_slice() == stored.as_ref()));
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|entry| {
                entry
                    .as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".tmp")
            })
            .count();
        assert_eq!(leftovers, 0);
        assert_eq!(store.list().await.unwrap(), vec!["k".to_string()]);
    }
}
