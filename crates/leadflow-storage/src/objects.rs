//! Byte-blob object storage: download, upload, delete and move by path.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid object path: {0:?}")]
    InvalidPath(String),
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(path.display().to_string())
        } else {
            Self::Io {
                path: path.display().to_string(),
                source,
            }
        }
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn download(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Stores `bytes` at `path`, replacing any previous object, and returns the stored path.
    async fn upload(&self, bytes: &[u8], path: &str) -> Result<String, StorageError>;

    async fn delete(&self, path: &str) -> Result<(), StorageError>;

    async fn move_object(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let bytes = self.download(from).await?;
        self.upload(&bytes, to).await?;
        self.delete(from).await
    }
}

/// Objects as files under a root directory.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path);
        let safe = !path.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !safe {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }

    async fn ensure_parent(path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::io(parent, e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn download(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let absolute = self.resolve(path)?;
        fs::read(&absolute)
            .await
            .map_err(|e| StorageError::io(&absolute, e))
    }

    /// Atomic write through a temp file in the destination directory.
    async fn upload(&self, bytes: &[u8], path: &str) -> Result<String, StorageError> {
        let absolute = self.resolve(path)?;
        Self::ensure_parent(&absolute).await?;

        let temp_path = absolute.with_file_name(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| StorageError::io(&temp_path, e))?;
        let written = async {
            file.write_all(bytes).await?;
            file.flush().await
        }
        .await;
        drop(file);

        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::io(&temp_path, err));
        }
        if let Err(err) = fs::rename(&temp_path, &absolute).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::io(&absolute, err));
        }
        Ok(path.to_string())
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let absolute = self.resolve(path)?;
        fs::remove_file(&absolute)
            .await
            .map_err(|e| StorageError::io(&absolute, e))
    }

    async fn move_object(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let source = self.resolve(from)?;
        let target = self.resolve(to)?;
        Self::ensure_parent(&target).await?;
        fs::rename(&source, &target)
            .await
            .map_err(|e| StorageError::io(&source, e))
    }
}

/// In-process store, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.lock().insert(path.into(), bytes.into());
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().get(path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.objects.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn download(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.get(path)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn upload(&self, bytes: &[u8], path: &str) -> Result<String, StorageError> {
        self.insert(path, bytes);
        Ok(path.to_string())
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        self.lock()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn fs_store_round_trips_and_moves() {
        let dir = tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path());

        let stored = store
            .upload(b"a;b;c\n", "incoming/deces-2023-m12.csv")
            .await
            .expect("upload");
        assert_eq!(stored, "incoming/deces-2023-m12.csv");
        assert_eq!(store.download(&stored).await.unwrap(), b"a;b;c\n");

        store
            .move_object("incoming/deces-2023-m12.csv", "processed/deces-2023-m12.csv")
            .await
            .expect("move");
        assert!(matches!(
            store.download("incoming/deces-2023-m12.csv").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(dir.path().join("processed/deces-2023-m12.csv").exists());
    }

    #[tokio::test]
    async fn fs_store_overwrites_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path());
        store.upload(b"first", "failed/x.csv").await.unwrap();
        store.upload(b"second", "failed/x.csv").await.unwrap();

        assert_eq!(store.download("failed/x.csv").await.unwrap(), b"second");
        let entries = std::fs::read_dir(dir.path().join("failed")).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn fs_store_rejects_escaping_paths() {
        let dir = tempdir().expect("tempdir");
        let store = FsObjectStore::new(dir.path());
        assert!(matches!(
            store.download("../etc/passwd").await,
            Err(StorageError::InvalidPath(_))
        ));
        assert!(matches!(
            store.upload(b"x", "/abs/path").await,
            Err(StorageError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn memory_store_moves_through_default_implementation() {
        let store = MemoryObjectStore::new();
        store.insert("incoming/a.csv", b"rows".to_vec());
        store.move_object("incoming/a.csv", "processed/a.csv").await.unwrap();
        assert_eq!(store.paths(), vec!["processed/a.csv".to_string()]);
        assert!(store.move_object("incoming/a.csv", "processed/b.csv").await.is_err());
    }
}
