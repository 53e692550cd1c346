//! Persistence of engine snapshots as opaque blobs.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;

/// Blob store keyed by engine name.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// `Ok(None)` when nothing is stored under `name`.
    async fn load(&self, name: &str) -> Result<Option<Vec<u8>>>;

    async fn save(&self, name: &str, data: &[u8]) -> Result<()>;

    /// Removing a missing entry is not an error.
    async fn remove(&self, name: &str) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.blobs.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn load(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().await.get(name).cloned())
    }

    async fn save(&self, name: &str, data: &[u8]) -> Result<()> {
        self.blobs.write().await.insert(name.to_string(), data.to_vec());
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.blobs.write().await.remove(name);
        Ok(())
    }
}

/// One `<name>.veil` file per engine. Writes go through a temporary file so
/// a crash never leaves a truncated snapshot behind.
pub struct FsStore {
    dir: PathBuf,
}

impl FsStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.veil"))
    }
}

#[async_trait]
impl SnapshotStore for FsStore {
    async fn load(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path(name)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, name: &str, data: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path(name);
        let tmp = path.with_extension("veil.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
