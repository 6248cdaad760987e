//! Artifact storage keyed by opaque handle. The shipped implementation is a
//! flat directory; anything with put/get/delete semantics can stand in.

use async_trait::async_trait;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub handle: String,
    pub size: i64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, name: &str, bytes: &[u8]) -> anyhow::Result<StoredObject>;
    async fn get(&self, handle: &str) -> anyhow::Result<Vec<u8>>;
    async fn delete(&self, handle: &str) -> anyhow::Result<()>;
}

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, handle: &str) -> anyhow::Result<PathBuf> {
        // Handles are uuids we minted; reject anything path-like.
        if handle.is_empty()
            || handle
                .chars()
                .any(|c| !c.is_ascii_alphanumeric() && c != '-')
        {
            anyhow::bail!("invalid object handle");
        }
        Ok(self.root.join(handle))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, name: &str, bytes: &[u8]) -> anyhow::Result<StoredObject> {
        let handle = uuid::Uuid::new_v4().to_string();
        let path = self.path_for(&handle)?;
        tokio::fs::write(&path, bytes).await?;
        tracing::debug!(name, handle = %handle, size = bytes.len(), "stored report artifact");
        Ok(StoredObject {
            handle,
            size: bytes.len() as i64,
        })
    }

    async fn get(&self, handle: &str) -> anyhow::Result<Vec<u8>> {
        let path = self.path_for(handle)?;
        Ok(tokio::fs::read(&path).await?)
    }

    async fn delete(&self, handle: &str) -> anyhow::Result<()> {
        let path = self.path_for(handle)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path()).unwrap();
        let stored = store.put("report.csv", b"a,b\n1,2\n").await.unwrap();
        assert_eq!(stored.size, 8);
        let bytes = store.get(&stored.handle).await.unwrap();
        assert_eq!(bytes, b"a,b\n1,2\n");
        store.delete(&stored.handle).await.unwrap();
        assert!(store.get(&stored.handle).await.is_err());
        // Deleting twice is fine.
        store.delete(&stored.handle).await.unwrap();
    }

    #[tokio::test]
    async fn path_traversal_handles_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path()).unwrap();
        assert!(store.get("../etc/passwd").await.is_err());
        assert!(store.get("").await.is_err());
    }
}
