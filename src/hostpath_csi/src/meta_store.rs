use async_trait::async_trait;
use hostpath_lib::{HostPathError, HostPathResult, VolumeId};
use log::{debug, info};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Set of volume ids that still exist cluster-wide.
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn list_meta_infos(&self) -> HostPathResult<BTreeSet<VolumeId>>;
    async fn add_meta_info(&self, volume_id: &VolumeId) -> HostPathResult<()>;
    async fn unset_meta_info(&self, volume_id: &VolumeId) -> HostPathResult<()>;
}

#[derive(Debug, Default)]
pub struct MemMetaStore {
    ids: Mutex<BTreeSet<VolumeId>>,
}

impl MemMetaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetaStore for MemMetaStore {
    async fn list_meta_infos(&self) -> HostPathResult<BTreeSet<VolumeId>> {
        Ok(self.ids.lock().await.clone())
    }

    async fn add_meta_info(&self, volume_id: &VolumeId) -> HostPathResult<()> {
        self.ids.lock().await.insert(volume_id.clone());
        Ok(())
    }

    async fn unset_meta_info(&self, volume_id: &VolumeId) -> HostPathResult<()> {
        self.ids.lock().await.remove(volume_id);
        Ok(())
    }
}

/// Key set kept as a JSON array in a single file.
pub struct FileMetaStore {
    path: PathBuf,
    // serializes read-modify-write of the file
    write_lock: Mutex<()>,
}

impl FileMetaStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> HostPathResult<BTreeSet<VolumeId>> {
        match tokio::fs::read(&self.path).await {
            Ok(content) => serde_json::from_slice(&content).map_err(|e| {
                HostPathError::InvalidData(format!("parse {} failed: {}", self.path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeSet::new()),
            Err(e) => Err(HostPathError::IoError(format!(
                "read {} failed: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn store(&self, ids: &BTreeSet<VolumeId>) -> HostPathResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_vec_pretty(ids)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl MetaStore for FileMetaStore {
    async fn list_meta_infos(&self) -> HostPathResult<BTreeSet<VolumeId>> {
        self.load().await
    }

    async fn add_meta_info(&self, volume_id: &VolumeId) -> HostPathResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut ids = self.load().await?;
        if ids.insert(volume_id.clone()) {
            self.store(&ids).await?;
            info!("meta store add: volume={}", volume_id);
        }
        Ok(())
    }

    async fn unset_meta_info(&self, volume_id: &VolumeId) -> HostPathResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut ids = self.load().await?;
        if ids.remove(volume_id) {
            self.store(&ids).await?;
            info!("meta store unset: volume={}", volume_id);
        } else {
            debug!("meta store unset unknown volume {}", volume_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_meta_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta").join("store.json");
        let store = FileMetaStore::new(&path);
        assert!(store.list_meta_infos().await.unwrap().is_empty());

        store.add_meta_info(&VolumeId::from("v1")).await.unwrap();
        store.add_meta_info(&VolumeId::from("v2")).await.unwrap();
        store.add_meta_info(&VolumeId::from("v1")).await.unwrap();
        store.unset_meta_info(&VolumeId::from("v2")).await.unwrap();
        store.unset_meta_info(&VolumeId::from("v3")).await.unwrap();

        let reopened = FileMetaStore::new(&path);
        let ids = reopened.list_meta_infos().await.unwrap();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![VolumeId::from("v1")]);
    }

    #[tokio::test]
    async fn test_file_meta_store_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, b"not json").unwrap();
        let err = FileMetaStore::new(&path).list_meta_infos().await.unwrap_err();
        assert!(matches!(err, HostPathError::InvalidData(_)));
    }
}
