use async_trait::async_trait;
use hostpath_lib::{
    HostPathError, HostPathNode, HostPathResult, HostPathVolume, NodeUsageInfo, PvUsageInfo,
    VolumeId,
};
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Cluster-side volume and node records the node agent reads and publishes.
#[async_trait]
pub trait HostPathClient: Send + Sync {
    async fn get_volume_by_id(&self, volume_id: &VolumeId)
        -> HostPathResult<Option<HostPathVolume>>;

    async fn get_node(&self, node_name: &str) -> HostPathResult<Option<HostPathNode>>;

    /// Stores `usage` on the volume and binds the volume to `usage.node_name`.
    async fn update_volume_usage(&self, volume_name: &str, usage: &PvUsageInfo)
        -> HostPathResult<()>;

    async fn update_node_usage(&self, node_name: &str, usage: &NodeUsageInfo)
        -> HostPathResult<()>;

    async fn set_disk_disable_state(
        &self,
        node_name: &str,
        mount_point: &str,
        disabled: bool,
    ) -> HostPathResult<()>;
}

const VOLUME_DIR: &str = "volumes";
const NODE_DIR: &str = "nodes";

/// Volume and node records as JSON files under one directory.
pub struct FileRecordStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileRecordStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    fn record_path(&self, kind: &str, name: &str) -> HostPathResult<PathBuf> {
        if name.is_empty() || name.contains('/') || name.starts_with('.') {
            return Err(HostPathError::InvalidArgument(format!(
                "bad record name {:?}",
                name
            )));
        }
        Ok(self.root.join(kind).join(format!("{}.json", name)))
    }

    async fn read_record<T: DeserializeOwned>(path: &Path) -> HostPathResult<Option<T>> {
        match tokio::fs::read(path).await {
            Ok(content) => serde_json::from_slice(&content).map(Some).map_err(|e| {
                HostPathError::InvalidData(format!("parse {} failed: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(HostPathError::IoError(format!(
                "read {} failed: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn write_record<T: Serialize>(path: &Path, record: &T) -> HostPathResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(record)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    pub async fn put_volume(&self, volume: &HostPathVolume) -> HostPathResult<()> {
        let path = self.record_path(VOLUME_DIR, &volume.name)?;
        let _guard = self.write_lock.lock().await;
        Self::write_record(&path, volume).await
    }

    pub async fn put_node(&self, node: &HostPathNode) -> HostPathResult<()> {
        let path = self.record_path(NODE_DIR, &node.name)?;
        let _guard = self.write_lock.lock().await;
        Self::write_record(&path, node).await
    }

    pub async fn get_volume(&self, volume_name: &str) -> HostPathResult<Option<HostPathVolume>> {
        Self::read_record(&self.record_path(VOLUME_DIR, volume_name)?).await
    }
}

#[async_trait]
impl HostPathClient for FileRecordStore {
    async fn get_volume_by_id(
        &self,
        volume_id: &VolumeId,
    ) -> HostPathResult<Option<HostPathVolume>> {
        let dir = self.root.join(VOLUME_DIR);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(volume) = Self::read_record::<HostPathVolume>(&path).await? {
                if volume.volume_id.as_ref() == Some(volume_id) {
                    return Ok(Some(volume));
                }
            }
        }
        debug!("no volume record for {}", volume_id);
        Ok(None)
    }

    async fn get_node(&self, node_name: &str) -> HostPathResult<Option<HostPathNode>> {
        Self::read_record(&self.record_path(NODE_DIR, node_name)?).await
    }

    async fn update_volume_usage(
        &self,
        volume_name: &str,
        usage: &PvUsageInfo,
    ) -> HostPathResult<()> {
        let path = self.record_path(VOLUME_DIR, volume_name)?;
        let _guard = self.write_lock.lock().await;
        let mut volume = Self::read_record::<HostPathVolume>(&path)
            .await?
            .ok_or_else(|| HostPathError::NotFound(format!("volume {}", volume_name)))?;
        volume.bind_node = Some(usage.node_name.clone());
        volume.usage = Some(usage.clone());
        Self::write_record(&path, &volume).await?;
        info!(
            "update volume usage: volume={}, node={}, used={}/{}",
            volume_name, usage.node_name, usage.used, usage.capacity
        );
        Ok(())
    }

    async fn update_node_usage(&self, node_name: &str, usage: &NodeUsageInfo) -> HostPathResult<()> {
        let path = self.record_path(NODE_DIR, node_name)?;
        let _guard = self.write_lock.lock().await;
        let mut node = Self::read_record::<HostPathNode>(&path)
            .await?
            .ok_or_else(|| HostPathError::NotFound(format!("node {}", node_name)))?;
        node.usage = Some(usage.clone());
        Self::write_record(&path, &node).await
    }

    async fn set_disk_disable_state(
        &self,
        node_name: &str,
        mount_point: &str,
        disabled: bool,
    ) -> HostPathResult<()> {
        let path = self.record_path(NODE_DIR, node_name)?;
        let _guard = self.write_lock.lock().await;
        let mut node = Self::read_record::<HostPathNode>(&path)
            .await?
            .ok_or_else(|| HostPathError::NotFound(format!("node {}", node_name)))?;
        let changed = if disabled {
            node.disabled_disks.insert(mount_point.to_string())
        } else {
            node.disabled_disks.remove(mount_point)
        };
        if changed {
            Self::write_record(&path, &node).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_volume(name: &str, id: &str) -> HostPathVolume {
        HostPathVolume {
            name: name.to_string(),
            volume_id: Some(VolumeId::from(id)),
            is_hostpath: true,
            capacity: 1024,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_volume_records() {
        let dir = TempDir::new().unwrap();
        let store = FileRecordStore::new(dir.path());
        store.put_volume(&sample_volume("pv-a", "id-a")).await.unwrap();
        store.put_volume(&sample_volume("pv-b", "id-b")).await.unwrap();

        let found = store
            .get_volume_by_id(&VolumeId::from("id-b"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.name, "pv-b");
        assert!(store
            .get_volume_by_id(&VolumeId::from("id-c"))
            .await
            .unwrap()
            .is_none());

        let usage = PvUsageInfo {
            node_name: "node1".to_string(),
            path: "/xfs/disk1/k8squota_id-a".to_string(),
            capacity: 1024,
            used: 12,
        };
        store.update_volume_usage("pv-a", &usage).await.unwrap();
        let volume = store.get_volume("pv-a").await.unwrap().unwrap();
        assert!(volume.is_bound_to("node1"));
        assert_eq!(volume.usage, Some(usage.clone()));

        let err = store.update_volume_usage("pv-x", &usage).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(store.get_volume("../escape").await.is_err());
    }

    #[tokio::test]
    async fn test_node_records() {
        let dir = TempDir::new().unwrap();
        let store = FileRecordStore::new(dir.path());
        assert!(store.get_node("node1").await.unwrap().is_none());

        store
            .put_node(&HostPathNode {
                name: "node1".to_string(),
                is_hostpath_node: true,
                ..Default::default()
            })
            .await
            .unwrap();
        store
            .set_disk_disable_state("node1", "/xfs/disk1", true)
            .await
            .unwrap();
        let usage = NodeUsageInfo {
            capacity: 100,
            ..Default::default()
        };
        store.update_node_usage("node1", &usage).await.unwrap();

        let node = store.get_node("node1").await.unwrap().unwrap();
        assert!(node.disabled_disks.contains("/xfs/disk1"));
        assert_eq!(node.usage, Some(usage));

        store
            .set_disk_disable_state("node1", "/xfs/disk1", false)
            .await
            .unwrap();
        let node = store.get_node("node1").await.unwrap().unwrap();
        assert!(node.disabled_disks.is_empty());
    }
}
