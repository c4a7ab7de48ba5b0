use crate::csi_types::*;
use crate::hostpath_client::HostPathClient;
use crate::run_blocking;
use hostpath_lib::{
    round_off_bytes, to_i64, HostPathError, HostPathResult, VolumeId, VolumeLocks,
};
use log::{debug, info};
use quota_mgr::QuotaManager;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const TARGET_DIR_MODE: u32 = 0o750;

/// Mount table operations used to expose quota paths to pods.
pub trait Mounter: Send + Sync {
    fn is_mount_point(&self, target: &Path) -> HostPathResult<bool>;
    fn bind_mount(&self, source: &Path, target: &Path, options: &[String]) -> HostPathResult<()>;
    fn unmount(&self, target: &Path) -> HostPathResult<()>;
}

/// `bind`, then `ro` when read-only, then the capability's own mount flags.
fn publish_mount_options(readonly: bool, capability: &VolumeCapability) -> Vec<String> {
    let mut options = vec!["bind".to_string()];
    if readonly {
        options.push("ro".to_string());
    }
    if let AccessType::Mount { mount_flags, .. } = &capability.access_type {
        for flag in mount_flags {
            if !flag.is_empty() && !options.contains(flag) {
                options.push(flag.clone());
            }
        }
    }
    options
}

fn require(value: &str, what: &str) -> HostPathResult<()> {
    if value.is_empty() {
        return Err(HostPathError::InvalidArgument(format!(
            "{} missing in request",
            what
        )));
    }
    Ok(())
}

pub struct NodeServer {
    node_id: String,
    locks: Arc<VolumeLocks>,
    quota_mgr: Arc<dyn QuotaManager>,
    client: Arc<dyn HostPathClient>,
    mounter: Arc<dyn Mounter>,
}

impl NodeServer {
    pub fn new(
        node_id: &str,
        locks: Arc<VolumeLocks>,
        quota_mgr: Arc<dyn QuotaManager>,
        client: Arc<dyn HostPathClient>,
        mounter: Arc<dyn Mounter>,
    ) -> Self {
        Self {
            node_id: node_id.to_string(),
            locks,
            quota_mgr,
            client,
            mounter,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub async fn node_stage_volume(&self, req: NodeStageVolumeRequest) -> HostPathResult<()> {
        require(&req.volume_id, "volume id")?;
        require(&req.staging_target_path, "staging target path")?;
        if req.volume_capability.is_none() {
            return Err(HostPathError::InvalidArgument(
                "volume capability missing in request".to_string(),
            ));
        }
        if !Path::new(&req.staging_target_path).exists() {
            return Err(HostPathError::NotFound(format!(
                "staging target path {} does not exist",
                req.staging_target_path
            )));
        }
        Ok(())
    }

    pub async fn node_unstage_volume(&self, req: NodeUnstageVolumeRequest) -> HostPathResult<()> {
        require(&req.volume_id, "volume id")?;
        require(&req.staging_target_path, "staging target path")?;
        Ok(())
    }

    pub async fn node_publish_volume(&self, req: NodePublishVolumeRequest) -> HostPathResult<()> {
        let capability = req.volume_capability.as_ref().ok_or_else(|| {
            HostPathError::InvalidArgument("volume capability missing in request".to_string())
        })?;
        require(&req.volume_id, "volume id")?;
        require(&req.target_path, "target path")?;
        require(&req.staging_target_path, "staging target path")?;
        let volume_id = VolumeId::from(req.volume_id.as_str());
        volume_id.decode()?;

        let _guard = self.locks.lock_or_abort(&req.volume_id)?;

        let target = Path::new(&req.target_path);
        if !target.exists() {
            let dir = target.to_path_buf();
            run_blocking("create target dir", move || {
                std::fs::create_dir_all(&dir)?;
                std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(TARGET_DIR_MODE))?;
                Ok(())
            })
            .await?;
        } else if self.mounter.is_mount_point(target)? {
            debug!("target {} already mounted", target.display());
            return Ok(());
        }

        let volume = self
            .client
            .get_volume_by_id(&volume_id)
            .await?
            .ok_or_else(|| {
                HostPathError::NotFound(format!("no volume record for id {}", volume_id))
            })?;
        let capacity = u64::try_from(volume.capacity).map_err(|_| {
            HostPathError::InvalidData(format!(
                "volume {} has negative capacity {}",
                volume.name, volume.capacity
            ))
        })?;

        let quota_mgr = self.quota_mgr.clone();
        let id = volume_id.clone();
        let quota_path: PathBuf = run_blocking("get quota path", move || {
            quota_mgr.get_volume_quota_path(&id, capacity)
        })
        .await?;

        let options = publish_mount_options(req.readonly, capability);
        self.mounter.bind_mount(&quota_path, target, &options)?;
        info!(
            "publish volume: id={}, source={}, target={}, options={:?}",
            volume_id,
            quota_path.display(),
            target.display(),
            options
        );
        Ok(())
    }

    pub async fn node_unpublish_volume(
        &self,
        req: NodeUnpublishVolumeRequest,
    ) -> HostPathResult<()> {
        require(&req.volume_id, "volume id")?;
        require(&req.target_path, "target path")?;
        let volume_id = VolumeId::from(req.volume_id.as_str());
        let identifier = volume_id.decode()?;

        let _guard = self.locks.lock_or_abort(&req.volume_id)?;

        let target = Path::new(&req.target_path);
        if !target.exists() {
            return Ok(());
        }
        if self.mounter.is_mount_point(target)? {
            self.mounter.unmount(target)?;
        }
        let quota_mgr = self.quota_mgr.clone();
        let id = volume_id.clone();
        let dir = target.to_path_buf();
        let ephemeral = identifier.ephemeral;
        run_blocking("release target", move || {
            if ephemeral {
                quota_mgr.release_volume_path(&id)?;
            }
            std::fs::remove_dir_all(&dir)?;
            Ok(())
        })
        .await?;
        info!(
            "unpublish volume: id={}, target={}, ephemeral={}",
            volume_id,
            target.display(),
            identifier.ephemeral
        );
        Ok(())
    }

    pub async fn node_expand_volume(
        &self,
        req: NodeExpandVolumeRequest,
    ) -> HostPathResult<NodeExpandVolumeResponse> {
        require(&req.volume_id, "volume id")?;
        require(&req.volume_path, "volume path")?;
        let range = req.capacity_range.as_ref().ok_or_else(|| {
            HostPathError::InvalidArgument("capacity range missing in request".to_string())
        })?;
        let size = round_off_bytes(range.required_bytes.max(0) as u64);

        let _guard = self.locks.lock_or_abort(&req.volume_id)?;
        let quota_mgr = self.quota_mgr.clone();
        let volume_id = VolumeId::from(req.volume_id.as_str());
        run_blocking("expand volume", move || quota_mgr.expand_volume(&volume_id, size)).await?;
        info!("node expand volume: id={}, size={}", req.volume_id, size);
        Ok(NodeExpandVolumeResponse {
            capacity_bytes: to_i64(size),
        })
    }

    pub fn node_get_capabilities(&self) -> Vec<NodeServiceCapability> {
        vec![
            NodeServiceCapability::StageUnstageVolume,
            NodeServiceCapability::GetVolumeStats,
            NodeServiceCapability::ExpandVolume,
        ]
    }
}
