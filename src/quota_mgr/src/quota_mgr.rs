use crate::disk_probe::{read_disk_disabled, sub_dirs, write_disk_disabled, DiskProbe};
use crate::quota_provider::{Quota, QuotaProvider};
use hostpath_lib::{
    HostPathError, HostPathResult, VolumeId, DEFAULT_PROJECT_ID_COUNT, DEFAULT_PROJECT_ID_START,
    DEFAULT_QUOTA_DIR_PREFIX, DEFAULT_QUOTA_ROOT, DISK_DISABLE_XATTR_KEY,
};
use log::{debug, error, info, warn};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuotaManagerConfig {
    #[serde(alias = "root", alias = "quota_root")]
    pub root_path: PathBuf,
    pub project_id_start: u32,
    pub project_id_count: u32,
    pub max_cache_age_secs: u64,
    pub quota_dir_prefix: String,
    pub disable_xattr_key: String,
}

impl Default for QuotaManagerConfig {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from(DEFAULT_QUOTA_ROOT),
            project_id_start: DEFAULT_PROJECT_ID_START,
            project_id_count: DEFAULT_PROJECT_ID_COUNT,
            max_cache_age_secs: 60,
            quota_dir_prefix: DEFAULT_QUOTA_DIR_PREFIX.to_string(),
            disable_xattr_key: DISK_DISABLE_XATTR_KEY.to_string(),
        }
    }
}

impl QuotaManagerConfig {
    pub fn max_cache_age(&self) -> Duration {
        Duration::from_secs(self.max_cache_age_secs)
    }

    pub fn quota_dir_name(&self, volume_id: &VolumeId) -> String {
        format!("{}_{}", self.quota_dir_prefix, volume_id)
    }

    /// Volume id encoded in a quota directory name, if the name carries one.
    pub fn parse_quota_dir_name(&self, dir_name: &str) -> Option<VolumeId> {
        dir_name
            .strip_prefix(self.quota_dir_prefix.as_str())
            .and_then(|rest| rest.strip_prefix('_'))
            .filter(|rest| !rest.is_empty())
            .map(VolumeId::from)
    }
}

#[derive(Debug, Clone)]
pub struct DiskQuotaInfo {
    pub device: String,
    pub mount_point: PathBuf,
    pub capacity: u64,
    pub used: u64,
    /// Sum of the hard limits of every quota path on this disk.
    pub allocated: u64,
    pub allocatable: u64,
    pub disabled: bool,
    pub last_sync: Instant,
}

impl DiskQuotaInfo {
    fn recalc_allocatable(&mut self) {
        self.allocatable = self.capacity.saturating_sub(self.allocated);
    }
}

#[derive(Debug, Clone)]
pub struct PathQuotaInfo {
    pub volume_id: VolumeId,
    pub path: PathBuf,
    pub device: String,
    pub quota: Quota,
    pub last_sync: Instant,
}

pub trait QuotaManager: Send + Sync {
    /// Returns the quota path of `volume_id`, placing it on a disk first if needed.
    fn get_volume_quota_path(&self, volume_id: &VolumeId, requested: u64)
        -> HostPathResult<PathBuf>;
    fn expand_volume(&self, volume_id: &VolumeId, new_size: u64) -> HostPathResult<()>;
    fn release_volume_path(&self, volume_id: &VolumeId) -> HostPathResult<()>;
    fn list_path_quota_infos(&self) -> HostPathResult<Vec<PathQuotaInfo>>;
    fn list_quota_disk_infos(&self) -> HostPathResult<Vec<DiskQuotaInfo>>;
    fn set_quota_disk_disabled_state(&self, mount_point: &Path, disabled: bool)
        -> HostPathResult<()>;
}

/// Picks the enabled disk with the most allocatable space that still fits
/// `requested`. Equal headroom goes to the lexicographically smaller device.
pub fn select_disk<'a, I>(disks: I, requested: u64) -> Option<&'a DiskQuotaInfo>
where
    I: IntoIterator<Item = &'a DiskQuotaInfo>,
{
    disks
        .into_iter()
        .filter(|d| !d.disabled && d.allocatable >= requested)
        .min_by(|a, b| {
            b.allocatable
                .cmp(&a.allocatable)
                .then_with(|| a.device.cmp(&b.device))
        })
}

struct QuotaState {
    disks: BTreeMap<String, DiskQuotaInfo>,
    paths: HashMap<VolumeId, PathQuotaInfo>,
    provider: Box<dyn QuotaProvider>,
    probe: Box<dyn DiskProbe>,
}

impl QuotaState {
    fn disk_mut(&mut self, device: &str) -> HostPathResult<&mut DiskQuotaInfo> {
        self.disks.get_mut(device).ok_or_else(|| {
            HostPathError::Internal(format!("quota path on unregistered device {}", device))
        })
    }
}

/// Quota manager for the disks mounted under one root directory.
pub struct HostPathQuotaManager {
    config: QuotaManagerConfig,
    state: Mutex<QuotaState>,
}

impl HostPathQuotaManager {
    /// Rebuilds disk and path bookkeeping from what is on disk.
    pub fn restore(
        config: QuotaManagerConfig,
        provider: Box<dyn QuotaProvider>,
        probe: Box<dyn DiskProbe>,
    ) -> HostPathResult<Self> {
        let mut state = QuotaState {
            disks: BTreeMap::new(),
            paths: HashMap::new(),
            provider,
            probe,
        };

        if !config.root_path.is_dir() {
            return Err(HostPathError::NotFound(format!(
                "quota root {} does not exist",
                config.root_path.display()
            )));
        }

        Self::restore_disks(&config, &mut state)?;
        Self::restore_paths(&config, &mut state)?;

        info!(
            "quota manager restored: root={}, disks={}, paths={}",
            config.root_path.display(),
            state.disks.len(),
            state.paths.len()
        );
        Ok(Self {
            config,
            state: Mutex::new(state),
        })
    }

    fn restore_disks(config: &QuotaManagerConfig, state: &mut QuotaState) -> HostPathResult<()> {
        for mount_point in sub_dirs(&config.root_path)? {
            if !state.probe.is_mount_point(&mount_point)? {
                debug!("skip non mountpoint dir: {}", mount_point.display());
                continue;
            }
            let device = state.probe.device_of(&mount_point)?;
            if !state.provider.supported(&mount_point, &device) {
                warn!(
                    "disk {} on {} does not support project quota",
                    device,
                    mount_point.display()
                );
            }
            let usage = state.provider.get_quota_disk_info(&mount_point)?;
            let disabled = read_disk_disabled(state.probe.as_ref(), &mount_point)?;

            info!(
                "restore disk: device={}, mount={}, capacity={}, used={}, disabled={}",
                device,
                mount_point.display(),
                usage.capacity,
                usage.used,
                disabled
            );
            state.disks.insert(
                device.clone(),
                DiskQuotaInfo {
                    device,
                    mount_point,
                    capacity: usage.capacity,
                    used: usage.used,
                    allocated: 0,
                    allocatable: usage.capacity,
                    disabled,
                    last_sync: Instant::now(),
                },
            );
        }
        Ok(())
    }

    fn restore_paths(config: &QuotaManagerConfig, state: &mut QuotaState) -> HostPathResult<()> {
        let disks = state
            .disks
            .values()
            .map(|d| (d.device.clone(), d.mount_point.clone()))
            .collect::<Vec<_>>();

        for (device, mount_point) in disks {
            let mut allocated = 0u64;
            for quota_path in sub_dirs(&mount_point)? {
                let dir_name = quota_path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                let volume_id = match config.parse_quota_dir_name(&dir_name) {
                    Some(v) => v,
                    None => {
                        debug!("skip non quota dir: {}", quota_path.display());
                        continue;
                    }
                };
                if let Some(existing) = state.paths.get(&volume_id) {
                    warn!(
                        "duplicate quota dir for volume {}: keep {}, skip {}",
                        volume_id,
                        existing.path.display(),
                        quota_path.display()
                    );
                    continue;
                }

                let quota = state.provider.get_project_quota(&quota_path, &device)?;
                allocated += quota.hard;
                info!(
                    "restore quota path: volume={}, path={}, hard={}, used={}",
                    volume_id,
                    quota_path.display(),
                    quota.hard,
                    quota.used
                );
                state.paths.insert(
                    volume_id.clone(),
                    PathQuotaInfo {
                        volume_id,
                        path: quota_path,
                        device: device.clone(),
                        quota,
                        last_sync: Instant::now(),
                    },
                );
            }

            let disk = state.disk_mut(&device)?;
            disk.allocated = allocated;
            disk.recalc_allocatable();
        }
        Ok(())
    }

    fn lock_state(&self) -> HostPathResult<MutexGuard<'_, QuotaState>> {
        self.state
            .lock()
            .map_err(|e| HostPathError::Internal(format!("quota state lock poisoned: {}", e)))
    }

    fn validate_volume_id(volume_id: &VolumeId) -> HostPathResult<()> {
        let id = volume_id.as_str();
        if id.is_empty() || id.contains('/') || id == "." || id == ".." {
            return Err(HostPathError::InvalidArgument(format!(
                "volume id {:?} can not name a quota dir",
                id
            )));
        }
        Ok(())
    }
}

impl QuotaManager for HostPathQuotaManager {
    fn get_volume_quota_path(
        &self,
        volume_id: &VolumeId,
        requested: u64,
    ) -> HostPathResult<PathBuf> {
        Self::validate_volume_id(volume_id)?;
        let mut state = self.lock_state()?;
        if let Some(info) = state.paths.get(volume_id) {
            return Ok(info.path.clone());
        }

        let (device, mount_point) = select_disk(state.disks.values(), requested)
            .map(|d| (d.device.clone(), d.mount_point.clone()))
            .ok_or_else(|| {
                HostPathError::ResourceExhausted(format!(
                    "no disk has {} bytes allocatable for volume {}",
                    requested, volume_id
                ))
            })?;

        let quota_path = mount_point.join(self.config.quota_dir_name(volume_id));
        std::fs::create_dir_all(&quota_path).map_err(|e| {
            HostPathError::IoError(format!("create {} failed: {}", quota_path.display(), e))
        })?;

        if let Err(err) = state
            .provider
            .set_project_quota(&quota_path, &device, requested, requested)
        {
            error!(
                "set quota for volume {} at {} failed: {}",
                volume_id,
                quota_path.display(),
                err
            );
            if let Err(e) = std::fs::remove_dir_all(&quota_path) {
                warn!("remove {} failed: {}", quota_path.display(), e);
            }
            return Err(err);
        }

        state.paths.insert(
            volume_id.clone(),
            PathQuotaInfo {
                volume_id: volume_id.clone(),
                path: quota_path.clone(),
                device: device.clone(),
                quota: Quota {
                    hard: requested,
                    soft: requested,
                    used: 0,
                },
                last_sync: Instant::now(),
            },
        );
        let disk = state.disk_mut(&device)?;
        disk.allocated += requested;
        disk.recalc_allocatable();

        info!(
            "place volume: volume={}, device={}, path={}, size={}, disk_allocatable={}",
            volume_id,
            device,
            quota_path.display(),
            requested,
            disk.allocatable
        );
        Ok(quota_path)
    }

    fn expand_volume(&self, volume_id: &VolumeId, new_size: u64) -> HostPathResult<()> {
        let mut state = self.lock_state()?;
        let (quota_path, device, hard) = state
            .paths
            .get(volume_id)
            .map(|p| (p.path.clone(), p.device.clone(), p.quota.hard))
            .ok_or_else(|| {
                HostPathError::NotFound(format!("volume {} has no quota path", volume_id))
            })?;

        if new_size < hard {
            return Err(HostPathError::InvalidArgument(format!(
                "volume {} can not shrink from {} to {}",
                volume_id, hard, new_size
            )));
        }
        let delta = new_size - hard;
        if delta == 0 {
            return Ok(());
        }

        let allocatable = state.disk_mut(&device)?.allocatable;
        if allocatable < delta {
            return Err(HostPathError::ResourceExhausted(format!(
                "disk {} has {} bytes allocatable, volume {} needs {} more",
                device, allocatable, volume_id, delta
            )));
        }

        state
            .provider
            .set_project_quota(&quota_path, &device, new_size, new_size)?;

        if let Some(info) = state.paths.get_mut(volume_id) {
            info.quota.hard = new_size;
            info.quota.soft = new_size;
        }
        let disk = state.disk_mut(&device)?;
        disk.allocated += delta;
        disk.recalc_allocatable();
        info!(
            "expand volume: volume={}, from={}, to={}, disk_allocatable={}",
            volume_id, hard, new_size, disk.allocatable
        );
        Ok(())
    }

    fn release_volume_path(&self, volume_id: &VolumeId) -> HostPathResult<()> {
        let mut state = self.lock_state()?;
        let info = match state.paths.get(volume_id) {
            Some(v) => v.clone(),
            None => {
                debug!("release unknown volume {}, nothing to do", volume_id);
                return Ok(());
            }
        };

        state.provider.delete_project_quota(&info.path)?;
        state.paths.remove(volume_id);

        let disk = state.disk_mut(&info.device)?;
        disk.allocated = disk.allocated.saturating_sub(info.quota.hard);
        disk.recalc_allocatable();
        info!(
            "release volume: volume={}, path={}, freed={}, disk_allocatable={}",
            volume_id,
            info.path.display(),
            info.quota.hard,
            disk.allocatable
        );
        Ok(())
    }

    fn list_path_quota_infos(&self) -> HostPathResult<Vec<PathQuotaInfo>> {
        let mut guard = self.lock_state()?;
        let state = &mut *guard;
        let max_age = self.config.max_cache_age();
        let now = Instant::now();

        for info in state.paths.values_mut() {
            if now.duration_since(info.last_sync) < max_age {
                continue;
            }
            let quota = state
                .provider
                .get_project_quota(&info.path, &info.device)?;
            info.quota.used = quota.used;
            info.last_sync = now;
        }

        let mut infos = state.paths.values().cloned().collect::<Vec<_>>();
        infos.sort_by(|a, b| a.volume_id.cmp(&b.volume_id));
        Ok(infos)
    }

    fn list_quota_disk_infos(&self) -> HostPathResult<Vec<DiskQuotaInfo>> {
        let mut guard = self.lock_state()?;
        let state = &mut *guard;
        let max_age = self.config.max_cache_age();
        let now = Instant::now();

        for disk in state.disks.values_mut() {
            if now.duration_since(disk.last_sync) < max_age {
                continue;
            }
            let usage = state.provider.get_quota_disk_info(&disk.mount_point)?;
            disk.used = usage.used;
            disk.last_sync = now;
        }
        Ok(state.disks.values().cloned().collect())
    }

    fn set_quota_disk_disabled_state(
        &self,
        mount_point: &Path,
        disabled: bool,
    ) -> HostPathResult<()> {
        let mut guard = self.lock_state()?;
        let state = &mut *guard;
        let disk = state
            .disks
            .values_mut()
            .find(|d| d.mount_point == mount_point)
            .ok_or_else(|| {
                HostPathError::NotFound(format!("no disk mounted at {}", mount_point.display()))
            })?;

        write_disk_disabled(state.probe.as_ref(), mount_point, disabled)?;
        disk.disabled = disabled;
        info!(
            "set disk disabled: device={}, mount={}, disabled={}",
            disk.device,
            mount_point.display(),
            disabled
        );
        Ok(())
    }
}

/// Stand-in used when restore fails: every call reports `Unimplemented`.
#[derive(Debug, Default)]
pub struct UnimplementedQuotaManager;

impl UnimplementedQuotaManager {
    fn unavailable<T>(op: &str) -> HostPathResult<T> {
        Err(HostPathError::Unimplemented(format!(
            "{}: quota manager failed to start",
            op
        )))
    }
}

impl QuotaManager for UnimplementedQuotaManager {
    fn get_volume_quota_path(&self, _: &VolumeId, _: u64) -> HostPathResult<PathBuf> {
        Self::unavailable("get_volume_quota_path")
    }

    fn expand_volume(&self, _: &VolumeId, _: u64) -> HostPathResult<()> {
        Self::unavailable("expand_volume")
    }

    fn release_volume_path(&self, _: &VolumeId) -> HostPathResult<()> {
        Self::unavailable("release_volume_path")
    }

    fn list_path_quota_infos(&self) -> HostPathResult<Vec<PathQuotaInfo>> {
        Self::unavailable("list_path_quota_infos")
    }

    fn list_quota_disk_infos(&self) -> HostPathResult<Vec<DiskQuotaInfo>> {
        Self::unavailable("list_quota_disk_infos")
    }

    fn set_quota_disk_disabled_state(&self, _: &Path, _: bool) -> HostPathResult<()> {
        Self::unavailable("set_quota_disk_disabled_state")
    }
}

/// Restores a manager, degrading to [`UnimplementedQuotaManager`] on any failure.
pub fn new_quota_manager(
    config: QuotaManagerConfig,
    provider: Box<dyn QuotaProvider>,
    probe: Box<dyn DiskProbe>,
) -> Arc<dyn QuotaManager> {
    let root = config.root_path.clone();
    match HostPathQuotaManager::restore(config, provider, probe) {
        Ok(mgr) => Arc::new(mgr),
        Err(err) => {
            error!(
                "restore quota manager on {} failed, running without quota support: {}",
                root.display(),
                err
            );
            Arc::new(UnimplementedQuotaManager)
        }
    }
}

#[cfg(target_os = "linux")]
pub fn new_xfs_quota_manager(config: QuotaManagerConfig) -> Arc<dyn QuotaManager> {
    use crate::disk_probe::HostDiskProbe;
    use crate::xfs_quota::new_xfs_quota_provider;

    let probe = match HostDiskProbe::new(&config.disable_xattr_key) {
        Ok(v) => v,
        Err(err) => {
            error!("create disk probe failed: {}", err);
            return Arc::new(UnimplementedQuotaManager);
        }
    };
    let provider = match new_xfs_quota_provider(config.project_id_start, config.project_id_count) {
        Ok(v) => v,
        Err(err) => {
            error!("create xfs quota provider failed: {}", err);
            return Arc::new(UnimplementedQuotaManager);
        }
    };
    new_quota_manager(config, Box::new(provider), Box::new(probe))
}
