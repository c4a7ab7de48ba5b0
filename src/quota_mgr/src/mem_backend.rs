//! In-process quota primitives and disk probe.
//!
//! Nothing is enforced: limits and usage are plain numbers that callers can
//! inspect and adjust. State lives behind an `Arc`, so clones observe the same
//! "filesystem" and a manager built later sees what an earlier one left behind.

use crate::disk_probe::DiskProbe;
use crate::quota_provider::{DiskUsage, ProjectQuotaOps, ProjectQuotaProvider, Quota};
use hostpath_lib::{HostPathError, HostPathResult};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct MemQuotaState {
    disks: HashMap<PathBuf, DiskUsage>,
    unsupported: HashSet<PathBuf>,
    project_ids: HashMap<PathBuf, u32>,
    quotas: HashMap<(String, u32), Quota>,
    fail_set_quota: bool,
}

#[derive(Debug, Default, Clone)]
pub struct MemQuotaOps {
    state: Arc<Mutex<MemQuotaState>>,
}

impl MemQuotaOps {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemQuotaState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_disk(&self, mount_point: &Path, capacity: u64, used: u64) {
        self.state()
            .disks
            .insert(mount_point.to_path_buf(), DiskUsage { capacity, used });
    }

    pub fn set_disk_used(&self, mount_point: &Path, used: u64) {
        if let Some(disk) = self.state().disks.get_mut(mount_point) {
            disk.used = used;
        }
    }

    pub fn set_unsupported(&self, mount_point: &Path) {
        self.state().unsupported.insert(mount_point.to_path_buf());
    }

    pub fn set_quota_used(&self, device: &str, project_id: u32, used: u64) {
        self.state()
            .quotas
            .entry((device.to_string(), project_id))
            .or_default()
            .used = used;
    }

    pub fn fail_set_quota(&self, fail: bool) {
        self.state().fail_set_quota = fail;
    }

    pub fn project_id_of(&self, path: &Path) -> Option<u32> {
        self.state().project_ids.get(path).copied()
    }

    pub fn quota_of(&self, device: &str, project_id: u32) -> Option<Quota> {
        self.state()
            .quotas
            .get(&(device.to_string(), project_id))
            .copied()
    }

    pub fn into_provider(
        self,
        id_start: u32,
        id_count: u32,
    ) -> HostPathResult<ProjectQuotaProvider<Self>> {
        ProjectQuotaProvider::new(self, id_start, id_count)
    }
}

impl ProjectQuotaOps for MemQuotaOps {
    fn is_quota_enabled(&self, mount_point: &Path, _device: &str) -> bool {
        let state = self.state();
        state.disks.contains_key(mount_point) && !state.unsupported.contains(mount_point)
    }

    fn get_project_id(&self, path: &Path) -> HostPathResult<u32> {
        if !path.is_dir() {
            return Err(HostPathError::IoError(format!(
                "open {}: not a directory",
                path.display()
            )));
        }
        // an untagged directory reports project 0, like a fresh inode
        Ok(self.state().project_ids.get(path).copied().unwrap_or(0))
    }

    fn set_project_id(&self, path: &Path, project_id: u32) -> HostPathResult<()> {
        if !path.is_dir() {
            return Err(HostPathError::IoError(format!(
                "open {}: not a directory",
                path.display()
            )));
        }
        self.state()
            .project_ids
            .insert(path.to_path_buf(), project_id);
        Ok(())
    }

    fn get_quota(&self, device: &str, project_id: u32) -> HostPathResult<Quota> {
        Ok(self
            .state()
            .quotas
            .get(&(device.to_string(), project_id))
            .copied()
            .unwrap_or_default())
    }

    fn set_quota(
        &self,
        device: &str,
        project_id: u32,
        hard: u64,
        soft: u64,
    ) -> HostPathResult<()> {
        let mut state = self.state();
        if state.fail_set_quota {
            return Err(HostPathError::IoError(format!(
                "set quota on {} project {} failed",
                device, project_id
            )));
        }
        let quota = state
            .quotas
            .entry((device.to_string(), project_id))
            .or_default();
        quota.hard = hard;
        quota.soft = soft;
        Ok(())
    }

    fn fs_usage(&self, mount_point: &Path) -> HostPathResult<DiskUsage> {
        self.state()
            .disks
            .get(mount_point)
            .copied()
            .ok_or_else(|| {
                HostPathError::IoError(format!("statfs {}: no such disk", mount_point.display()))
            })
    }
}

#[derive(Debug, Default)]
struct MemProbeState {
    devices: HashMap<PathBuf, String>,
    attrs: HashMap<PathBuf, String>,
}

#[derive(Debug, Default, Clone)]
pub struct MemDiskProbe {
    state: Arc<Mutex<MemProbeState>>,
}

impl MemDiskProbe {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemProbeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_mount(&self, mount_point: &Path, device: &str) {
        self.state()
            .devices
            .insert(mount_point.to_path_buf(), device.to_string());
    }

    pub fn disable_attr(&self, mount_point: &Path) -> Option<String> {
        self.state().attrs.get(mount_point).cloned()
    }

    pub fn set_disable_attr(&self, mount_point: &Path, value: &str) {
        self.state()
            .attrs
            .insert(mount_point.to_path_buf(), value.to_string());
    }
}

impl DiskProbe for MemDiskProbe {
    fn is_mount_point(&self, path: &Path) -> HostPathResult<bool> {
        Ok(self.state().devices.contains_key(path))
    }

    fn device_of(&self, mount_point: &Path) -> HostPathResult<String> {
        self.state()
            .devices
            .get(mount_point)
            .cloned()
            .ok_or_else(|| {
                HostPathError::NotFound(format!("no mount entry for {}", mount_point.display()))
            })
    }

    fn read_disable_attr(&self, mount_point: &Path) -> HostPathResult<Option<String>> {
        Ok(self.state().attrs.get(mount_point).cloned())
    }

    fn write_disable_attr(&self, mount_point: &Path, value: &str) -> HostPathResult<()> {
        self.set_disable_attr(mount_point, value);
        Ok(())
    }
}
