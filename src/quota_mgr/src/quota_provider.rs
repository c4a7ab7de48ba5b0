use crate::projid_allocator::ProjectIdAllocator;
use hostpath_lib::{HostPathError, HostPathResult};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Limits and usage of one project quota, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Quota {
    pub hard: u64,
    pub soft: u64,
    pub used: u64,
}

/// Aggregate block usage of a mounted filesystem, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiskUsage {
    pub capacity: u64,
    pub used: u64,
}

/// Quota enforcement backend used by the quota manager.
///
/// Every call happens under the manager's lock, so implementations keep
/// their own bookkeeping without further synchronization.
pub trait QuotaProvider: Send {
    fn supported(&self, mount_point: &Path, device: &str) -> bool;

    /// Reads the quota of `quota_path`, adopting the project id already tagged
    /// on the directory when the path has not been seen before.
    fn get_project_quota(&mut self, quota_path: &Path, device: &str) -> HostPathResult<Quota>;

    fn set_project_quota(
        &mut self,
        quota_path: &Path,
        device: &str,
        hard: u64,
        soft: u64,
    ) -> HostPathResult<()>;

    /// Drops the quota and removes the directory tree.
    fn delete_project_quota(&mut self, quota_path: &Path) -> HostPathResult<()>;

    fn get_quota_disk_info(&self, mount_point: &Path) -> HostPathResult<DiskUsage>;
}

/// Filesystem primitives a project quota backend is built from.
pub trait ProjectQuotaOps: Send {
    fn is_quota_enabled(&self, mount_point: &Path, device: &str) -> bool;
    fn get_project_id(&self, path: &Path) -> HostPathResult<u32>;
    fn set_project_id(&self, path: &Path, project_id: u32) -> HostPathResult<()>;
    fn get_quota(&self, device: &str, project_id: u32) -> HostPathResult<Quota>;
    fn set_quota(&self, device: &str, project_id: u32, hard: u64, soft: u64)
        -> HostPathResult<()>;
    fn fs_usage(&self, mount_point: &Path) -> HostPathResult<DiskUsage>;
}

/// Project quota backend: one project id per quota directory.
pub struct ProjectQuotaProvider<O: ProjectQuotaOps> {
    ops: O,
    allocator: ProjectIdAllocator,
    path_ids: HashMap<PathBuf, u32>,
}

impl<O: ProjectQuotaOps> ProjectQuotaProvider<O> {
    pub fn new(ops: O, id_start: u32, id_count: u32) -> HostPathResult<Self> {
        Ok(Self {
            ops,
            allocator: ProjectIdAllocator::new(id_start, id_count)?,
            path_ids: HashMap::new(),
        })
    }

    pub fn project_id_of(&self, quota_path: &Path) -> Option<u32> {
        self.path_ids.get(quota_path).copied()
    }

    fn assign_new_project(
        &mut self,
        quota_path: &Path,
        device: &str,
        hard: u64,
        soft: u64,
    ) -> HostPathResult<u32> {
        let project_id = self.allocator.allocate_next()?;
        let result = self
            .ops
            .set_project_id(quota_path, project_id)
            .and_then(|_| self.ops.set_quota(device, project_id, hard, soft));
        if let Err(err) = result {
            self.allocator.release(project_id);
            return Err(err);
        }
        Ok(project_id)
    }
}

impl<O: ProjectQuotaOps> QuotaProvider for ProjectQuotaProvider<O> {
    fn supported(&self, mount_point: &Path, device: &str) -> bool {
        self.ops.is_quota_enabled(mount_point, device)
    }

    fn get_project_quota(&mut self, quota_path: &Path, device: &str) -> HostPathResult<Quota> {
        let project_id = match self.path_ids.get(quota_path) {
            Some(id) => *id,
            None => {
                let id = self.ops.get_project_id(quota_path)?;
                self.allocator.allocate(id)?;
                self.path_ids.insert(quota_path.to_path_buf(), id);
                info!(
                    "adopt project quota: path={}, project_id={}",
                    quota_path.display(),
                    id
                );
                id
            }
        };
        self.ops.get_quota(device, project_id)
    }

    fn set_project_quota(
        &mut self,
        quota_path: &Path,
        device: &str,
        hard: u64,
        soft: u64,
    ) -> HostPathResult<()> {
        if let Some(project_id) = self.path_ids.get(quota_path).copied() {
            debug!(
                "update project quota: path={}, project_id={}, hard={}",
                quota_path.display(),
                project_id,
                hard
            );
            return self.ops.set_quota(device, project_id, hard, soft);
        }

        let project_id = self.assign_new_project(quota_path, device, hard, soft)?;
        self.path_ids.insert(quota_path.to_path_buf(), project_id);
        info!(
            "set project quota: path={}, device={}, project_id={}, hard={}, soft={}",
            quota_path.display(),
            device,
            project_id,
            hard,
            soft
        );
        Ok(())
    }

    fn delete_project_quota(&mut self, quota_path: &Path) -> HostPathResult<()> {
        match self.path_ids.remove(quota_path) {
            Some(project_id) => {
                self.allocator.release(project_id);
                info!(
                    "delete project quota: path={}, project_id={}",
                    quota_path.display(),
                    project_id
                );
            }
            None => warn!(
                "delete project quota for untracked path: {}",
                quota_path.display()
            ),
        }

        match std::fs::remove_dir_all(quota_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(HostPathError::IoError(format!(
                "remove {} failed: {}",
                quota_path.display(),
                e
            ))),
        }
    }

    fn get_quota_disk_info(&self, mount_point: &Path) -> HostPathResult<DiskUsage> {
        self.ops.fs_usage(mount_point)
    }
}
