use crate::hostpath_client::HostPathClient;
use crate::meta_store::MetaStore;
use crate::run_blocking;
use hostpath_lib::{
    round_off_i64, to_i64, DiskInfo, HostPathError, HostPathResult, NodeUsageInfo, PvUsageInfo,
    VolumeId,
};
use log::{debug, error, info, warn};
use quota_mgr::{PathQuotaInfo, QuotaManager};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub const DEFAULT_SYNC_PERIOD: Duration = Duration::from_secs(30);
pub const DEFAULT_SYNC_JITTER: f64 = 0.1;

#[derive(Debug, Default, Clone)]
pub struct SyncRunStats {
    pub orphan_released: usize,
    pub orphan_failed: usize,
    pub usage_pushed: usize,
    pub usage_failed: usize,
    pub disks_toggled: usize,
    pub node_pushed: bool,
    pub phase_errors: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PushedUsage {
    path: String,
    hard: u64,
    used: u64,
}

impl PushedUsage {
    fn of(info: &PathQuotaInfo) -> Self {
        Self {
            path: info.path.to_string_lossy().to_string(),
            hard: info.quota.hard,
            used: info.quota.used,
        }
    }
}

/// `period * (1 + rand * factor)`, so nodes started together drift apart.
pub fn jittered_period(period: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return period;
    }
    period.mul_f64(1.0 + rand::random::<f64>() * factor)
}

/// Small unit drift in used bytes is not worth a node record write.
pub fn node_usage_changed(old: Option<&NodeUsageInfo>, new: &NodeUsageInfo) -> bool {
    let old = match old {
        Some(v) => v,
        None => return true,
    };
    if old.capacity != new.capacity
        || old.quota_size != new.quota_size
        || round_off_i64(old.used) != round_off_i64(new.used)
        || old.disk_status.len() != new.disk_status.len()
    {
        return true;
    }
    old.disk_status
        .iter()
        .zip(new.disk_status.iter())
        .any(|(a, b)| {
            a.mount_point != b.mount_point
                || round_off_i64(a.used) != round_off_i64(b.used)
                || a.allocatable != b.allocatable
                || a.disabled != b.disabled
        })
}

/// Periodic reconciliation between the local quota manager and cluster records.
pub struct SyncWorker {
    node_name: String,
    quota_mgr: Arc<dyn QuotaManager>,
    meta_store: Arc<dyn MetaStore>,
    client: Arc<dyn HostPathClient>,
    should_delete: BTreeSet<VolumeId>,
    last_pushed: HashMap<VolumeId, PushedUsage>,
    last_node_usage: Option<NodeUsageInfo>,
}

impl SyncWorker {
    pub fn new(
        node_name: &str,
        quota_mgr: Arc<dyn QuotaManager>,
        meta_store: Arc<dyn MetaStore>,
        client: Arc<dyn HostPathClient>,
    ) -> Self {
        Self {
            node_name: node_name.to_string(),
            quota_mgr,
            meta_store,
            client,
            should_delete: BTreeSet::new(),
            last_pushed: HashMap::new(),
            last_node_usage: None,
        }
    }

    /// Volume ids whose release failed and will be retried next tick.
    pub fn pending_releases(&self) -> Vec<VolumeId> {
        self.should_delete.iter().cloned().collect()
    }

    pub async fn run_once(&mut self) -> SyncRunStats {
        let mut stats = SyncRunStats::default();

        let quota_mgr = self.quota_mgr.clone();
        let paths = match run_blocking("list quota paths", move || {
            quota_mgr.list_path_quota_infos()
        })
        .await
        {
            Ok(v) => Some(v),
            Err(err) => {
                error!("sync list quota paths failed: {}", err);
                stats.phase_errors += 1;
                None
            }
        };

        let released = match self
            .clean_orphan_quota_paths(paths.as_deref(), &mut stats)
            .await
        {
            Ok(v) => v,
            Err(err) => {
                error!("sync orphan cleanup failed: {}", err);
                stats.phase_errors += 1;
                BTreeSet::new()
            }
        };

        if let Some(paths) = paths.as_ref() {
            let live = paths
                .iter()
                .filter(|p| !released.contains(&p.volume_id))
                .collect::<Vec<_>>();
            self.sync_quota_path_usage(&live, &mut stats).await;
        }

        if let Err(err) = self.sync_node_quota_status(&mut stats).await {
            error!("sync node quota status failed: {}", err);
            stats.phase_errors += 1;
        }

        debug!(
            "sync tick done: node={}, released={}, usage_pushed={}, node_pushed={}, errors={}",
            self.node_name,
            stats.orphan_released,
            stats.usage_pushed,
            stats.node_pushed,
            stats.phase_errors
        );
        stats
    }

    /// Releases leftover retries plus every quota path whose volume no longer exists.
    async fn clean_orphan_quota_paths(
        &mut self,
        paths: Option<&[PathQuotaInfo]>,
        stats: &mut SyncRunStats,
    ) -> HostPathResult<BTreeSet<VolumeId>> {
        let mut candidates = std::mem::take(&mut self.should_delete);

        let listed = match paths {
            Some(paths) => match self.meta_store.list_meta_infos().await {
                Ok(known) => {
                    for info in paths {
                        if !known.contains(&info.volume_id) {
                            candidates.insert(info.volume_id.clone());
                        }
                    }
                    Ok(())
                }
                Err(err) => Err(err),
            },
            None => Ok(()),
        };

        let mut released = BTreeSet::new();
        for volume_id in candidates {
            let quota_mgr = self.quota_mgr.clone();
            let id = volume_id.clone();
            let result =
                run_blocking("release quota path", move || quota_mgr.release_volume_path(&id))
                    .await;
            match result {
                Ok(()) => {
                    info!("release orphan quota path: volume={}", volume_id);
                    self.last_pushed.remove(&volume_id);
                    stats.orphan_released += 1;
                    released.insert(volume_id);
                }
                Err(err) => {
                    warn!(
                        "release orphan quota path failed, retry next tick: volume={}, err={}",
                        volume_id, err
                    );
                    stats.orphan_failed += 1;
                    self.should_delete.insert(volume_id);
                }
            }
        }

        listed.map(|_| released)
    }

    async fn sync_quota_path_usage(&mut self, paths: &[&PathQuotaInfo], stats: &mut SyncRunStats) {
        let live = paths
            .iter()
            .map(|p| p.volume_id.clone())
            .collect::<BTreeSet<_>>();
        self.last_pushed.retain(|id, _| live.contains(id));

        for info in paths {
            let pushed = PushedUsage::of(info);
            if self.last_pushed.get(&info.volume_id) == Some(&pushed) {
                continue;
            }

            let volume = match self.client.get_volume_by_id(&info.volume_id).await {
                Ok(Some(v)) => v,
                Ok(None) => {
                    debug!("no volume record for {}, skip usage push", info.volume_id);
                    continue;
                }
                Err(err) => {
                    error!("get volume {} failed: {}", info.volume_id, err);
                    stats.usage_failed += 1;
                    continue;
                }
            };

            let usage = PvUsageInfo {
                node_name: self.node_name.clone(),
                path: pushed.path.clone(),
                capacity: to_i64(pushed.hard),
                used: to_i64(pushed.used),
            };
            match self.client.update_volume_usage(&volume.name, &usage).await {
                Ok(()) => {
                    debug!(
                        "push volume usage: volume={}, used={}/{}",
                        volume.name, usage.used, usage.capacity
                    );
                    self.last_pushed.insert(info.volume_id.clone(), pushed);
                    stats.usage_pushed += 1;
                }
                Err(err) => {
                    error!("push usage of volume {} failed: {}", volume.name, err);
                    stats.usage_failed += 1;
                }
            }
        }
    }

    async fn sync_node_quota_status(&mut self, stats: &mut SyncRunStats) -> HostPathResult<()> {
        let node = self
            .client
            .get_node(&self.node_name)
            .await?
            .ok_or_else(|| HostPathError::NotFound(format!("node {}", self.node_name)))?;
        let quota_mgr = self.quota_mgr.clone();
        let mut disks =
            run_blocking("list quota disks", move || quota_mgr.list_quota_disk_infos()).await?;

        for disk in disks.iter_mut() {
            let mount = disk.mount_point.to_string_lossy().to_string();
            let wanted = node.disabled_disks.contains(&mount);
            if wanted == disk.disabled {
                continue;
            }
            let quota_mgr = self.quota_mgr.clone();
            let mount_point = PathBuf::from(&mount);
            let result = run_blocking("set disk disabled state", move || {
                quota_mgr.set_quota_disk_disabled_state(&mount_point, wanted)
            })
            .await;
            match result {
                Ok(()) => {
                    info!("apply disk disable state: mount={}, disabled={}", mount, wanted);
                    disk.disabled = wanted;
                    stats.disks_toggled += 1;
                }
                Err(err) => error!("set disk {} disabled={} failed: {}", mount, wanted, err),
            }
        }

        let mut usage = NodeUsageInfo::default();
        for disk in disks.iter() {
            let info = DiskInfo {
                mount_point: disk.mount_point.to_string_lossy().to_string(),
                capacity: to_i64(disk.capacity),
                quota_size: to_i64(disk.allocated),
                used: to_i64(disk.used),
                allocatable: to_i64(disk.allocatable),
                disabled: disk.disabled,
            };
            usage.capacity += info.capacity;
            usage.quota_size += info.quota_size;
            usage.used += info.used;
            usage.allocatable += info.allocatable;
            usage.disk_status.push(info);
        }
        usage.available_size = usage.capacity - usage.used;
        usage.sort_disks();

        if !node_usage_changed(self.last_node_usage.as_ref(), &usage) {
            return Ok(());
        }
        self.client.update_node_usage(&self.node_name, &usage).await?;
        info!(
            "push node usage: node={}, capacity={}, quota={}, used={}, allocatable={}",
            self.node_name, usage.capacity, usage.quota_size, usage.used, usage.allocatable
        );
        self.last_node_usage = Some(usage);
        stats.node_pushed = true;
        Ok(())
    }

    /// Runs a tick right away, then one per jittered period. Ticks never overlap.
    pub fn spawn(mut self, period: Duration, jitter_factor: f64) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "sync worker start: node={}, period={:?}, jitter={}",
                self.node_name, period, jitter_factor
            );
            loop {
                let _ = self.run_once().await;
                tokio::time::sleep(jittered_period(period, jitter_factor)).await;
            }
        })
    }
}
