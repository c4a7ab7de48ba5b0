use crate::hostpath_client::FileRecordStore;
use crate::meta_store::FileMetaStore;
use crate::sync_worker::{SyncWorker, DEFAULT_SYNC_JITTER, DEFAULT_SYNC_PERIOD};
use hostpath_lib::{read_json_config, HostPathError, HostPathResult, DRIVER_NAME};
use log::info;
use quota_mgr::{QuotaManager, QuotaManagerConfig};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_NODE_AGENT_CONFIG_PATH: &str = "/etc/hostpath-csi/node_agent.json";
pub const NODE_NAME_ENV: &str = "NODE_NAME";

#[derive(Debug, Clone)]
pub struct NodeAgentRunOptions {
    pub config_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeAgentConfig {
    #[serde(alias = "nodeid", alias = "node_id")]
    pub node_name: String,
    pub driver_name: String,
    pub quota: QuotaManagerConfig,
    pub sync_period_secs: u64,
    pub sync_jitter_factor: f64,
    #[serde(alias = "meta_store")]
    pub meta_store_path: PathBuf,
    pub record_dir: PathBuf,
}

impl Default for NodeAgentConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            driver_name: DRIVER_NAME.to_string(),
            quota: QuotaManagerConfig::default(),
            sync_period_secs: DEFAULT_SYNC_PERIOD.as_secs(),
            sync_jitter_factor: DEFAULT_SYNC_JITTER,
            meta_store_path: PathBuf::from("/var/lib/hostpath-csi/meta-store.json"),
            record_dir: PathBuf::from("/var/lib/hostpath-csi/records"),
        }
    }
}

impl NodeAgentConfig {
    pub fn load(options: &NodeAgentRunOptions) -> HostPathResult<Self> {
        let mut config: NodeAgentConfig = read_json_config(&options.config_path)?;
        if config.node_name.is_empty() {
            config.node_name = std::env::var(NODE_NAME_ENV).unwrap_or_default();
        }
        if config.node_name.is_empty() {
            return Err(HostPathError::InvalidArgument(format!(
                "node_name missing in {} and ${} unset",
                options.config_path.display(),
                NODE_NAME_ENV
            )));
        }
        if config.sync_period_secs == 0 {
            return Err(HostPathError::InvalidArgument(
                "sync_period_secs must be positive".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn sync_period(&self) -> Duration {
        Duration::from_secs(self.sync_period_secs)
    }
}

#[cfg(target_os = "linux")]
fn build_quota_manager(config: &QuotaManagerConfig) -> Arc<dyn QuotaManager> {
    quota_mgr::new_xfs_quota_manager(config.clone())
}

#[cfg(not(target_os = "linux"))]
fn build_quota_manager(_config: &QuotaManagerConfig) -> Arc<dyn QuotaManager> {
    log::error!("project quotas need linux, running without quota support");
    Arc::new(quota_mgr::UnimplementedQuotaManager)
}

pub async fn run_node_agent(options: NodeAgentRunOptions) -> HostPathResult<()> {
    let config = NodeAgentConfig::load(&options)?;
    info!(
        "node agent start: driver={}, node={}, quota_root={}",
        config.driver_name,
        config.node_name,
        config.quota.root_path.display()
    );

    let quota_mgr = build_quota_manager(&config.quota);
    let meta_store = Arc::new(FileMetaStore::new(&config.meta_store_path));
    let client = Arc::new(FileRecordStore::new(&config.record_dir));

    let worker = SyncWorker::new(&config.node_name, quota_mgr, meta_store, client);
    let handle = worker.spawn(config.sync_period(), config.sync_jitter_factor);

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| HostPathError::IoError(format!("wait for ctrl-c failed: {}", e)))?;
    info!("node agent stop: node={}", config.node_name);
    handle.abort();
    Ok(())
}
