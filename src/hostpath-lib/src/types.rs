use crate::{HostPathError, HostPathResult, VolumeId};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const NODE_DISK_INFO_ANNOTATION: &str = "storage.hostpathpv.kubelet/quota-disk-info";
pub const NODE_DISABLE_DISKS_ANNOTATION: &str = "storage.hostpathpv.kubelet/disable-disks";
pub const PV_USAGE_ANNOTATION: &str = "storage.hostpathpv.volume/allocate";
pub const PV_BIND_NODE_ANNOTATION: &str = "storage.hostpathpv.volume/bind-node";
pub const HOSTPATH_NODE_LABEL: &str = "node-role.kubernetes.io/hostpath";

/// Usage record stored on the volume object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PvUsageInfo {
    pub node_name: String,
    pub path: String,
    pub capacity: i64,
    pub used: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DiskInfo {
    pub mount_point: String,
    pub capacity: i64,
    pub quota_size: i64,
    pub used: i64,
    pub allocatable: i64,
    pub disabled: bool,
}

/// Aggregate usage record stored on the node object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NodeUsageInfo {
    pub capacity: i64,
    pub quota_size: i64,
    pub used: i64,
    pub available_size: i64,
    pub allocatable: i64,
    pub disk_status: Vec<DiskInfo>,
}

impl NodeUsageInfo {
    /// Orders disks by allocatable descending, mountpoint ascending.
    pub fn sort_disks(&mut self) {
        self.disk_status.sort_by(|a, b| {
            b.allocatable
                .cmp(&a.allocatable)
                .then_with(|| a.mount_point.cmp(&b.mount_point))
        });
    }
}

pub fn encode_annotation<T: Serialize>(value: &T) -> HostPathResult<String> {
    let json = serde_json::to_vec(value)?;
    Ok(STANDARD.encode(json))
}

pub fn decode_annotation<T: DeserializeOwned>(value: &str) -> HostPathResult<T> {
    let raw = STANDARD
        .decode(value.trim())
        .map_err(|e| HostPathError::InvalidData(format!("decode annotation failed: {}", e)))?;
    Ok(serde_json::from_slice(&raw)?)
}

pub fn encode_disabled_disks(disks: &BTreeSet<String>) -> String {
    let joined = disks.iter().cloned().collect::<Vec<_>>().join(",");
    STANDARD.encode(joined)
}

pub fn decode_disabled_disks(value: &str) -> HostPathResult<BTreeSet<String>> {
    let raw = STANDARD
        .decode(value.trim())
        .map_err(|e| HostPathError::InvalidData(format!("decode disable disks failed: {}", e)))?;
    let text = String::from_utf8(raw)
        .map_err(|e| HostPathError::InvalidData(format!("disable disks not utf8: {}", e)))?;
    Ok(text
        .split(',')
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .collect())
}

/// Cluster-side view of one persistent volume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostPathVolume {
    pub name: String,
    pub volume_id: Option<VolumeId>,
    pub is_hostpath: bool,
    pub ephemeral: bool,
    pub capacity: i64,
    pub bind_node: Option<String>,
    pub usage: Option<PvUsageInfo>,
}

impl HostPathVolume {
    pub fn is_bound(&self) -> bool {
        self.bind_node.as_deref().map_or(false, |n| !n.is_empty())
    }

    pub fn is_bound_to(&self, node: &str) -> bool {
        self.bind_node.as_deref() == Some(node)
    }
}

/// Cluster-side view of one node, decoded from its labels and annotations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostPathNode {
    pub name: String,
    pub is_hostpath_node: bool,
    pub usage: Option<NodeUsageInfo>,
    pub disabled_disks: BTreeSet<String>,
}

impl HostPathNode {
    pub fn from_metadata(
        name: &str,
        labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> HostPathResult<Self> {
        let usage = match annotations.get(NODE_DISK_INFO_ANNOTATION) {
            Some(v) if !v.is_empty() => Some(decode_annotation::<NodeUsageInfo>(v)?),
            _ => None,
        };
        let disabled_disks = match annotations.get(NODE_DISABLE_DISKS_ANNOTATION) {
            Some(v) if !v.is_empty() => decode_disabled_disks(v)?,
            _ => BTreeSet::new(),
        };

        Ok(Self {
            name: name.to_string(),
            is_hostpath_node: labels.contains_key(HOSTPATH_NODE_LABEL),
            usage,
            disabled_disks,
        })
    }

    #[cfg(test)]
    pub fn to_annotations(&self) -> HostPathResult<BTreeMap<String, String>> {
        let mut annotations = BTreeMap::new();
        if let Some(usage) = self.usage.as_ref() {
            annotations.insert(
                NODE_DISK_INFO_ANNOTATION.to_string(),
                encode_annotation(usage)?,
            );
        }
        if !self.disabled_disks.is_empty() {
            annotations.insert(
                NODE_DISABLE_DISKS_ANNOTATION.to_string(),
                encode_disabled_disks(&self.disabled_disks),
            );
        }
        Ok(annotations)
    }

    /// Allocatable space of every enabled disk, largest first.
    pub fn allocatable_disks(&self) -> Vec<i64> {
        let mut sizes = self
            .usage
            .as_ref()
            .map(|u| {
                u.disk_status
                    .iter()
                    .filter(|d| !d.disabled && !self.disabled_disks.contains(&d.mount_point))
                    .map(|d| d.allocatable)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        sizes.sort_by(|a, b| b.cmp(a));
        sizes
    }
}
