//! Scheduler extender payloads, already decoded by the HTTP layer.
//!
//! Field names follow the extender wire format (`Pod`, `Nodes`, `FailedNodes`, ...).

use hostpath_lib::{HostPathNode, HostPathResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PodInfo {
    pub name: String,
    pub namespace: String,
    pub uid: String,
    /// Names of the persistent volume claims the pod mounts.
    pub claims: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExtenderNode {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl ExtenderNode {
    pub fn to_hostpath_node(&self) -> HostPathResult<HostPathNode> {
        HostPathNode::from_metadata(&self.name, &self.labels, &self.annotations)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ExtenderArgs {
    pub pod: PodInfo,
    pub nodes: Vec<ExtenderNode>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ExtenderFilterResult {
    pub nodes: Vec<ExtenderNode>,
    /// Node name to failure reason.
    pub failed_nodes: BTreeMap<String, String>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostPriority {
    pub host: String,
    pub score: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ExtenderBindingArgs {
    pub pod_name: String,
    pub pod_namespace: String,
    #[serde(rename = "PodUID")]
    pub pod_uid: String,
    pub node: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ExtenderBindingResult {
    /// Empty on success.
    pub error: String,
}

impl ExtenderBindingResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn failed(error: String) -> Self {
        Self { error }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostpath_lib::HOSTPATH_NODE_LABEL;

    #[test]
    fn test_wire_field_names() {
        let args: ExtenderBindingArgs = serde_json::from_str(
            r#"{"PodName":"web-0","PodNamespace":"default","PodUID":"u-1","Node":"node1"}"#,
        )
        .unwrap();
        assert_eq!(args.pod_name, "web-0");
        assert_eq!(args.pod_uid, "u-1");
        assert_eq!(args.node, "node1");

        let result = ExtenderFilterResult {
            failed_nodes: BTreeMap::from([("node2".to_string(), "full".to_string())]),
            ..Default::default()
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["FailedNodes"]["node2"], "full");
        assert_eq!(value["Error"], "");
    }

    #[test]
    fn test_to_hostpath_node() {
        let node = ExtenderNode {
            name: "node1".to_string(),
            labels: BTreeMap::from([(HOSTPATH_NODE_LABEL.to_string(), String::new())]),
            annotations: BTreeMap::new(),
        };
        let hp = node.to_hostpath_node().unwrap();
        assert!(hp.is_hostpath_node);
        assert!(hp.usage.is_none());
    }
}
