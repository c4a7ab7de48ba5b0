use crate::controller::{resolve_claims, ClaimVolume, HostPathController};
use crate::types::{ExtenderArgs, ExtenderFilterResult, ExtenderNode, PodInfo};
use log::{debug, error, info};
use std::sync::Arc;

pub const DISK_PRESSURE_PREDICATE: &str = "hostpathpvdiskpressure";

/// First-fit-decreasing: every request, largest first, takes the first disk
/// (largest allocatable first) that still has room for it. Non-positive
/// requests need no room.
pub fn can_node_match(requests: &[i64], allocatable: &[i64]) -> bool {
    let mut requests = requests
        .iter()
        .copied()
        .filter(|r| *r > 0)
        .collect::<Vec<_>>();
    requests.sort_by(|a, b| b.cmp(a));
    let mut disks = allocatable.to_vec();
    disks.sort_by(|a, b| b.cmp(a));

    for request in requests {
        match disks.iter_mut().find(|d| **d >= request) {
            Some(disk) => *disk -= request,
            None => return false,
        }
    }
    true
}

fn failure(name: &str, reason: String) -> String {
    format!("Predicate {} failed because {}", name, reason)
}

/// Filters out nodes that can not hold the pod's unbound hostpath volumes.
pub struct DiskPressurePredicate {
    controller: Arc<dyn HostPathController>,
}

impl DiskPressurePredicate {
    pub fn new(controller: Arc<dyn HostPathController>) -> Self {
        Self { controller }
    }

    pub async fn filter(&self, name: &str, args: &ExtenderArgs) -> ExtenderFilterResult {
        let pod = &args.pod;
        let claims = match resolve_claims(self.controller.as_ref(), pod).await {
            Ok(v) => v,
            Err(err) => {
                error!("resolve claims of pod {}/{} failed: {}", pod.namespace, pod.name, err);
                return ExtenderFilterResult {
                    error: err.to_string(),
                    ..Default::default()
                };
            }
        };

        let mut result = ExtenderFilterResult::default();
        for node in args.nodes.iter() {
            match self.filter_node(pod, &claims, node) {
                Ok(()) => result.nodes.push(node.clone()),
                Err(reason) => {
                    debug!("node {} filtered for pod {}/{}: {}", node.name, pod.namespace, pod.name, reason);
                    result
                        .failed_nodes
                        .insert(node.name.clone(), failure(name, reason));
                }
            }
        }
        info!(
            "filter pod {}/{}: passed={}, failed={}",
            pod.namespace,
            pod.name,
            result.nodes.len(),
            result.failed_nodes.len()
        );
        result
    }

    fn filter_node(
        &self,
        pod: &PodInfo,
        claims: &[ClaimVolume],
        node: &ExtenderNode,
    ) -> Result<(), String> {
        let hp_node = node
            .to_hostpath_node()
            .map_err(|e| format!("node {} has bad disk annotations: {}", node.name, e))?;

        let mut requests = Vec::new();
        for claim in claims {
            let volume = claim.volume.as_ref().ok_or_else(|| {
                format!("claim {}/{} has no volume bound", pod.namespace, claim.claim)
            })?;
            if !volume.is_hostpath {
                continue;
            }
            if !hp_node.is_hostpath_node {
                return Err(format!(
                    "pod uses hostpath volume {} but node {} is not a hostpath node",
                    volume.name, node.name
                ));
            }
            if volume.is_bound() {
                if !volume.is_bound_to(&node.name) {
                    return Err(format!(
                        "volume {} has bind to node {}",
                        volume.name,
                        volume.bind_node.as_deref().unwrap_or_default()
                    ));
                }
                // quota path already exists there
                continue;
            }
            requests.push(volume.capacity);
        }

        let total = requests
            .iter()
            .filter(|r| **r > 0)
            .try_fold(0i64, |acc, r| acc.checked_add(*r))
            .ok_or_else(|| {
                format!(
                    "requests {:?} of pod {}/{} overflow",
                    requests, pod.namespace, pod.name
                )
            })?;
        if total <= 0 {
            return Ok(());
        }
        let disks = hp_node.allocatable_disks();
        if can_node_match(&requests, &disks) {
            return Ok(());
        }
        Err(format!(
            "node {} can not hold requests {:?} with allocatable disks {:?}",
            node.name, requests, disks
        ))
    }
}
