use crate::controller::{has_hostpath_claims, resolve_claims, HostPathController};
use crate::types::{ExtenderArgs, ExtenderNode, HostPriority};
use hostpath_lib::{HostPathError, HostPathResult, NodeUsageInfo};
use log::{debug, warn};
use std::sync::Arc;

pub const DISK_USE_PRIORITIZE: &str = "hostpathpvdiskuse";
/// Score every node gets when the pod has no hostpath volumes.
pub const DEFAULT_NODE_SCORE: i64 = 100;
pub const MAX_NODE_SCORE: i64 = 10;

/// Percentage of the node's quota capacity still unallocated.
pub fn raw_score(usage: Option<&NodeUsageInfo>) -> i64 {
    let usage = match usage {
        Some(v) => v,
        None => return 0,
    };
    let allocated = usage.quota_size.max(0);
    if usage.capacity <= 0 || usage.capacity <= allocated {
        return 0;
    }
    let free = usage.capacity.saturating_sub(allocated);
    (100.0 * free as f64 / usage.capacity as f64) as i64
}

/// Rescales scores into `[0, MAX_NODE_SCORE]` relative to the best one.
pub fn normalize_scores(scores: &mut [HostPriority]) {
    let max = scores.iter().map(|s| s.score).max().unwrap_or(0);
    for score in scores.iter_mut() {
        score.score = if max > 0 {
            (MAX_NODE_SCORE as f64 * (score.score as f64 / max as f64)) as i64
        } else {
            0
        };
    }
}

fn score_node(node: &ExtenderNode) -> HostPriority {
    let score = match node.to_hostpath_node() {
        Ok(hp) => raw_score(hp.usage.as_ref()),
        Err(err) => {
            warn!("decode disk usage of node {} failed: {}", node.name, err);
            0
        }
    };
    HostPriority {
        host: node.name.clone(),
        score,
    }
}

/// Prefers nodes with more unallocated quota capacity.
pub struct DiskUsagePrioritizer {
    controller: Arc<dyn HostPathController>,
}

impl DiskUsagePrioritizer {
    pub fn new(controller: Arc<dyn HostPathController>) -> Self {
        Self { controller }
    }

    pub async fn prioritize(&self, args: &ExtenderArgs) -> HostPathResult<Vec<HostPriority>> {
        let pod = &args.pod;
        let claims = resolve_claims(self.controller.as_ref(), pod).await?;
        if !has_hostpath_claims(&claims) {
            return Ok(args
                .nodes
                .iter()
                .map(|n| HostPriority {
                    host: n.name.clone(),
                    score: DEFAULT_NODE_SCORE,
                })
                .collect());
        }

        let handles = args
            .nodes
            .iter()
            .cloned()
            .map(|node| tokio::spawn(async move { score_node(&node) }))
            .collect::<Vec<_>>();

        let mut scores = Vec::with_capacity(handles.len());
        for joined in futures::future::join_all(handles).await {
            let score = joined
                .map_err(|e| HostPathError::Internal(format!("score node task failed: {}", e)))?;
            scores.push(score);
        }

        normalize_scores(&mut scores);
        for score in scores.iter() {
            debug!(
                "score pod {}/{} on node {}: {}",
                pod.namespace, pod.name, score.host, score.score
            );
        }
        Ok(scores)
    }
}
