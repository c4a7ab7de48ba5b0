use crate::types::PodInfo;
use async_trait::async_trait;
use hostpath_lib::{HostPathResult, HostPathVolume};
use log::debug;

/// Cluster access the scheduler strategies need.
#[async_trait]
pub trait HostPathController: Send + Sync {
    async fn get_pod(&self, name: &str, namespace: &str) -> HostPathResult<Option<PodInfo>>;

    /// The volume bound to `claim`, if the claim is bound at all.
    async fn get_volume_by_claim(
        &self,
        claim: &str,
        namespace: &str,
    ) -> HostPathResult<Option<HostPathVolume>>;

    /// Records `node` as the bind node of the volume.
    async fn bind_volume(&self, volume_name: &str, node: &str) -> HostPathResult<()>;

    async fn bind_pod(&self, pod: &PodInfo, node: &str) -> HostPathResult<()>;
}

/// A claim of the pod together with the volume it resolved to.
#[derive(Debug, Clone)]
pub struct ClaimVolume {
    pub claim: String,
    pub volume: Option<HostPathVolume>,
}

/// Looks up every claim of `pod` once, so per-node checks run without I/O.
pub async fn resolve_claims(
    controller: &dyn HostPathController,
    pod: &PodInfo,
) -> HostPathResult<Vec<ClaimVolume>> {
    let mut resolved = Vec::with_capacity(pod.claims.len());
    for claim in pod.claims.iter() {
        let volume = controller.get_volume_by_claim(claim, &pod.namespace).await?;
        if volume.is_none() {
            debug!("claim {}/{} has no volume, perhaps it is not bound", pod.namespace, claim);
        }
        resolved.push(ClaimVolume {
            claim: claim.clone(),
            volume,
        });
    }
    Ok(resolved)
}

pub fn has_hostpath_claims(claims: &[ClaimVolume]) -> bool {
    claims
        .iter()
        .any(|c| c.volume.as_ref().map_or(false, |v| v.is_hostpath))
}
