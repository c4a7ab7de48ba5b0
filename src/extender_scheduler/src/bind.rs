use crate::controller::HostPathController;
use crate::types::{ExtenderBindingArgs, ExtenderBindingResult};
use log::{debug, info};
use std::sync::Arc;

pub const BIND_STRATEGY: &str = "hostpathpvbind";

/// Commits the scheduling decision: pins unbound hostpath volumes to the
/// chosen node, then binds the pod.
pub struct HostPathBinder {
    controller: Arc<dyn HostPathController>,
}

impl HostPathBinder {
    pub fn new(controller: Arc<dyn HostPathController>) -> Self {
        Self { controller }
    }

    pub async fn bind(&self, args: &ExtenderBindingArgs) -> ExtenderBindingResult {
        let (ns, name, node) = (&args.pod_namespace, &args.pod_name, &args.node);
        debug!("attempt to bind {}/{} to {}", ns, name, node);

        let pod = match self.controller.get_pod(name, ns).await {
            Ok(Some(v)) => v,
            Ok(None) => {
                return ExtenderBindingResult::failed(format!(
                    "pod {}/{} not found,perhaps it do not use hostpathpv",
                    ns, name
                ))
            }
            Err(err) => return ExtenderBindingResult::failed(err.to_string()),
        };

        for claim in pod.claims.iter() {
            let volume = match self.controller.get_volume_by_claim(claim, &pod.namespace).await {
                Ok(Some(v)) => v,
                Ok(None) => {
                    debug!("claim {}/{} has no volume, skip", pod.namespace, claim);
                    continue;
                }
                Err(err) => return ExtenderBindingResult::failed(err.to_string()),
            };
            if !volume.is_hostpath || volume.ephemeral {
                continue;
            }

            if !volume.is_bound() {
                if let Err(err) = self.controller.bind_volume(&volume.name, node).await {
                    return ExtenderBindingResult::failed(err.to_string());
                }
                info!("bind volume {} to node {}", volume.name, node);
            } else if !volume.is_bound_to(node) {
                return ExtenderBindingResult::failed(format!(
                    "pv {} has bind to node {} conflict",
                    volume.name,
                    volume.bind_node.as_deref().unwrap_or_default()
                ));
            }
        }

        if let Err(err) = self.controller.bind_pod(&pod, node).await {
            return ExtenderBindingResult::failed(format!(
                "failed bind pod {}/{} to node {}: {}",
                ns, name, node, err
            ));
        }
        info!("bind pod {}/{} to {}", ns, name, node);
        ExtenderBindingResult::ok()
    }
}
