use crate::*;
use async_trait::async_trait;
use hostpath_lib::{
    encode_annotation, encode_disabled_disks, DiskInfo, HostPathError, HostPathResult,
    HostPathVolume, NodeUsageInfo, GIB, HOSTPATH_NODE_LABEL, NODE_DISABLE_DISKS_ANNOTATION,
    NODE_DISK_INFO_ANNOTATION,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

const NS: &str = "default";

#[derive(Default)]
struct MemState {
    pods: HashMap<String, PodInfo>,
    claims: HashMap<String, String>,
    volumes: HashMap<String, HostPathVolume>,
    bound_pods: Vec<(String, String)>,
    fail_lookup: bool,
    fail_bind_pod: bool,
}

#[derive(Default)]
struct MemController {
    state: Mutex<MemState>,
}

impl MemController {
    fn add_pod(&self, name: &str, claims: &[&str]) -> PodInfo {
        let pod = PodInfo {
            name: name.to_string(),
            namespace: NS.to_string(),
            uid: format!("uid-{}", name),
            claims: claims.iter().map(|c| c.to_string()).collect(),
        };
        self.state
            .lock()
            .unwrap()
            .pods
            .insert(name.to_string(), pod.clone());
        pod
    }

    fn add_volume(&self, claim: &str, capacity: u64, bind_node: Option<&str>) {
        self.put_volume(
            claim,
            HostPathVolume {
                name: format!("pv-{}", claim),
                is_hostpath: true,
                capacity: capacity as i64,
                bind_node: bind_node.map(|n| n.to_string()),
                ..Default::default()
            },
        );
    }

    fn put_volume(&self, claim: &str, volume: HostPathVolume) {
        let mut state = self.state.lock().unwrap();
        state.claims.insert(claim.to_string(), volume.name.clone());
        state.volumes.insert(volume.name.clone(), volume);
    }

    fn bind_node_of(&self, volume_name: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .volumes
            .get(volume_name)
            .and_then(|v| v.bind_node.clone())
    }

    fn bound_pods(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().bound_pods.clone()
    }
}

#[async_trait]
impl HostPathController for MemController {
    async fn get_pod(&self, name: &str, namespace: &str) -> HostPathResult<Option<PodInfo>> {
        let state = self.state.lock().unwrap();
        Ok(state.pods.get(name).filter(|p| p.namespace == namespace).cloned())
    }

    async fn get_volume_by_claim(
        &self,
        claim: &str,
        _namespace: &str,
    ) -> HostPathResult<Option<HostPathVolume>> {
        let state = self.state.lock().unwrap();
        if state.fail_lookup {
            return Err(HostPathError::IoError("api server unreachable".to_string()));
        }
        Ok(state
            .claims
            .get(claim)
            .and_then(|name| state.volumes.get(name))
            .cloned())
    }

    async fn bind_volume(&self, volume_name: &str, node: &str) -> HostPathResult<()> {
        let mut state = self.state.lock().unwrap();
        let volume = state
            .volumes
            .get_mut(volume_name)
            .ok_or_else(|| HostPathError::NotFound(format!("volume {}", volume_name)))?;
        volume.bind_node = Some(node.to_string());
        Ok(())
    }

    async fn bind_pod(&self, pod: &PodInfo, node: &str) -> HostPathResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_bind_pod {
            return Err(HostPathError::IoError("conflict".to_string()));
        }
        state.bound_pods.push((pod.name.clone(), node.to_string()));
        Ok(())
    }
}

fn hostpath_node(name: &str, disks: &[(&str, u64, bool)], disabled: &[&str]) -> ExtenderNode {
    let mut usage = NodeUsageInfo::default();
    for (mount, allocatable, is_disabled) in disks {
        usage.disk_status.push(DiskInfo {
            mount_point: mount.to_string(),
            capacity: (10 * GIB) as i64,
            allocatable: *allocatable as i64,
            quota_size: (10 * GIB - allocatable) as i64,
            disabled: *is_disabled,
            ..Default::default()
        });
        usage.capacity += (10 * GIB) as i64;
        usage.quota_size += (10 * GIB - allocatable) as i64;
    }

    let mut annotations = BTreeMap::new();
    annotations.insert(
        NODE_DISK_INFO_ANNOTATION.to_string(),
        encode_annotation(&usage).unwrap(),
    );
    if !disabled.is_empty() {
        let set = disabled.iter().map(|d| d.to_string()).collect::<BTreeSet<_>>();
        annotations.insert(
            NODE_DISABLE_DISKS_ANNOTATION.to_string(),
            encode_disabled_disks(&set),
        );
    }
    ExtenderNode {
        name: name.to_string(),
        labels: BTreeMap::from([(HOSTPATH_NODE_LABEL.to_string(), "true".to_string())]),
        annotations,
    }
}

fn plain_node(name: &str) -> ExtenderNode {
    ExtenderNode {
        name: name.to_string(),
        ..Default::default()
    }
}

fn args(pod: PodInfo, nodes: Vec<ExtenderNode>) -> ExtenderArgs {
    ExtenderArgs { pod, nodes }
}

fn passed(result: &ExtenderFilterResult) -> Vec<&str> {
    result.nodes.iter().map(|n| n.name.as_str()).collect()
}

#[test]
fn test_can_node_match() {
    let (req4, req2, req6) = (4 * GIB as i64, 2 * GIB as i64, 6 * GIB as i64);
    let disks = [5 * GIB as i64, 3 * GIB as i64];
    assert!(can_node_match(&[req2, req4], &disks));
    assert!(!can_node_match(&[req6], &disks));
    assert!(can_node_match(&[], &[]));
    assert!(!can_node_match(&[1], &[]));
    // the second request goes back to the first disk
    assert!(can_node_match(&[3, 1, 1], &[4, 1]));
    assert!(!can_node_match(&[3, 3], &[4, 2]));
}

#[test]
fn test_can_node_match_extreme_values() {
    assert!(can_node_match(&[i64::MAX, -1], &[i64::MAX]));
    assert!(can_node_match(&[i64::MIN, 0], &[]));
    assert!(!can_node_match(&[i64::MIN, 3], &[2]));
    assert!(!can_node_match(&[i64::MAX, 1], &[i64::MAX]));
    assert!(!can_node_match(&[1], &[i64::MIN, -1]));
}

#[tokio::test]
async fn test_filter_overflowing_requests() {
    let controller = Arc::new(MemController::default());
    for claim in ["a", "b"] {
        controller.put_volume(
            claim,
            HostPathVolume {
                name: format!("pv-{}", claim),
                is_hostpath: true,
                capacity: i64::MAX / 2 + 1,
                ..Default::default()
            },
        );
    }
    let pod = controller.add_pod("web-0", &["a", "b"]);
    let predicate = DiskPressurePredicate::new(controller.clone());

    let nodes = vec![hostpath_node("n1", &[("/xfs/a", 5 * GIB, false)], &[])];
    let result = predicate
        .filter(DISK_PRESSURE_PREDICATE, &args(pod, nodes))
        .await;
    assert!(result.nodes.is_empty());
    assert!(result.failed_nodes["n1"].contains("overflow"));
}

#[tokio::test]
async fn test_filter_capacity() {
    let controller = Arc::new(MemController::default());
    controller.add_volume("data", 4 * GIB, None);
    controller.add_volume("logs", 2 * GIB, None);
    let pod = controller.add_pod("web-0", &["data", "logs"]);
    let predicate = DiskPressurePredicate::new(controller.clone());

    let nodes = vec![
        hostpath_node("fits", &[("/xfs/a", 5 * GIB, false), ("/xfs/b", 3 * GIB, false)], &[]),
        hostpath_node("small", &[("/xfs/a", 5 * GIB, false), ("/xfs/b", GIB, false)], &[]),
        hostpath_node("flagged", &[("/xfs/a", 5 * GIB, true), ("/xfs/b", 3 * GIB, false)], &[]),
        hostpath_node("annotated", &[("/xfs/a", 5 * GIB, false), ("/xfs/b", 3 * GIB, false)], &["/xfs/a"]),
        plain_node("plain"),
    ];
    let result = predicate
        .filter(DISK_PRESSURE_PREDICATE, &args(pod, nodes))
        .await;
    assert_eq!(passed(&result), vec!["fits"]);
    assert!(result.error.is_empty());
    assert_eq!(result.failed_nodes.len(), 4);
    for reason in result.failed_nodes.values() {
        assert!(reason.starts_with("Predicate hostpathpvdiskpressure failed because "));
    }
    assert!(result.failed_nodes["plain"].contains("not a hostpath node"));
}

#[tokio::test]
async fn test_filter_bound_volumes() {
    let controller = Arc::new(MemController::default());
    controller.add_volume("data", 4 * GIB, Some("node-b"));
    controller.add_volume("logs", 2 * GIB, None);
    let pod = controller.add_pod("web-0", &["data", "logs"]);
    let predicate = DiskPressurePredicate::new(controller.clone());

    let nodes = vec![
        hostpath_node("node-a", &[("/xfs/a", 8 * GIB, false)], &[]),
        hostpath_node("node-b", &[("/xfs/a", 2 * GIB, false)], &[]),
    ];
    let result = predicate
        .filter(DISK_PRESSURE_PREDICATE, &args(pod.clone(), nodes.clone()))
        .await;
    // the bound volume needs no new space on node-b
    assert_eq!(passed(&result), vec!["node-b"]);
    assert!(result.failed_nodes["node-a"].contains("has bind to node node-b"));

    controller.add_volume("logs", 2 * GIB, Some("node-a"));
    let result = predicate
        .filter(DISK_PRESSURE_PREDICATE, &args(pod, nodes))
        .await;
    assert!(result.nodes.is_empty());
    assert_eq!(result.failed_nodes.len(), 2);
}

#[tokio::test]
async fn test_filter_without_hostpath_volumes() {
    let controller = Arc::new(MemController::default());
    controller.put_volume(
        "nfs",
        HostPathVolume {
            name: "pv-nfs".to_string(),
            capacity: (100 * GIB) as i64,
            ..Default::default()
        },
    );
    let pod = controller.add_pod("web-0", &["nfs"]);
    let predicate = DiskPressurePredicate::new(controller.clone());

    let nodes = vec![plain_node("plain"), hostpath_node("hp", &[], &[])];
    let result = predicate
        .filter(DISK_PRESSURE_PREDICATE, &args(pod, nodes.clone()))
        .await;
    assert_eq!(passed(&result), vec!["plain", "hp"]);

    let pod = controller.add_pod("web-1", &["missing"]);
    let result = predicate
        .filter(DISK_PRESSURE_PREDICATE, &args(pod.clone(), nodes.clone()))
        .await;
    assert!(result.nodes.is_empty());
    assert!(result.failed_nodes["hp"].contains("has no volume bound"));

    controller.state.lock().unwrap().fail_lookup = true;
    let result = predicate
        .filter(DISK_PRESSURE_PREDICATE, &args(pod, nodes))
        .await;
    assert!(result.nodes.is_empty());
    assert!(!result.error.is_empty());
}

#[test]
fn test_raw_score() {
    let usage = |capacity: i64, quota_size: i64| NodeUsageInfo {
        capacity,
        quota_size,
        ..Default::default()
    };
    assert_eq!(raw_score(None), 0);
    assert_eq!(raw_score(Some(&usage(100, 20))), 80);
    assert_eq!(raw_score(Some(&usage(100, 100))), 0);
    assert_eq!(raw_score(Some(&usage(100, 150))), 0);
    assert_eq!(raw_score(Some(&usage(0, 0))), 0);
    assert_eq!(raw_score(Some(&usage(3, 0))), 100);
    assert_eq!(raw_score(Some(&usage(100, i64::MIN))), 100);
    assert_eq!(raw_score(Some(&usage(i64::MAX, -1))), 100);
    assert_eq!(raw_score(Some(&usage(i64::MIN, i64::MIN))), 0);
}

#[tokio::test]
async fn test_prioritize_scores() {
    let controller = Arc::new(MemController::default());
    controller.add_volume("data", GIB, None);
    let pod = controller.add_pod("web-0", &["data"]);
    let prioritizer = DiskUsagePrioritizer::new(controller.clone());

    // allocatable 8 of 10, 4 of 10, nothing
    let nodes = vec![
        hostpath_node("roomy", &[("/xfs/a", 8 * GIB, false)], &[]),
        hostpath_node("half", &[("/xfs/a", 4 * GIB, false)], &[]),
        hostpath_node("full", &[("/xfs/a", 0, false)], &[]),
        plain_node("plain"),
    ];
    let scores = prioritizer.prioritize(&args(pod, nodes.clone())).await.unwrap();
    let by_host = scores
        .iter()
        .map(|s| (s.host.as_str(), s.score))
        .collect::<Vec<_>>();
    assert_eq!(by_host, vec![("roomy", 10), ("half", 5), ("full", 0), ("plain", 0)]);

    let pod = controller.add_pod("web-1", &[]);
    let scores = prioritizer.prioritize(&args(pod, nodes)).await.unwrap();
    assert_eq!(scores.len(), 4);
    assert!(scores.iter().all(|s| s.score == DEFAULT_NODE_SCORE));
}

#[test]
fn test_normalize_all_zero() {
    let mut scores = vec![
        HostPriority {
            host: "a".to_string(),
            score: 0,
        },
        HostPriority {
            host: "b".to_string(),
            score: 0,
        },
    ];
    normalize_scores(&mut scores);
    assert!(scores.iter().all(|s| s.score == 0));
}

fn binding(pod: &str, node: &str) -> ExtenderBindingArgs {
    ExtenderBindingArgs {
        pod_name: pod.to_string(),
        pod_namespace: NS.to_string(),
        pod_uid: format!("uid-{}", pod),
        node: node.to_string(),
    }
}

#[tokio::test]
async fn test_bind() {
    let controller = Arc::new(MemController::default());
    controller.add_volume("data", GIB, None);
    controller.add_volume("cache", GIB, Some("node-a"));
    controller.put_volume(
        "scratch",
        HostPathVolume {
            name: "pv-scratch".to_string(),
            is_hostpath: true,
            ephemeral: true,
            capacity: GIB as i64,
            ..Default::default()
        },
    );
    controller.add_pod("web-0", &["data", "cache", "scratch", "unbound-claim"]);
    let binder = HostPathBinder::new(controller.clone());

    let result = binder.bind(&binding("web-0", "node-a")).await;
    assert!(result.is_ok(), "{}", result.error);
    assert_eq!(controller.bind_node_of("pv-data").as_deref(), Some("node-a"));
    assert_eq!(controller.bind_node_of("pv-scratch"), None);
    assert_eq!(
        controller.bound_pods(),
        vec![("web-0".to_string(), "node-a".to_string())]
    );

    let result = binder.bind(&binding("web-0", "node-b")).await;
    assert_eq!(result.error, "pv pv-data has bind to node node-a conflict");
    assert_eq!(controller.bound_pods().len(), 1);
}

#[tokio::test]
async fn test_bind_failures() {
    let controller = Arc::new(MemController::default());
    let binder = HostPathBinder::new(controller.clone());

    let result = binder.bind(&binding("ghost", "node-a")).await;
    assert_eq!(
        result.error,
        "pod default/ghost not found,perhaps it do not use hostpathpv"
    );

    controller.add_pod("web-0", &[]);
    controller.state.lock().unwrap().fail_bind_pod = true;
    let result = binder.bind(&binding("web-0", "node-a")).await;
    assert!(result
        .error
        .starts_with("failed bind pod default/web-0 to node node-a"));
}

#[tokio::test]
async fn test_registry() {
    let controller = Arc::new(MemController::default());
    let mut registry = StrategyRegistry::with_defaults(controller.clone()).unwrap();
    assert_eq!(registry.names(StrategyKind::Predicate), vec![DISK_PRESSURE_PREDICATE]);
    assert_eq!(registry.names(StrategyKind::Prioritize), vec![DISK_USE_PRIORITIZE]);
    assert_eq!(registry.names(StrategyKind::Bind), vec![BIND_STRATEGY]);

    let err = registry
        .register(BIND_STRATEGY, Strategy::Bind(HostPathBinder::new(controller.clone())))
        .unwrap_err();
    assert!(matches!(err, HostPathError::AlreadyExists(_)));
    let err = registry
        .register("", Strategy::Bind(HostPathBinder::new(controller.clone())))
        .unwrap_err();
    assert!(matches!(err, HostPathError::InvalidArgument(_)));

    let pod = controller.add_pod("web-0", &[]);
    let filter_args = args(pod, vec![plain_node("plain")]);
    let result = registry
        .handle_filter(DISK_PRESSURE_PREDICATE, &filter_args)
        .await
        .unwrap();
    assert_eq!(passed(&result), vec!["plain"]);

    let scores = registry
        .handle_prioritize(DISK_USE_PRIORITIZE, &filter_args)
        .await
        .unwrap();
    assert_eq!(scores[0].score, DEFAULT_NODE_SCORE);

    let result = registry
        .handle_bind(BIND_STRATEGY, &binding("web-0", "plain"))
        .await
        .unwrap();
    assert!(result.is_ok());

    assert!(registry
        .handle_filter("nope", &filter_args)
        .await
        .unwrap_err()
        .is_not_found());
    assert!(registry
        .handle_filter(BIND_STRATEGY, &filter_args)
        .await
        .unwrap_err()
        .is_not_found());
}
