use anyhow::{Context, Result};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use super::k8s::{ENV_MASTER_ADDR, ENV_WORKER_ID};
use super::*;
use crate::fixtures;
use elastic_core::node::{JobParams, NodeType, Placement};
use elastic_core::{LABEL_JOB_NAME, LABEL_REPLICA_INDEX, LABEL_REPLICA_TYPE};

#[test]
fn node_from_pod_reads_labels_and_phase() -> Result<()> {
    let node = node_from_pod(&fixtures::pod(NodeType::Worker, 2, "Running")).context("expected a node")?;

    assert_eq!(node.name, "elasticjob-sample-worker-2");
    assert_eq!((node.role, node.index, node.phase), (NodeType::Worker, 2, NodePhase::Running), "unexpected node {:?}", node);

    let pending = node_from_pod(&fixtures::pod(NodeType::Ps, 0, "Pending")).context("expected a node")?;
    assert!(pending.phase.is_live(), "expected pending pods to be live");
    let failed = node_from_pod(&fixtures::pod(NodeType::Ps, 0, "Failed")).context("expected a node")?;
    assert!(!failed.phase.is_live(), "expected failed pods not to be live");
    Ok(())
}

#[test]
fn node_from_pod_skips_unlabeled_pods() {
    let mut unknown_role = fixtures::pod(NodeType::Worker, 0, "Running");
    if let Some(labels) = unknown_role.metadata.labels.as_mut() {
        labels.insert(LABEL_REPLICA_TYPE.into(), "sidecar".into());
    }
    let mut no_index = fixtures::pod(NodeType::Worker, 0, "Running");
    if let Some(labels) = no_index.metadata.labels.as_mut() {
        labels.remove(LABEL_REPLICA_INDEX);
    }
    let mut no_labels = fixtures::pod(NodeType::Worker, 0, "Running");
    no_labels.metadata.labels = None;

    for pod in [unknown_role, no_index, no_labels] {
        assert!(node_from_pod(&pod).is_none(), "expected pod {:?} to be skipped", pod.metadata);
    }
}

#[test]
fn build_pod_applies_group_settings() -> Result<()> {
    let job = fixtures::elastic_job()?;
    let params = JobParams::from_elastic_job(&job)?;
    let ps = params.node_params.get(&NodeType::Ps).context("expected ps node group")?;

    let pod = build_pod(&job, ps, 2, &fixtures::pod_settings())?;

    assert_eq!(pod.metadata.name.as_deref(), Some("elasticjob-sample-ps-2"));
    assert_eq!(pod.metadata.namespace.as_deref(), Some("default"));
    let labels = pod.metadata.labels.clone().unwrap_or_default();
    assert_eq!(labels.get(LABEL_JOB_NAME).map(String::as_str), Some("elasticjob-sample"));
    assert_eq!(labels.get(LABEL_REPLICA_TYPE).map(String::as_str), Some("ps"));
    assert_eq!(labels.get(LABEL_REPLICA_INDEX).map(String::as_str), Some("2"));
    let annotations = pod.metadata.annotations.clone().unwrap_or_default();
    assert_eq!(annotations.get("sidecar.istio.io/inject").map(String::as_str), Some("false"), "expected template annotations to be kept");
    let owners = pod.metadata.owner_references.clone().unwrap_or_default();
    assert_eq!(owners.len(), 1, "expected the job to own the pod, got {:?}", owners);
    assert_eq!(owners[0].uid, "11111");

    let spec = pod.spec.context("expected a pod spec")?;
    assert_eq!(spec.priority_class_name.as_deref(), Some("high"));
    assert_eq!(ps.placement, Placement::All);
    assert!(
        spec.affinity.and_then(|affinity| affinity.pod_anti_affinity).is_some(),
        "expected ps pods to be spread across machines"
    );
    let container = spec.containers.first().context("expected a container")?;
    let requests = container.resources.as_ref().and_then(|res| res.requests.clone()).unwrap_or_default();
    assert_eq!(requests.get("cpu"), Some(&Quantity("1".into())));
    assert_eq!(requests.get("memory"), Some(&Quantity("4096Mi".into())));
    let env = container.env.clone().unwrap_or_default();
    let worker_id = env.iter().find(|var| var.name == ENV_WORKER_ID).and_then(|var| var.value.clone());
    assert_eq!(worker_id.as_deref(), Some("elasticjob-sample-ps-2"), "expected the pod name as worker ID");
    let master = env.iter().find(|var| var.name == ENV_MASTER_ADDR).and_then(|var| var.value.clone());
    assert_eq!(master, Some(fixtures::pod_settings().master_addr));
    Ok(())
}

#[test]
fn build_pod_fails_for_missing_role() -> Result<()> {
    let job = fixtures::elastic_job()?;
    let mut params = JobParams::from_elastic_job(&job)?;
    let mut evaluator = params.node_params.remove(&NodeType::Worker).context("expected worker node group")?;
    evaluator.role = NodeType::Evaluator;

    let res = build_pod(&job, &evaluator, 0, &fixtures::pod_settings());

    assert!(res.is_err(), "expected building a pod of a role without template to fail");
    Ok(())
}

#[test]
fn build_pod_resolves_every_parsed_role() -> Result<()> {
    let job = fixtures::elastic_job()?;
    let params = JobParams::from_elastic_job(&job)?;
    assert!(!params.node_params.is_empty(), "expected the sample job to declare node groups");

    for (role, group) in params.node_params.iter() {
        let pod = build_pod(&job, group, 0, &fixtures::pod_settings()).with_context(|| format!("building pod for role {}", role.as_str()))?;
        let labels = pod.metadata.labels.unwrap_or_default();
        assert_eq!(
            labels.get(LABEL_REPLICA_TYPE).map(String::as_str),
            Some(role.as_str()),
            "expected pod of role {} to carry its replica type label",
            role.as_str()
        );
    }
    Ok(())
}
