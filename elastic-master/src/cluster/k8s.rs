use std::collections::BTreeMap;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{
    Affinity, EnvVar, Pod, PodAffinityTerm, PodAntiAffinity, ResourceRequirements, WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::client::Client;
use kube::Resource;
use maplit::btreemap;

use super::{ClusterClient, NodeInfo, NodePhase};
use elastic_core::crd::{ElasticJob, RequiredMetadata};
use elastic_core::node::{NodeParams, NodeType, Placement};
use elastic_core::{LABEL_JOB_NAME, LABEL_REPLICA_INDEX, LABEL_REPLICA_TYPE, LABEL_TRAINING_TASK_INDEX};

/// The env var holding the address of the master's HTTP server.
pub const ENV_MASTER_ADDR: &str = "ELASTIC_MASTER_ADDR";
/// The env var holding the worker ID to use in the task protocol.
pub const ENV_WORKER_ID: &str = "ELASTIC_WORKER_ID";
/// The env var holding the role of the node.
pub const ENV_NODE_TYPE: &str = "ELASTIC_NODE_TYPE";
/// The env var holding the rank of the node within its role.
pub const ENV_NODE_RANK: &str = "ELASTIC_NODE_RANK";
/// The topology key used to spread replicas across machines.
const TOPOLOGY_HOSTNAME: &str = "kubernetes.io/hostname";
/// The resource name used for GPU requests.
const RESOURCE_GPU: &str = "nvidia.com/gpu";

/// A K8s backed cluster client, scoped to the pods of one job.
pub struct KubeClusterClient {
    pods: Api<Pod>,
    job_name: String,
}

impl KubeClusterClient {
    /// Create a new instance.
    pub fn new(client: Client, namespace: &str, job_name: &str) -> Self {
        Self {
            pods: Api::namespaced(client, namespace),
            job_name: job_name.into(),
        }
    }
}

#[async_trait::async_trait]
impl ClusterClient for KubeClusterClient {
    #[tracing::instrument(level = "trace", skip(self))]
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        let params = ListParams::default().labels(&format!("{}={}", LABEL_JOB_NAME, self.job_name));
        let pods = self.pods.list(&params).await.context("error listing pods of job")?;
        Ok(pods.items.iter().filter_map(node_from_pod).collect())
    }

    #[tracing::instrument(level = "debug", skip(self, pod), fields(pod = ?pod.metadata.name))]
    async fn create_pod(&self, pod: &Pod) -> Result<()> {
        self.pods.create(&PostParams::default(), pod).await.context("error creating pod")?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete_pod(&self, name: &str) -> Result<()> {
        match self.pods.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(err) => Err(err).context("error deleting pod"),
        }
    }
}

/// Build the node info of a pod, if the pod carries the labels of a job's node.
pub fn node_from_pod(pod: &Pod) -> Option<NodeInfo> {
    let name = pod.metadata.name.clone()?;
    let labels = pod.metadata.labels.as_ref()?;
    let role: NodeType = match labels.get(LABEL_REPLICA_TYPE)?.parse() {
        Ok(role) => role,
        Err(err) => {
            tracing::warn!(error = ?err, pod = %name, "ignoring pod with unknown replica type");
            return None;
        }
    };
    let index = match labels.get(LABEL_REPLICA_INDEX)?.parse() {
        Ok(index) => index,
        Err(err) => {
            tracing::warn!(error = ?err, pod = %name, "ignoring pod with invalid replica index");
            return None;
        }
    };
    let phase = NodePhase::from_pod_phase(pod.status.as_ref().and_then(|status| status.phase.as_deref()));
    Some(NodeInfo { name, role, index, phase })
}

/// Settings applied to every pod built for a job.
#[derive(Clone, Debug)]
pub struct PodSettings {
    /// The address of the master's HTTP server.
    pub master_addr: String,
}

/// Build the pod of the given rank of a node group from the job's replica template.
pub fn build_pod(job: &ElasticJob, params: &NodeParams, index: u32, settings: &PodSettings) -> Result<Pod> {
    let role = params.role;
    let replica_spec = job
        .spec
        .replica_specs
        .get(role.as_str())
        .with_context(|| format!("job {} has no replica spec for {}", job.name(), role))?;
    let template = &replica_spec.template;
    let mut spec = template
        .spec
        .clone()
        .with_context(|| format!("replica spec {} of job {} has no pod spec", role, job.name()))?;
    let name = format!("{}-{}-{}", job.name(), role, index);

    let mut labels = template.metadata.as_ref().and_then(|meta| meta.labels.clone()).unwrap_or_default();
    labels.extend(btreemap! {
        LABEL_JOB_NAME.to_string() => job.name().to_string(),
        LABEL_REPLICA_TYPE.to_string() => role.to_string(),
        LABEL_REPLICA_INDEX.to_string() => index.to_string(),
        LABEL_TRAINING_TASK_INDEX.to_string() => index.to_string(),
    });

    if !params.group_resource.priority.is_empty() {
        spec.priority_class_name = Some(params.group_resource.priority.clone());
    }
    if params.placement == Placement::All {
        spec.affinity = Some(spread_affinity(job.name(), role));
    }
    let container = spec
        .containers
        .first_mut()
        .with_context(|| format!("replica spec {} of job {} has no containers", role, job.name()))?;
    let requests = resource_requests(params);
    if !requests.is_empty() {
        let resources = container.resources.get_or_insert_with(ResourceRequirements::default);
        resources.requests.get_or_insert_with(BTreeMap::new).extend(requests);
    }
    container.env.get_or_insert_with(Vec::new).extend(vec![
        env_var(ENV_MASTER_ADDR, &settings.master_addr),
        env_var(ENV_WORKER_ID, &name),
        env_var(ENV_NODE_TYPE, role.as_str()),
        env_var(ENV_NODE_RANK, &index.to_string()),
    ]);

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(job.namespace().to_string()),
            labels: Some(labels),
            annotations: template.metadata.as_ref().and_then(|meta| meta.annotations.clone()),
            owner_references: job.controller_owner_ref(&()).map(|owner| vec![owner]),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    })
}

/// The resource requests of a node group, skipping unset resources.
fn resource_requests(params: &NodeParams) -> BTreeMap<String, Quantity> {
    let resource = &params.group_resource.node_resource;
    let mut requests = BTreeMap::new();
    if resource.cpu > 0.0 {
        requests.insert("cpu".to_string(), Quantity(format!("{}", resource.cpu)));
    }
    if resource.memory_mib > 0 {
        requests.insert("memory".to_string(), Quantity(format!("{}Mi", resource.memory_mib)));
    }
    if resource.gpu > 0 {
        requests.insert(RESOURCE_GPU.to_string(), Quantity(resource.gpu.to_string()));
    }
    requests
}

/// An affinity spreading the replicas of a role across machines.
fn spread_affinity(job_name: &str, role: NodeType) -> Affinity {
    let selector = LabelSelector {
        match_labels: Some(btreemap! {
            LABEL_JOB_NAME.to_string() => job_name.to_string(),
            LABEL_REPLICA_TYPE.to_string() => role.to_string(),
        }),
        ..Default::default()
    };
    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![WeightedPodAffinityTerm {
                weight: 100,
                pod_affinity_term: PodAffinityTerm {
                    label_selector: Some(selector),
                    topology_key: TOPOLOGY_HOSTNAME.into(),
                    ..Default::default()
                },
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        value_from: None,
    }
}
