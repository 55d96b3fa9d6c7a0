//! Node resource model.
//!
//! The types here describe the desired shape of each node group (role) of a job. They are pure
//! data plus validation: scaling decisions mutate them, and a reconciler reads them to drive the
//! cluster towards the declared target.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};

use crate::crd::{ElasticJob, RequiredMetadata};
use crate::error::AppError;

/// The default number of relaunches allowed for a failed pod.
pub const DEFAULT_MAX_RELAUNCH_COUNT: u32 = 3;
/// The resource name used for GPU requests.
const RESOURCE_GPU: &str = "nvidia.com/gpu";

/// The role of a node within a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Worker,
    Ps,
    Chief,
    Evaluator,
}

impl NodeType {
    /// The canonical name of this role, as used in pod labels and job manifests.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Worker => "worker",
            Self::Ps => "ps",
            Self::Chief => "chief",
            Self::Evaluator => "evaluator",
        }
    }

    /// Whether the job fails when nodes of this role can not be scheduled.
    pub fn is_critical(&self) -> bool {
        !matches!(self, Self::Evaluator)
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for NodeType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "worker" => Ok(Self::Worker),
            "ps" => Ok(Self::Ps),
            "chief" => Ok(Self::Chief),
            "evaluator" => Ok(Self::Evaluator),
            _ => Err(AppError::InvalidInput(format!("unknown node type {}", s))),
        }
    }
}

/// The resources requested by a single replica.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeResource {
    /// CPU cores.
    pub cpu: f64,
    /// Memory in MiB.
    pub memory_mib: u64,
    /// Number of GPUs.
    #[serde(default)]
    pub gpu: u32,
}

impl NodeResource {
    /// Create a new instance without GPUs.
    pub fn new(cpu: f64, memory_mib: u64) -> Self {
        Self { cpu, memory_mib, gpu: 0 }
    }

    /// Build a resource from a K8s container resource request map.
    pub fn from_requests(requests: &BTreeMap<String, Quantity>) -> Result<Self, AppError> {
        let cpu = requests.get("cpu").map(|q| parse_cpu(&q.0)).transpose()?.unwrap_or_default();
        let memory_mib = requests.get("memory").map(|q| parse_memory_mib(&q.0)).transpose()?.unwrap_or_default();
        let gpu = requests
            .get(RESOURCE_GPU)
            .map(|q| q.0.trim().parse::<u32>().map_err(|_| AppError::InvalidInput(format!("invalid gpu quantity {}", q.0))))
            .transpose()?
            .unwrap_or_default();
        Ok(Self { cpu, memory_mib, gpu })
    }
}

/// Parse a K8s CPU quantity (`2`, `1.5`, `500m`) into cores.
pub fn parse_cpu(quantity: &str) -> Result<f64, AppError> {
    let quantity = quantity.trim();
    let err = || AppError::InvalidInput(format!("invalid cpu quantity {}", quantity));
    let cores = match quantity.strip_suffix('m') {
        Some(millis) => millis.parse::<f64>().map_err(|_| err())? / 1000.0,
        None => quantity.parse::<f64>().map_err(|_| err())?,
    };
    if cores < 0.0 || !cores.is_finite() {
        return Err(err());
    }
    Ok(cores)
}

/// Parse a K8s memory quantity (`4096Mi`, `10Gi`, `1G`, `1048576`) into MiB, rounding up.
pub fn parse_memory_mib(quantity: &str) -> Result<u64, AppError> {
    const UNITS: [(&str, u64); 8] = [
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("K", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
    ];
    let quantity = quantity.trim();
    let err = || AppError::InvalidInput(format!("invalid memory quantity {}", quantity));
    let (digits, multiplier) = UNITS
        .iter()
        .find_map(|(suffix, multiplier)| quantity.strip_suffix(suffix).map(|digits| (digits, *multiplier)))
        .unwrap_or((quantity, 1));
    let value = digits.parse::<f64>().map_err(|_| err())?;
    if value < 0.0 || !value.is_finite() {
        return Err(err());
    }
    let bytes = value * multiplier as f64;
    Ok((bytes / (1u64 << 20) as f64).ceil() as u64)
}

/// The desired replicas & per-replica resources of one node group.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeGroupResource {
    /// The desired number of replicas.
    pub count: u32,
    /// The resources of each replica.
    pub node_resource: NodeResource,
    /// The priority class of the replicas.
    pub priority: String,
}

impl NodeGroupResource {
    /// Create a new instance.
    pub fn new(count: u32, node_resource: NodeResource, priority: impl Into<String>) -> Self {
        Self {
            count,
            node_resource,
            priority: priority.into(),
        }
    }
}

/// Placement mode of a node group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Placement {
    /// No placement constraints.
    #[default]
    Default,
    /// Spread the replicas across all nodes of the cluster.
    All,
}

/// The scaling & failure policy of one node group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeParams {
    /// The role of this group.
    pub role: NodeType,
    /// The desired replicas & resources of this group.
    pub group_resource: NodeGroupResource,
    /// Whether the job fails if this group can not be scheduled.
    pub critical: bool,
    /// The number of times a failed replica may be relaunched.
    pub max_relaunch_count: u32,
    /// Lower scaling bound.
    pub min_replicas: u32,
    /// Upper scaling bound.
    pub max_replicas: u32,
    /// Placement mode of the replicas.
    pub placement: Placement,
}

impl NodeParams {
    /// Create a new instance, bounded to exactly its initial replica count.
    pub fn new(role: NodeType, group_resource: NodeGroupResource, critical: bool, max_relaunch_count: u32, placement: Placement) -> Self {
        let count = group_resource.count;
        Self {
            role,
            group_resource,
            critical,
            max_relaunch_count,
            min_replicas: count,
            max_replicas: count,
            placement,
        }
    }

    /// Set the scaling bounds of this group.
    ///
    /// The current replica count must fall within the new bounds.
    pub fn with_bounds(mut self, min_replicas: u32, max_replicas: u32) -> Result<Self, AppError> {
        if min_replicas > max_replicas {
            return Err(AppError::InvalidInput(format!(
                "min replicas {} of {} exceeds max replicas {}",
                min_replicas, self.role, max_replicas
            )));
        }
        let count = self.group_resource.count;
        if count < min_replicas || count > max_replicas {
            return Err(AppError::OutOfBounds {
                role: self.role.to_string(),
                requested: count,
                min: min_replicas,
                max: max_replicas,
            });
        }
        self.min_replicas = min_replicas;
        self.max_replicas = max_replicas;
        Ok(self)
    }

    /// The desired number of replicas.
    pub fn replicas(&self) -> u32 {
        self.group_resource.count
    }

    /// Set the desired number of replicas.
    ///
    /// Requests outside of `[min_replicas, max_replicas]` are rejected and the previous count is retained.
    pub fn scale_to(&mut self, count: u32) -> Result<(), AppError> {
        if count < self.min_replicas || count > self.max_replicas {
            return Err(AppError::OutOfBounds {
                role: self.role.to_string(),
                requested: count,
                min: self.min_replicas,
                max: self.max_replicas,
            });
        }
        self.group_resource.count = count;
        Ok(())
    }
}

/// The parameters of a whole job.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobParams {
    /// The K8s namespace of the job.
    pub namespace: String,
    /// The name of the job.
    pub job_name: String,
    /// The UID of the job's CR.
    pub job_uid: String,
    /// The policy of each node group.
    pub node_params: BTreeMap<NodeType, NodeParams>,
}

impl JobParams {
    /// Create a new instance without node groups.
    pub fn new(namespace: impl Into<String>, job_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            job_name: job_name.into(),
            ..Default::default()
        }
    }

    /// Build the job parameters from an ElasticJob CR.
    pub fn from_elastic_job(job: &ElasticJob) -> Result<Self, AppError> {
        let mut params = Self::new(job.namespace(), job.name());
        params.job_uid = job.uid().to_string();
        for (role_name, spec) in job.spec.replica_specs.iter() {
            let role: NodeType = role_name.parse()?;
            let replicas = spec.replicas.unwrap_or(1);
            let requests = spec
                .template
                .spec
                .as_ref()
                .and_then(|pod| pod.containers.first())
                .and_then(|container| container.resources.as_ref())
                .and_then(|resources| resources.requests.as_ref());
            let node_resource = match requests {
                Some(requests) => NodeResource::from_requests(requests)?,
                None => NodeResource::default(),
            };
            let group = NodeGroupResource::new(replicas, node_resource, spec.priority.clone().unwrap_or_default());
            let placement = if role == NodeType::Ps { Placement::All } else { Placement::Default };
            let (min_default, max_default) = match role {
                NodeType::Worker => (replicas.min(1), replicas),
                _ => (replicas, replicas),
            };
            let node_params = NodeParams::new(
                role,
                group,
                role.is_critical(),
                spec.restart_count.unwrap_or(DEFAULT_MAX_RELAUNCH_COUNT),
                placement,
            )
            .with_bounds(spec.min_replicas.unwrap_or(min_default), spec.max_replicas.unwrap_or(max_default))?;
            params.node_params.insert(role, node_params);
        }
        Ok(params)
    }

    /// Scale the given role to the given replica count.
    pub fn scale_to(&mut self, role: NodeType, count: u32) -> Result<(), AppError> {
        self.node_params
            .get_mut(&role)
            .ok_or_else(|| AppError::InvalidInput(format!("job {} has no {} node group", self.job_name, role)))?
            .scale_to(count)
    }

    /// The desired replica count of the given role, 0 if the role is absent.
    pub fn replicas(&self, role: NodeType) -> u32 {
        self.node_params.get(&role).map(NodeParams::replicas).unwrap_or_default()
    }
}
