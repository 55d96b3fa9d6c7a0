//! Cluster access.
//!
//! Everything the master does to the cluster goes through the `ClusterClient` trait, which is
//! constructed once at startup & handed to the controllers which need it.

mod k8s;
#[cfg(test)]
mod k8s_test;
mod scaler;

use std::sync::Arc;

use anyhow::Result;
use arc_swap::ArcSwap;
use k8s_openapi::api::core::v1::Pod;
use serde::Serialize;

use elastic_core::node::{JobParams, NodeType};
pub use k8s::{build_pod, node_from_pod, KubeClusterClient, PodSettings};
pub use scaler::{plan_scaling, ScalerCtl};

/// The job's node parameters, shared between the scaler & the HTTP server.
pub type SharedJobParams = Arc<ArcSwap<JobParams>>;

/// The lifecycle phase of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodePhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl NodePhase {
    /// Map a K8s pod phase.
    pub fn from_pod_phase(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => Self::Pending,
            Some("Running") => Self::Running,
            Some("Succeeded") => Self::Succeeded,
            Some("Failed") => Self::Failed,
            _ => Self::Unknown,
        }
    }

    /// Whether the node is scheduled or running.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

/// A node of the job, as observed in the cluster.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NodeInfo {
    /// The pod name, which is also the worker ID used in the task protocol.
    pub name: String,
    pub role: NodeType,
    /// The rank of the node within its role.
    pub index: u32,
    pub phase: NodePhase,
}

/// A client of the cluster hosting the job.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    /// List the nodes of the job.
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>>;

    /// Create the given pod.
    async fn create_pod(&self, pod: &Pod) -> Result<()>;

    /// Delete the pod of the given name. Deleting an absent pod is not an error.
    async fn delete_pod(&self, name: &str) -> Result<()>;
}
