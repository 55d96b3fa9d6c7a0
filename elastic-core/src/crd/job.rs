//! ElasticJob CRD.
//!
//! The code here is used to generate the actual CRD used in K8s.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PodTemplateSpec;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// CRD spec for the ElasticJob resource.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, CustomResource, JsonSchema)]
#[kube(
    status = "ElasticJobStatus",
    group = "elastic.iml.github.io",
    version = "v1alpha1",
    kind = "ElasticJob",
    namespaced,
    derive = "PartialEq",
    shortname = "elasticjob",
    printcolumn = r#"{"name":"Strategy","type":"string","jsonPath":".spec.distributionStrategy"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ElasticJobSpec {
    /// The distribution strategy of the job, e.g. `ParameterServerStrategy` or `AllreduceStrategy`.
    #[serde(default)]
    pub distribution_strategy: Option<String>,
    /// The replica spec of each role of the job, keyed by role name (`worker`, `ps`, `chief`, `evaluator`).
    #[serde(default)]
    pub replica_specs: BTreeMap<String, ReplicaSpec>,
}

/// The spec of one replica group of an ElasticJob.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSpec {
    /// The number of replicas initially requested for this role.
    #[serde(default)]
    pub replicas: Option<u32>,
    /// The number of times a failed pod of this role may be relaunched.
    #[serde(default)]
    pub restart_count: Option<u32>,
    /// The priority class of the pods of this role.
    #[serde(default)]
    pub priority: Option<String>,
    /// The lower bound for scaling this role.
    #[serde(default)]
    pub min_replicas: Option<u32>,
    /// The upper bound for scaling this role.
    #[serde(default)]
    pub max_replicas: Option<u32>,
    /// The pod template used for the pods of this role.
    #[serde(default)]
    pub template: PodTemplateSpec,
}

/// CRD status object.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, JsonSchema)]
pub struct ElasticJobStatus {
    /// The current phase of the job.
    #[serde(default)]
    pub phase: Option<String>,
}
