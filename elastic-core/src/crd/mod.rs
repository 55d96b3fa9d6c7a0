//! Elastic training CRDs.
//!
//! References:
//! - https://kubernetes.io/docs/tasks/extend-kubernetes/custom-resources/custom-resource-definitions/
//! - https://kubernetes.io/docs/reference/kubectl/jsonpath/

mod job;

use kube::Resource;

pub use job::{ElasticJob, ElasticJobSpec, ElasticJobStatus, ReplicaSpec};

/// A convenience trait built around the fact that all implementors
/// must have the following attributes.
pub trait RequiredMetadata {
    /// The namespace of this object.
    fn namespace(&self) -> &str;

    /// The name of this object.
    fn name(&self) -> &str;

    /// The UID assigned to this object by the API server.
    fn uid(&self) -> &str;
}

impl RequiredMetadata for ElasticJob {
    fn namespace(&self) -> &str {
        self.meta().namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    fn uid(&self) -> &str {
        self.meta().uid.as_deref().unwrap_or_default()
    }
}
