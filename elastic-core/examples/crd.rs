//! A script used to generate the ElasticJob CRD.
//!
//! Any time the CRD spec changes, this script can be run to ensure that the CRD is up-to-date and
//! ready to be synced with the cluster.

use anyhow::{Context, Result};
use elastic_core::crd::ElasticJob;
use kube::CustomResourceExt;

fn main() -> Result<()> {
    let crds_path = std::env::current_dir().context("error getting current dir")?;

    let job = ElasticJob::crd();
    let job_yaml = serde_yaml::to_string(&job).context("error serializing ElasticJob CRD to yaml")?;
    std::fs::write(crds_path.join("elasticjob.yaml"), &job_yaml).with_context(|| format!("error writing ElasticJob CRD to {:?}", &crds_path))?;
    println!("ElasticJob CRD written to {:?}", &crds_path);

    Ok(())
}
