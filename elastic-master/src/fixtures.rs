use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use k8s_openapi::api::core::v1::{Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::cluster::{node_from_pod, ClusterClient, NodeInfo, NodePhase, PodSettings};
use crate::models::{DatasetSpec, StorageType, TaskType};
use crate::speed::{SpeedConfig, SpeedMonitor};
use crate::task::{QueuePolicy, TaskManager};
use elastic_core::crd::ElasticJob;
use elastic_core::node::NodeType;
use elastic_core::{LABEL_JOB_NAME, LABEL_REPLICA_INDEX, LABEL_REPLICA_TYPE};

/// The name of the sample job.
pub const JOB_NAME: &str = "elasticjob-sample";

/// A sample ElasticJob manifest.
pub const JOB_EXAMPLE: &str = r#"
apiVersion: elastic.iml.github.io/v1alpha1
kind: ElasticJob
metadata:
  name: elasticjob-sample
  namespace: default
  uid: "11111"
spec:
  distributionStrategy: ParameterServerStrategy
  replicaSpecs:
    ps:
      restartCount: 3
      replicas: 3
      priority: "high"
      template:
        metadata:
          annotations:
            sidecar.istio.io/inject: "false"
        spec:
          restartPolicy: Never
          containers:
            - name: main
              image: dlrover/elasticjob:iris_estimator
              command: ["python", "-m", "model_zoo.iris.dnn_estimator", "--batch_size=32", "--training_steps=1000"]
              resources:
                requests:
                  cpu: "1"
                  memory: 4096Mi
    chief:
      restartCount: 1
      template:
        metadata:
          annotations:
            sidecar.istio.io/inject: "false"
        spec:
          restartPolicy: Never
          containers:
            - name: main
              image: dlrover/elasticjob:iris_estimator
              command: ["python", "-m", "model_zoo.iris.dnn_estimator", "--batch_size=32", "--training_steps=1000"]
    worker:
      restartCount: 3
      replicas: 3
      maxReplicas: 5
      template:
        metadata:
          annotations:
            sidecar.istio.io/inject: "false"
        spec:
          restartPolicy: Never
          containers:
            - name: main
              image: dlrover/elasticjob:iris_estimator
              command: ["python", "-m", "model_zoo.iris.dnn_estimator", "--batch_size=32", "--training_steps=1000"]
"#;

/// Parse the sample ElasticJob.
pub fn elastic_job() -> Result<ElasticJob> {
    serde_yaml::from_str(JOB_EXAMPLE).context("error parsing sample ElasticJob")
}

/// The pod settings used by tests.
pub fn pod_settings() -> PodSettings {
    PodSettings {
        master_addr: "elasticjob-sample-master.default:7000".into(),
    }
}

/// A training dataset of 1000 records, batch size 10 & 10 minibatches per shard.
pub fn dataset_spec(name: &str) -> DatasetSpec {
    DatasetSpec {
        name: name.into(),
        dataset_size: 1000,
        batch_size: 10,
        num_epochs: 1,
        shuffle: false,
        num_minibatches_per_shard: 10,
        task_type: TaskType::Training,
        storage_type: StorageType::Table,
    }
}

pub fn queue_policy() -> QueuePolicy {
    QueuePolicy {
        task_timeout: Duration::from_secs(60),
        max_task_retries: 3,
    }
}

pub fn speed_config() -> SpeedConfig {
    SpeedConfig {
        window_size: 50,
        window: Duration::from_secs(600),
        min_samples: 6,
        stable_threshold: 0.2,
    }
}

pub fn speed_monitor() -> SpeedMonitor {
    SpeedMonitor::new(speed_config())
}

/// Create a task manager with the `test` dataset registered.
pub fn create_task_manager() -> Result<(TaskManager, Arc<SpeedMonitor>)> {
    let speed = Arc::new(speed_monitor());
    let manager = TaskManager::new(queue_policy(), speed.clone());
    manager.new_dataset(dataset_spec("test"))?;
    Ok((manager, speed))
}

/// Build a labeled pod of the sample job.
pub fn pod(role: NodeType, index: u32, phase: &str) -> Pod {
    let name = format!("{}-{}-{}", JOB_NAME, role, index);
    let labels: BTreeMap<String, String> = maplit::btreemap! {
        LABEL_JOB_NAME.to_string() => JOB_NAME.to_string(),
        LABEL_REPLICA_TYPE.to_string() => role.to_string(),
        LABEL_REPLICA_INDEX.to_string() => index.to_string(),
    };
    Pod {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some("default".into()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: None,
        status: Some(PodStatus {
            phase: Some(phase.into()),
            ..Default::default()
        }),
    }
}

/// An in-memory cluster client.
#[derive(Default)]
pub struct MockClusterClient {
    nodes: Mutex<Vec<NodeInfo>>,
    created: Mutex<Vec<Pod>>,
    deleted: Mutex<Vec<String>>,
    fail_listing: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockClusterClient {
    /// A cluster running 2 ps & 3 workers of the sample job.
    pub fn with_default_nodes() -> Self {
        let client = Self::default();
        let pods = [
            pod(NodeType::Ps, 0, "Running"),
            pod(NodeType::Ps, 1, "Running"),
            pod(NodeType::Worker, 0, "Running"),
            pod(NodeType::Worker, 1, "Running"),
            pod(NodeType::Worker, 2, "Running"),
        ];
        lock(&client.nodes).extend(pods.iter().filter_map(node_from_pod));
        client
    }

    pub fn nodes(&self) -> Vec<NodeInfo> {
        lock(&self.nodes).clone()
    }

    /// Set the phase of the named node.
    pub fn set_phase(&self, name: &str, phase: NodePhase) {
        for node in lock(&self.nodes).iter_mut().filter(|node| node.name == name) {
            node.phase = phase;
        }
    }

    /// Make subsequent listings fail.
    pub fn fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<Pod> {
        lock(&self.created).clone()
    }

    pub fn created_names(&self) -> Vec<String> {
        lock(&self.created).iter().filter_map(|pod| pod.metadata.name.clone()).collect()
    }

    pub fn deleted_names(&self) -> Vec<String> {
        lock(&self.deleted).clone()
    }
}

#[async_trait::async_trait]
impl ClusterClient for MockClusterClient {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        if self.fail_listing.load(Ordering::SeqCst) {
            bail!("cluster API is unavailable");
        }
        Ok(self.nodes())
    }

    async fn create_pod(&self, pod: &Pod) -> Result<()> {
        let mut node = node_from_pod(pod).context("created pod is missing node labels")?;
        node.phase = NodePhase::Running;
        let mut nodes = lock(&self.nodes);
        if nodes.iter().any(|existing| existing.name == node.name) {
            bail!("pod {} already exists", node.name);
        }
        nodes.push(node);
        lock(&self.created).push(pod.clone());
        Ok(())
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        lock(&self.nodes).retain(|node| node.name != name);
        lock(&self.deleted).push(name.into());
        Ok(())
    }
}
