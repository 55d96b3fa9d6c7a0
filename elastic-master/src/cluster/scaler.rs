//! Replica reconciliation.
//!
//! The scaler compares the desired replica counts of the job against the pods observed in the
//! cluster, and creates or deletes pods to close the gap. Ranks are dense: new pods fill the
//! lowest free rank, and surplus pods are removed from the highest rank down.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::BroadcastStream;

use super::{build_pod, ClusterClient, NodeInfo, NodePhase, PodSettings, SharedJobParams};
use elastic_core::crd::ElasticJob;
use elastic_core::node::{JobParams, NodeType};

/// The cluster mutations needed to match the desired replica counts.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScalePlan {
    /// The ranks to launch per role.
    pub launch: Vec<(NodeType, u32)>,
    /// Surplus pods to delete.
    pub remove: Vec<String>,
    /// Failed pods to delete so that their rank can be relaunched.
    pub failed: Vec<NodeInfo>,
}

impl ScalePlan {
    pub fn is_empty(&self) -> bool {
        self.launch.is_empty() && self.remove.is_empty() && self.failed.is_empty()
    }
}

/// Plan the mutations which bring the observed nodes in line with the job's desired replica counts.
///
/// Succeeded & failed pods keep their rank & count towards the desired replicas. A failed pod is
/// relaunched at its rank once it has been deleted.
pub fn plan_scaling(params: &JobParams, nodes: &[NodeInfo]) -> ScalePlan {
    let mut plan = ScalePlan::default();
    for (role, node_params) in params.node_params.iter() {
        let desired = node_params.replicas() as usize;
        let mut live: Vec<&NodeInfo> = nodes.iter().filter(|node| node.role == *role && node.phase.is_live()).collect();
        live.sort_by_key(|node| node.index);
        let succeeded = nodes
            .iter()
            .filter(|node| node.role == *role && node.phase == NodePhase::Succeeded)
            .count();
        let blocked: BTreeSet<u32> = nodes.iter().filter(|node| node.role == *role).map(|node| node.index).collect();
        let failed: Vec<NodeInfo> = nodes
            .iter()
            .filter(|node| node.role == *role && node.phase == NodePhase::Failed)
            .cloned()
            .collect();

        // Failed pods hold their rank until they are relaunched.
        let active = live.len() + succeeded + failed.len();
        plan.failed.extend(failed);
        if live.len() > desired.saturating_sub(succeeded) {
            let surplus = live.len() - desired.saturating_sub(succeeded);
            plan.remove.extend(live.iter().rev().take(surplus).map(|node| node.name.clone()));
        } else if active < desired {
            let missing = desired - active;
            plan.launch.extend((0..).filter(|index| !blocked.contains(index)).take(missing).map(|index| (*role, index)));
        }
    }
    plan
}

/// A controller which periodically reconciles the job's pods.
pub struct ScalerCtl {
    client: Arc<dyn ClusterClient>,
    job: Arc<ElasticJob>,
    params: SharedJobParams,
    settings: PodSettings,
    interval: Duration,

    /// The number of relaunches of each pod name.
    relaunches: HashMap<String, u32>,
    /// Failed pods which exhausted their relaunches.
    exhausted: HashSet<String>,

    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl ScalerCtl {
    /// Create a new instance.
    pub fn new(
        client: Arc<dyn ClusterClient>, job: Arc<ElasticJob>, params: SharedJobParams, settings: PodSettings, interval: Duration,
        shutdown_tx: &broadcast::Sender<()>,
    ) -> Self {
        Self {
            client,
            job,
            params,
            settings,
            interval,
            relaunches: Default::default(),
            exhausted: Default::default(),
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::debug!("scaler controller has started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.reconcile().await {
                        tracing::error!(error = ?err, "error reconciling job pods");
                    }
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        tracing::debug!("scaler controller has shutdown");
        Ok(())
    }

    /// Run one reconciliation pass.
    ///
    /// Failures of individual pod mutations are logged, and retried on the next pass.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(crate) async fn reconcile(&mut self) -> Result<()> {
        let nodes = self.client.list_nodes().await.context("error listing job nodes")?;
        let params = self.params.load_full();
        let plan = plan_scaling(&params, &nodes);
        if plan.is_empty() {
            return Ok(());
        }

        for node in plan.failed {
            let node_params = match params.node_params.get(&node.role) {
                Some(node_params) => node_params,
                None => continue,
            };
            let count = self.relaunches.entry(node.name.clone()).or_default();
            if *count >= node_params.max_relaunch_count {
                if self.exhausted.insert(node.name.clone()) {
                    if node_params.critical {
                        tracing::error!(pod = %node.name, role = %node.role, "critical node exhausted its relaunches, job can not recover");
                    } else {
                        tracing::warn!(pod = %node.name, role = %node.role, "node exhausted its relaunches");
                    }
                }
                continue;
            }
            *count += 1;
            let attempt = *count;
            match self.client.delete_pod(&node.name).await {
                Ok(()) => tracing::info!(pod = %node.name, attempt, "deleted failed pod for relaunch"),
                Err(err) => tracing::error!(error = ?err, pod = %node.name, "error deleting failed pod"),
            }
        }

        for name in plan.remove {
            match self.client.delete_pod(&name).await {
                Ok(()) => tracing::info!(pod = %name, "deleted surplus pod"),
                Err(err) => tracing::error!(error = ?err, pod = %name, "error deleting surplus pod"),
            }
        }

        for (role, index) in plan.launch {
            let node_params = match params.node_params.get(&role) {
                Some(node_params) => node_params,
                None => continue,
            };
            let pod = match build_pod(&self.job, node_params, index, &self.settings) {
                Ok(pod) => pod,
                Err(err) => {
                    tracing::error!(error = ?err, %role, index, "error building pod");
                    continue;
                }
            };
            match self.client.create_pod(&pod).await {
                Ok(()) => tracing::info!(pod = ?pod.metadata.name, %role, index, "launched pod"),
                Err(err) => tracing::error!(error = ?err, %role, index, "error launching pod"),
            }
        }
        Ok(())
    }
}
