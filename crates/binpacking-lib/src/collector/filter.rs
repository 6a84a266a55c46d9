//! Pod admission filtering
//!
//! A pod counts toward a node's allocation once it is bound to the node and
//! until it reaches a terminal phase. Pending pods that are already bound
//! hold a reservation from the scheduler's point of view, so they count.

use k8s_openapi::api::core::v1::Pod;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

const PHASE_SUCCEEDED: &str = "Succeeded";
const PHASE_FAILED: &str = "Failed";

/// Outcome of the admission check for a single pod
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Included,
    Unscheduled,
    Terminated,
}

/// `namespace/name` for log fields
pub(crate) fn pod_key(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.metadata.namespace.as_deref().unwrap_or_default(),
        pod.metadata.name.as_deref().unwrap_or_default()
    )
}

fn node_name(pod: &Pod) -> Option<&str> {
    pod.spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .filter(|n| !n.is_empty())
}

fn phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.phase.as_deref())
}

/// Decide whether a pod counts toward allocation totals.
pub fn admit(pod: &Pod) -> Admission {
    if node_name(pod).is_none() {
        return Admission::Unscheduled;
    }
    match phase(pod) {
        Some(PHASE_SUCCEEDED) | Some(PHASE_FAILED) => Admission::Terminated,
        _ => Admission::Included,
    }
}

/// Admitted pods indexed by the node they are bound to
#[derive(Debug, Default)]
pub struct PodIndex {
    by_node: HashMap<String, Vec<Arc<Pod>>>,
    pub admitted: usize,
    pub unscheduled: usize,
    pub terminated: usize,
}

impl PodIndex {
    /// Filter `pods` once and group the survivors by node name.
    pub fn build(pods: &[Arc<Pod>]) -> Self {
        let mut index = PodIndex::default();

        for pod in pods {
            match admit(pod) {
                Admission::Unscheduled => {
                    index.unscheduled += 1;
                    debug!(pod = %pod_key(pod), "skipping unscheduled pod");
                }
                Admission::Terminated => {
                    index.terminated += 1;
                    debug!(
                        pod = %pod_key(pod),
                        phase = phase(pod).unwrap_or_default(),
                        "skipping terminated pod"
                    );
                }
                Admission::Included => {
                    if let Some(node) = node_name(pod) {
                        index.admitted += 1;
                        index
                            .by_node
                            .entry(node.to_string())
                            .or_default()
                            .push(Arc::clone(pod));
                    }
                }
            }
        }

        if index.unscheduled > 0 || index.terminated > 0 {
            debug!(
                unscheduled = index.unscheduled,
                terminated = index.terminated,
                "filtered pods"
            );
        }

        index
    }

    /// Pods bound to `node`; empty for unknown nodes.
    pub fn pods_on(&self, node: &str) -> &[Arc<Pod>] {
        self.by_node.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of distinct node names referenced by admitted pods
    pub fn node_count(&self) -> usize {
        self.by_node.len()
    }
}
