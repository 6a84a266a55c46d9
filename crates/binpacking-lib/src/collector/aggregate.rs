//! Per-node and cluster-wide aggregation

use super::filter::{pod_key, PodIndex};
use super::request::calculate_pod_request;
use crate::models::{NodeAllocation, ResourceTotals};
use crate::quantity::resource_value;
use k8s_openapi::api::core::v1::Node;
use std::sync::Arc;
use tracing::{debug, Level};

/// Allocatable amount of `resource` on `node`, 0 when not reported.
pub fn node_allocatable(node: &Node, resource: &str) -> f64 {
    let allocatable = node.status.as_ref().and_then(|s| s.allocatable.as_ref());
    resource_value(allocatable, resource).unwrap_or(0.0)
}

/// Walk every node once, summing effective requests of its admitted pods.
///
/// Returns the per-node totals and the cluster totals, both indexed like
/// `resources`.
pub fn aggregate(
    nodes: &[Arc<Node>],
    index: &PodIndex,
    resources: &[String],
) -> (Vec<NodeAllocation>, Vec<ResourceTotals>) {
    let debug_enabled = tracing::enabled!(Level::DEBUG);
    let mut cluster = vec![ResourceTotals::default(); resources.len()];
    let mut allocations = Vec::with_capacity(nodes.len());

    for node in nodes {
        let name = node.metadata.name.as_deref().unwrap_or_default();
        let pods = index.pods_on(name);
        debug!(node = %name, pod_count = pods.len(), "processing node");

        let mut totals = Vec::with_capacity(resources.len());
        for (i, resource) in resources.iter().enumerate() {
            let mut allocated = 0.0;
            for pod in pods {
                let (request, details) = calculate_pod_request(pod, resource);
                allocated += request;

                if debug_enabled && request > 0.0 {
                    if details.used_init {
                        debug!(
                            pod = %pod_key(pod),
                            resource = %resource,
                            effective = details.effective,
                            init_max = details.init_max,
                            init_container = details.init_max_container.as_deref().unwrap_or_default(),
                            regular_sum = details.regular_sum,
                            "pod resource request (init container dominates)"
                        );
                    } else {
                        debug!(
                            pod = %pod_key(pod),
                            resource = %resource,
                            effective = details.effective,
                            containers = details.container_count,
                            init_containers = details.init_container_count,
                            "pod resource request"
                        );
                    }
                }
            }

            let node_totals = ResourceTotals {
                allocated,
                allocatable: node_allocatable(node, resource),
            };
            debug!(
                node = %name,
                resource = %resource,
                allocated = node_totals.allocated,
                allocatable = node_totals.allocatable,
                utilization = node_totals.ratio(),
                "node metrics"
            );

            cluster[i].add(&node_totals);
            totals.push(node_totals);
        }

        allocations.push(NodeAllocation {
            node: Arc::clone(node),
            pod_count: pods.len(),
            totals,
        });
    }

    (allocations, cluster)
}
