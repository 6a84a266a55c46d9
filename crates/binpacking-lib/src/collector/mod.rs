//! Bin-packing metrics collection
//!
//! [`BinpackingCollector`] is a Prometheus collector that computes, on every
//! scrape, how much of each node's allocatable capacity is reserved by pod
//! requests. It reads nodes and pods from [`ObjectCache`]s only, so a scrape
//! never waits on the API server.
//!
//! With leader election enabled, only the leader emits allocation metrics.
//! Standby replicas report the cache age and their leader status and nothing
//! else.

mod aggregate;
mod descs;
mod filter;
mod groups;
mod request;

#[cfg(test)]
pub(crate) mod test_support;
#[cfg(test)]
mod tests;

pub use aggregate::{aggregate, node_allocatable};
pub use descs::{FamilyDesc, FamilySet, MetricDescs};
pub use filter::{admit, Admission, PodIndex};
pub use groups::{
    group_allocations, parse_label_groups, parse_resources, LabelGroup, MISSING_LABEL_VALUE,
};
pub use request::{calculate_pod_request, PodRequestDetails};

use crate::cache::{ObjectCache, SyncInfo};
use crate::error::CacheError;
use crate::leader::LeadershipState;
use crate::models::Snapshot;
use crate::observability::ExporterMetrics;
use anyhow::Result;
use k8s_openapi::api::core::v1::{Node, Pod};
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

/// Settings fixed at startup
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Resource names to track, e.g. `cpu`, `memory`
    pub resources: Vec<String>,
    pub label_groups: Vec<LabelGroup>,
    /// Emit per-node families; off trims cardinality on large clusters
    pub node_metrics: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            resources: vec!["cpu".to_string(), "memory".to_string()],
            label_groups: Vec::new(),
            node_metrics: true,
        }
    }
}

/// Prometheus collector for node bin-packing metrics
pub struct BinpackingCollector {
    nodes: Arc<dyn ObjectCache<Node>>,
    pods: Arc<dyn ObjectCache<Pod>>,
    config: CollectorConfig,
    descs: MetricDescs,
    sync_info: Option<Arc<SyncInfo>>,
    leadership: Option<LeadershipState>,
    metrics: Option<ExporterMetrics>,
}

impl BinpackingCollector {
    pub fn builder(
        nodes: Arc<dyn ObjectCache<Node>>,
        pods: Arc<dyn ObjectCache<Pod>>,
    ) -> BinpackingCollectorBuilder {
        BinpackingCollectorBuilder {
            nodes,
            pods,
            config: CollectorConfig::default(),
            sync_info: None,
            leadership: None,
            metrics: None,
        }
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Compute one allocation snapshot from the current cache contents.
    ///
    /// Fails as a whole if either cache cannot be read or has not finished
    /// its initial list; partial numbers are never returned.
    pub fn snapshot(&self) -> Result<Snapshot, CacheError> {
        if !self.nodes.has_synced() {
            return Err(CacheError::NotSynced { kind: "nodes" });
        }
        if !self.pods.has_synced() {
            return Err(CacheError::NotSynced { kind: "pods" });
        }

        let nodes = self.nodes.list()?;
        let pods = self.pods.list()?;

        let index = PodIndex::build(&pods);
        let (allocations, cluster) = aggregate(&nodes, &index, &self.config.resources);
        let groups = self
            .config
            .label_groups
            .iter()
            .flat_map(|group| group_allocations(group, &allocations))
            .collect();

        Ok(Snapshot {
            resources: self.config.resources.clone(),
            nodes: allocations,
            cluster,
            groups,
            admitted_pods: index.admitted,
            unscheduled_pods: index.unscheduled,
            terminated_pods: index.terminated,
        })
    }

    fn emit(&self, snapshot: &Snapshot, out: &mut FamilySet) {
        let d = &self.descs;

        if self.config.node_metrics {
            for node in &snapshot.nodes {
                for (resource, totals) in snapshot.resources.iter().zip(&node.totals) {
                    let labels = [node.name(), resource.as_str()];
                    out.gauge(&d.node_allocated, totals.allocated, &labels);
                    out.gauge(&d.node_allocatable, totals.allocatable, &labels);
                    out.gauge(&d.node_utilization, totals.ratio(), &labels);
                }
            }
        }

        for (resource, totals) in snapshot.resources.iter().zip(&snapshot.cluster) {
            let labels = [resource.as_str()];
            out.gauge(&d.cluster_allocated, totals.allocated, &labels);
            out.gauge(&d.cluster_allocatable, totals.allocatable, &labels);
            out.gauge(&d.cluster_utilization, totals.ratio(), &labels);
        }
        out.gauge(&d.cluster_node_count, snapshot.node_count() as f64, &[]);

        for group in &snapshot.groups {
            for (resource, totals) in snapshot.resources.iter().zip(&group.totals) {
                let labels = [
                    group.label_group.as_str(),
                    group.label_group_value.as_str(),
                    resource.as_str(),
                ];
                out.gauge(&d.group_allocated, totals.allocated, &labels);
                out.gauge(&d.group_allocatable, totals.allocatable, &labels);
                out.gauge(&d.group_utilization, totals.ratio(), &labels);
            }
            out.gauge(
                &d.group_node_count,
                group.node_count as f64,
                &[group.label_group.as_str(), group.label_group_value.as_str()],
            );
        }
    }
}

impl Collector for BinpackingCollector {
    fn desc(&self) -> Vec<&Desc> {
        let d = &self.descs;
        let mut descs = Vec::new();

        if self.sync_info.is_some() {
            descs.push(d.cache_age.desc());
        }
        if self.leadership.is_some() {
            descs.push(d.leader_status.desc());
        }
        if self.config.node_metrics {
            descs.extend([
                d.node_allocated.desc(),
                d.node_allocatable.desc(),
                d.node_utilization.desc(),
            ]);
        }
        descs.extend([
            d.cluster_allocated.desc(),
            d.cluster_allocatable.desc(),
            d.cluster_utilization.desc(),
            d.cluster_node_count.desc(),
        ]);
        if !self.config.label_groups.is_empty() {
            descs.extend([
                d.group_allocated.desc(),
                d.group_allocatable.desc(),
                d.group_utilization.desc(),
                d.group_node_count.desc(),
            ]);
        }
        descs
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let start = Instant::now();
        let mut out = FamilySet::new();

        if let Some(sync_info) = &self.sync_info {
            out.gauge(&self.descs.cache_age, sync_info.age_seconds(), &[]);
        }

        if let Some(leadership) = &self.leadership {
            let leader = leadership.is_leader();
            out.gauge(
                &self.descs.leader_status,
                if leader { 1.0 } else { 0.0 },
                &[],
            );
            if !leader {
                debug!("standby replica, skipping bin-packing metrics");
                return out.into_families();
            }
        }

        match self.snapshot() {
            Ok(snapshot) => {
                self.emit(&snapshot, &mut out);
                debug!(
                    nodes = snapshot.node_count(),
                    pods = snapshot.admitted_pods,
                    unscheduled = snapshot.unscheduled_pods,
                    terminated = snapshot.terminated_pods,
                    samples = out.sample_count(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    "collected bin-packing metrics"
                );
            }
            Err(CacheError::NotSynced { kind }) => {
                debug!(kind, "cache not synced yet, emitting indicators only");
            }
            Err(e) => {
                error!(error = %e, "failed to read object cache, emitting indicators only");
                if let Some(metrics) = &self.metrics {
                    metrics.inc_cache_errors();
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.observe_scrape_duration(start.elapsed().as_secs_f64());
        }
        out.into_families()
    }
}

/// Builder for [`BinpackingCollector`]
pub struct BinpackingCollectorBuilder {
    nodes: Arc<dyn ObjectCache<Node>>,
    pods: Arc<dyn ObjectCache<Pod>>,
    config: CollectorConfig,
    sync_info: Option<Arc<SyncInfo>>,
    leadership: Option<LeadershipState>,
    metrics: Option<ExporterMetrics>,
}

impl BinpackingCollectorBuilder {
    /// Set the tracked resources
    pub fn resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.resources = resources.into_iter().map(Into::into).collect();
        self
    }

    /// Set the label groups
    pub fn label_groups(mut self, groups: Vec<LabelGroup>) -> Self {
        self.config.label_groups = groups;
        self
    }

    /// Enable or disable per-node families
    pub fn node_metrics(mut self, enabled: bool) -> Self {
        self.config.node_metrics = enabled;
        self
    }

    /// Report cache age from `sync_info`
    pub fn sync_info(mut self, sync_info: Arc<SyncInfo>) -> Self {
        self.sync_info = Some(sync_info);
        self
    }

    /// Gate emission on `leadership`; also enables the leader status gauge
    pub fn leadership(mut self, leadership: LeadershipState) -> Self {
        self.leadership = Some(leadership);
        self
    }

    /// Record scrape latency and cache errors
    pub fn metrics(mut self, metrics: ExporterMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<BinpackingCollector> {
        if self.config.resources.is_empty() {
            anyhow::bail!("at least one resource must be tracked");
        }

        Ok(BinpackingCollector {
            nodes: self.nodes,
            pods: self.pods,
            config: self.config,
            descs: MetricDescs::new(),
            sync_info: self.sync_info,
            leadership: self.leadership,
            metrics: self.metrics,
        })
    }
}
