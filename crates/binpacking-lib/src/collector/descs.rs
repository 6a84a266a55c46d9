//! Metric family descriptors
//!
//! Built once per collector and shared by reference; nothing here is global.

use prometheus::core::Desc;
use prometheus::proto::{Gauge, LabelPair, Metric, MetricFamily, MetricType};
use std::collections::HashMap;

const NODE_LABELS: &[&str] = &["node", "resource"];
const RESOURCE_LABELS: &[&str] = &["resource"];
const GROUP_LABELS: &[&str] = &["label_group", "label_group_value", "resource"];
const GROUP_COUNT_LABELS: &[&str] = &["label_group", "label_group_value"];

/// One gauge family: name, help text and variable label names
pub struct FamilyDesc {
    pub name: &'static str,
    pub help: &'static str,
    pub labels: &'static [&'static str],
    desc: Desc,
}

impl FamilyDesc {
    fn new(name: &'static str, help: &'static str, labels: &'static [&'static str]) -> Self {
        let desc = Desc::new(
            name.to_string(),
            help.to_string(),
            labels.iter().map(|l| l.to_string()).collect(),
            HashMap::new(),
        )
        .expect("valid metric descriptor");

        Self {
            name,
            help,
            labels,
            desc,
        }
    }

    pub fn desc(&self) -> &Desc {
        &self.desc
    }
}

/// All families the bin-packing collector can emit
pub struct MetricDescs {
    pub node_allocated: FamilyDesc,
    pub node_allocatable: FamilyDesc,
    pub node_utilization: FamilyDesc,
    pub cluster_allocated: FamilyDesc,
    pub cluster_allocatable: FamilyDesc,
    pub cluster_utilization: FamilyDesc,
    pub cluster_node_count: FamilyDesc,
    pub group_allocated: FamilyDesc,
    pub group_allocatable: FamilyDesc,
    pub group_utilization: FamilyDesc,
    pub group_node_count: FamilyDesc,
    pub cache_age: FamilyDesc,
    pub leader_status: FamilyDesc,
}

impl Default for MetricDescs {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricDescs {
    pub fn new() -> Self {
        Self {
            node_allocated: FamilyDesc::new(
                "kube_binpacking_node_allocated",
                "Total resource requested by pods on this node",
                NODE_LABELS,
            ),
            node_allocatable: FamilyDesc::new(
                "kube_binpacking_node_allocatable",
                "Total allocatable resource on this node",
                NODE_LABELS,
            ),
            node_utilization: FamilyDesc::new(
                "kube_binpacking_node_utilization_ratio",
                "Ratio of allocated to allocatable (0.0-1.0+)",
                NODE_LABELS,
            ),
            cluster_allocated: FamilyDesc::new(
                "kube_binpacking_cluster_allocated",
                "Cluster-wide total resource requested",
                RESOURCE_LABELS,
            ),
            cluster_allocatable: FamilyDesc::new(
                "kube_binpacking_cluster_allocatable",
                "Cluster-wide total allocatable resource",
                RESOURCE_LABELS,
            ),
            cluster_utilization: FamilyDesc::new(
                "kube_binpacking_cluster_utilization_ratio",
                "Cluster-wide allocation ratio",
                RESOURCE_LABELS,
            ),
            cluster_node_count: FamilyDesc::new(
                "kube_binpacking_cluster_node_count",
                "Total number of nodes in the cluster",
                &[],
            ),
            group_allocated: FamilyDesc::new(
                "kube_binpacking_group_allocated",
                "Total resource requested by pods on nodes in this label group",
                GROUP_LABELS,
            ),
            group_allocatable: FamilyDesc::new(
                "kube_binpacking_group_allocatable",
                "Total allocatable resource on nodes in this label group",
                GROUP_LABELS,
            ),
            group_utilization: FamilyDesc::new(
                "kube_binpacking_group_utilization_ratio",
                "Ratio of allocated to allocatable for nodes in this label group (0.0-1.0+)",
                GROUP_LABELS,
            ),
            group_node_count: FamilyDesc::new(
                "kube_binpacking_group_node_count",
                "Number of nodes in this label group",
                GROUP_COUNT_LABELS,
            ),
            cache_age: FamilyDesc::new(
                "kube_binpacking_cache_age_seconds",
                "Time since last informer cache sync",
                &[],
            ),
            leader_status: FamilyDesc::new(
                "kube_binpacking_leader_status",
                "Whether this instance is the leader (1) or standby (0). Only present when leader election is enabled",
                &[],
            ),
        }
    }
}

/// Accumulates gauge samples into metric families during one scrape
#[derive(Default)]
pub struct FamilySet {
    families: Vec<MetricFamily>,
}

impl FamilySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one gauge sample. `values` pairs with `family.labels` in order.
    pub fn gauge(&mut self, family: &FamilyDesc, value: f64, values: &[&str]) {
        debug_assert_eq!(family.labels.len(), values.len());

        let mut metric = Metric::default();
        for (name, value) in family.labels.iter().zip(values) {
            let mut pair = LabelPair::default();
            pair.set_name(name.to_string());
            pair.set_value(value.to_string());
            metric.mut_label().push(pair);
        }
        let mut gauge = Gauge::default();
        gauge.set_value(value);
        metric.set_gauge(gauge);

        match self.families.iter_mut().find(|f| f.get_name() == family.name) {
            Some(existing) => existing.mut_metric().push(metric),
            None => {
                let mut mf = MetricFamily::default();
                mf.set_name(family.name.to_string());
                mf.set_help(family.help.to_string());
                mf.set_field_type(MetricType::GAUGE);
                mf.mut_metric().push(metric);
                self.families.push(mf);
            }
        }
    }

    /// Total number of samples across all families
    pub fn sample_count(&self) -> usize {
        self.families.iter().map(|f| f.get_metric().len()).sum()
    }

    pub fn into_families(self) -> Vec<MetricFamily> {
        self.families
    }
}
