//! Core data models for bin-packing snapshots

use k8s_openapi::api::core::v1::Node;
use serde::Serialize;
use std::sync::Arc;

/// Allocated vs allocatable amount of one resource
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceTotals {
    pub allocated: f64,
    pub allocatable: f64,
}

impl ResourceTotals {
    /// Allocated / allocatable, defined as 0 when nothing is allocatable.
    pub fn ratio(&self) -> f64 {
        if self.allocatable > 0.0 {
            self.allocated / self.allocatable
        } else {
            0.0
        }
    }

    pub fn add(&mut self, other: &ResourceTotals) {
        self.allocated += other.allocated;
        self.allocatable += other.allocatable;
    }
}

/// Per-node totals, one entry per tracked resource in configuration order
#[derive(Debug, Clone)]
pub struct NodeAllocation {
    pub node: Arc<Node>,
    pub pod_count: usize,
    pub totals: Vec<ResourceTotals>,
}

impl NodeAllocation {
    pub fn name(&self) -> &str {
        self.node.metadata.name.as_deref().unwrap_or_default()
    }
}

/// Totals for one bucket of one label group
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupAllocation {
    /// Label keys of the group definition, comma-joined
    pub label_group: String,
    /// Composite label value shared by every node in the bucket
    pub label_group_value: String,
    pub node_count: usize,
    pub totals: Vec<ResourceTotals>,
}

/// One complete, immutable bin-packing snapshot
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Tracked resources; every `totals` vector is indexed like this one
    pub resources: Vec<String>,
    pub nodes: Vec<NodeAllocation>,
    pub cluster: Vec<ResourceTotals>,
    pub groups: Vec<GroupAllocation>,
    pub admitted_pods: usize,
    pub unscheduled_pods: usize,
    pub terminated_pods: usize,
}

impl Snapshot {
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Fleet totals for a resource by name
    pub fn cluster_totals(&self, resource: &str) -> Option<ResourceTotals> {
        self.resources
            .iter()
            .position(|r| r == resource)
            .and_then(|i| self.cluster.get(i).copied())
    }

    /// Node totals for a resource by node and resource name
    pub fn node_totals(&self, node: &str, resource: &str) -> Option<ResourceTotals> {
        let idx = self.resources.iter().position(|r| r == resource)?;
        self.nodes
            .iter()
            .find(|n| n.name() == node)
            .and_then(|n| n.totals.get(idx).copied())
    }

    /// Group bucket by group name and composite value
    pub fn group(&self, label_group: &str, value: &str) -> Option<&GroupAllocation> {
        self.groups
            .iter()
            .find(|g| g.label_group == label_group && g.label_group_value == value)
    }
}
