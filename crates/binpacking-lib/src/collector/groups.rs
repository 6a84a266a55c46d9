//! Node label-combination grouping
//!
//! A label group is an ordered list of node label keys. Nodes sharing the
//! same values for every key land in the same bucket; a node missing a key
//! is bucketed under [`MISSING_LABEL_VALUE`] for that key.

use crate::models::{GroupAllocation, NodeAllocation, ResourceTotals};
use k8s_openapi::api::core::v1::Node;
use std::collections::HashMap;
use tracing::debug;

/// Placeholder value for a label key the node does not carry
pub const MISSING_LABEL_VALUE: &str = "<none>";

const KEY_SEPARATOR: &str = ",";
const GROUP_SEPARATOR: char = ';';

/// An ordered, non-empty list of label keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelGroup {
    keys: Vec<String>,
}

impl LabelGroup {
    /// Returns `None` when no non-blank key is given.
    pub fn new<I, S>(keys: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys: Vec<String> = keys
            .into_iter()
            .map(|k| k.as_ref().trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        (!keys.is_empty()).then_some(Self { keys })
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// The `label_group` dimension value
    pub fn name(&self) -> String {
        self.keys.join(KEY_SEPARATOR)
    }

    /// The composite bucket key for `node`
    pub fn key_for(&self, node: &Node) -> String {
        let labels = node.metadata.labels.as_ref();
        self.keys
            .iter()
            .map(|key| {
                labels
                    .and_then(|l| l.get(key))
                    .map(String::as_str)
                    .unwrap_or(MISSING_LABEL_VALUE)
            })
            .collect::<Vec<_>>()
            .join(KEY_SEPARATOR)
    }
}

/// Parse `"zone,instance-type;zone"` into label groups.
pub fn parse_label_groups(spec: &str) -> Vec<LabelGroup> {
    spec.split(GROUP_SEPARATOR)
        .filter_map(|group| LabelGroup::new(group.split(KEY_SEPARATOR)))
        .collect()
}

/// Parse a comma-separated resource list, dropping blanks.
pub fn parse_resources(spec: &str) -> Vec<String> {
    spec.split(KEY_SEPARATOR)
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect()
}

/// Re-sum already computed node totals into the buckets of one group.
pub fn group_allocations(group: &LabelGroup, nodes: &[NodeAllocation]) -> Vec<GroupAllocation> {
    let label_group = group.name();
    let mut buckets: HashMap<String, GroupAllocation> = HashMap::new();

    for allocation in nodes {
        let value = group.key_for(&allocation.node);
        let bucket = buckets
            .entry(value.clone())
            .or_insert_with(|| GroupAllocation {
                label_group: label_group.clone(),
                label_group_value: value,
                node_count: 0,
                totals: vec![ResourceTotals::default(); allocation.totals.len()],
            });

        bucket.node_count += 1;
        for (sum, node_totals) in bucket.totals.iter_mut().zip(&allocation.totals) {
            sum.add(node_totals);
        }
    }

    debug!(
        label_group = %label_group,
        group_count = buckets.len(),
        "grouping nodes by label combination"
    );

    buckets.into_values().collect()
}
