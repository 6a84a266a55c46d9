//! Collector-level tests
//!
//! These drive [`BinpackingCollector`] through in-memory caches, covering the
//! leadership gate, cache failures and the emitted metric surface without a
//! cluster.

use crate::cache::SyncInfo;
use crate::collector::test_support::{
    make_container, make_node, make_node_with_labels, make_pod, FakeCache,
};
use crate::collector::{parse_label_groups, BinpackingCollector, BinpackingCollectorBuilder};
use crate::leader::LeadershipState;
use crate::observability::ExporterMetrics;
use k8s_openapi::api::core::v1::{Node, Pod};
use prometheus::core::Collector;
use prometheus::proto::MetricFamily;
use std::sync::Arc;
use std::time::Duration;

fn builder(nodes: Vec<Node>, pods: Vec<Pod>) -> BinpackingCollectorBuilder {
    BinpackingCollector::builder(
        Arc::new(FakeCache::new("nodes", nodes)),
        Arc::new(FakeCache::new("pods", pods)),
    )
}

fn running(name: &str, node: &str, cpu: &str, memory: &str) -> Pod {
    make_pod(
        "default",
        name,
        node,
        "Running",
        vec![make_container("app", cpu, memory)],
        vec![],
    )
}

fn total_samples(families: &[MetricFamily]) -> usize {
    families.iter().map(|f| f.get_metric().len()).sum()
}

fn family<'a>(families: &'a [MetricFamily], name: &str) -> Option<&'a MetricFamily> {
    families.iter().find(|f| f.get_name() == name)
}

fn sample(families: &[MetricFamily], name: &str, labels: &[(&str, &str)]) -> Option<f64> {
    family(families, name)?
        .get_metric()
        .iter()
        .find(|m| {
            labels.iter().all(|(k, v)| {
                m.get_label()
                    .iter()
                    .any(|l| l.get_name() == *k && l.get_value() == *v)
            })
        })
        .map(|m| m.get_gauge().get_value())
}

fn float_eq(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

#[cfg(test)]
mod gate_tests {
    use super::*;

    fn one_node_cluster() -> (Vec<Node>, Vec<Pod>) {
        (
            vec![make_node("node-1", "4", "8Gi")],
            vec![running("a", "node-1", "1", "1Gi")],
        )
    }

    #[test]
    fn test_ha_disabled_has_no_leader_status() {
        let (nodes, pods) = one_node_cluster();
        let collector = builder(nodes, pods).resources(["cpu"]).build().unwrap();

        let families = collector.collect();
        assert!(family(&families, "kube_binpacking_leader_status").is_none());
        assert!(family(&families, "kube_binpacking_cache_age_seconds").is_none());
        assert_eq!(
            sample(&families, "kube_binpacking_cluster_allocated", &[("resource", "cpu")]),
            Some(1.0)
        );
    }

    #[test]
    fn test_leader_emits_everything() {
        let (nodes, pods) = one_node_cluster();
        let leadership = LeadershipState::new();
        leadership.set(true);

        let collector = builder(nodes, pods)
            .resources(["cpu"])
            .sync_info(Arc::new(SyncInfo::synced_at(
                chrono::Utc::now(),
                Duration::from_secs(1800),
            )))
            .leadership(leadership)
            .build()
            .unwrap();

        let families = collector.collect();
        assert_eq!(sample(&families, "kube_binpacking_leader_status", &[]), Some(1.0));
        assert!(sample(&families, "kube_binpacking_cache_age_seconds", &[]).is_some());
        assert_eq!(
            sample(
                &families,
                "kube_binpacking_node_allocated",
                &[("node", "node-1"), ("resource", "cpu")]
            ),
            Some(1.0)
        );
        // 2 indicators + 3 node + 3 cluster + node count
        assert_eq!(total_samples(&families), 9);
    }

    #[test]
    fn test_standby_emits_only_indicators() {
        let (nodes, pods) = one_node_cluster();
        let collector = builder(nodes, pods)
            .resources(["cpu"])
            .sync_info(Arc::new(SyncInfo::synced_at(
                chrono::Utc::now(),
                Duration::from_secs(1800),
            )))
            .leadership(LeadershipState::new())
            .build()
            .unwrap();

        let families = collector.collect();
        assert_eq!(total_samples(&families), 2);
        assert_eq!(sample(&families, "kube_binpacking_leader_status", &[]), Some(0.0));
        assert!(sample(&families, "kube_binpacking_cache_age_seconds", &[]).is_some());
    }

    #[test]
    fn test_leadership_flip_is_observed_next_scrape() {
        let (nodes, pods) = one_node_cluster();
        let leadership = LeadershipState::new();
        let collector = builder(nodes, pods)
            .resources(["cpu"])
            .leadership(leadership.clone())
            .build()
            .unwrap();

        assert_eq!(total_samples(&collector.collect()), 1);

        leadership.set(true);
        let families = collector.collect();
        assert_eq!(sample(&families, "kube_binpacking_leader_status", &[]), Some(1.0));
        assert!(family(&families, "kube_binpacking_cluster_node_count").is_some());

        leadership.set(false);
        assert_eq!(total_samples(&collector.collect()), 1);
    }

    #[test]
    fn test_desc_follows_configuration() {
        let (nodes, pods) = one_node_cluster();
        let minimal = builder(nodes.clone(), pods.clone())
            .node_metrics(false)
            .build()
            .unwrap();
        assert_eq!(minimal.desc().len(), 4);

        let full = builder(nodes, pods)
            .label_groups(parse_label_groups("topology.kubernetes.io/zone"))
            .sync_info(Arc::new(SyncInfo::new(Duration::from_secs(60))))
            .leadership(LeadershipState::new())
            .build()
            .unwrap();
        assert_eq!(full.desc().len(), 13);
    }

    #[test]
    fn test_empty_resources_rejected() {
        let (nodes, pods) = one_node_cluster();
        assert!(builder(nodes, pods)
            .resources(Vec::<String>::new())
            .build()
            .is_err());
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;
    use crate::error::CacheError;
    use prometheus::Registry;

    #[test]
    fn test_cache_failure_emits_only_indicators() {
        let registry = Registry::new();
        let metrics = ExporterMetrics::register(&registry).unwrap();
        let leadership = LeadershipState::new();
        leadership.set(true);

        let collector = BinpackingCollector::builder(
            Arc::new(FakeCache::<Node>::failing("nodes", "connection refused")),
            Arc::new(FakeCache::new("pods", vec![running("a", "node-1", "1", "1Gi")])),
        )
        .sync_info(Arc::new(SyncInfo::synced_at(
            chrono::Utc::now(),
            Duration::from_secs(1800),
        )))
        .leadership(leadership)
        .metrics(metrics.clone())
        .build()
        .unwrap();

        let families = collector.collect();
        assert_eq!(total_samples(&families), 2);
        assert!(family(&families, "kube_binpacking_cluster_allocated").is_none());
        assert_eq!(metrics.cache_errors(), 1);
        assert_eq!(metrics.scrape_count(), 1);
    }

    #[test]
    fn test_pod_failure_without_indicators_emits_nothing() {
        let registry = Registry::new();
        let metrics = ExporterMetrics::register(&registry).unwrap();
        let collector = BinpackingCollector::builder(
            Arc::new(FakeCache::new("nodes", vec![make_node("node-1", "4", "8Gi")])),
            Arc::new(FakeCache::<Pod>::failing("pods", "timeout")),
        )
        .metrics(metrics.clone())
        .build()
        .unwrap();

        assert!(collector.collect().is_empty());
        assert_eq!(metrics.cache_errors(), 1);
    }

    #[test]
    fn test_recovers_once_cache_is_readable() {
        let nodes = Arc::new(FakeCache::<Node>::failing("nodes", "boom"));
        let collector = BinpackingCollector::builder(
            nodes.clone(),
            Arc::new(FakeCache::new("pods", vec![running("a", "node-1", "1", "1Gi")])),
        )
        .resources(["cpu"])
        .build()
        .unwrap();

        assert!(matches!(
            collector.snapshot(),
            Err(CacheError::List { kind: "nodes", .. })
        ));

        nodes.set_failure(None);
        nodes.push(make_node("node-1", "4", "8Gi"));
        let snapshot = collector.snapshot().unwrap();
        assert_eq!(snapshot.cluster_totals("cpu").unwrap().allocated, 1.0);
    }

    #[test]
    fn test_unsynced_cache_is_not_reported() {
        let pods = Arc::new(FakeCache::new("pods", vec![running("a", "node-1", "1", "1Gi")]));
        pods.set_synced(false);
        let collector = BinpackingCollector::builder(
            Arc::new(FakeCache::new("nodes", vec![make_node("node-1", "4", "8Gi")])),
            pods.clone(),
        )
        .build()
        .unwrap();

        assert!(matches!(
            collector.snapshot(),
            Err(CacheError::NotSynced { kind: "pods" })
        ));
        assert!(collector.collect().is_empty());

        pods.set_synced(true);
        assert!(collector.snapshot().is_ok());
    }
}

#[cfg(test)]
mod aggregation_tests {
    use super::*;

    #[test]
    fn test_init_container_pushes_node_over_capacity() {
        let pods = Arc::new(FakeCache::new(
            "pods",
            vec![
                running("a", "N1", "1", ""),
                running("b", "N1", "500m", ""),
            ],
        ));
        let collector = BinpackingCollector::builder(
            Arc::new(FakeCache::new("nodes", vec![make_node("N1", "4", "8Gi")])),
            pods.clone(),
        )
        .resources(["cpu"])
        .build()
        .unwrap();

        let totals = collector.snapshot().unwrap().node_totals("N1", "cpu").unwrap();
        assert!(float_eq(totals.allocated, 1.5));
        assert!(float_eq(totals.ratio(), 0.375));

        pods.push(make_pod(
            "default",
            "c",
            "N1",
            "Running",
            vec![make_container("app", "1", "")],
            vec![make_container("init", "3", "")],
        ));

        let families = collector.collect();
        let labels = [("node", "N1"), ("resource", "cpu")];
        let allocated = sample(&families, "kube_binpacking_node_allocated", &labels).unwrap();
        let ratio = sample(&families, "kube_binpacking_node_utilization_ratio", &labels).unwrap();
        assert!(float_eq(allocated, 4.5));
        assert!(float_eq(ratio, 1.125));
    }

    #[test]
    fn test_zero_allocatable_gives_zero_ratio() {
        let collector = builder(
            vec![make_node("cordoned", "", "8Gi")],
            vec![make_pod(
                "default",
                "trainer",
                "cordoned",
                "Pending",
                vec![make_container("app", "2", "1Gi")],
                vec![],
            )],
        )
        .build()
        .unwrap();

        let families = collector.collect();
        let labels = [("node", "cordoned"), ("resource", "cpu")];
        assert_eq!(
            sample(&families, "kube_binpacking_node_allocated", &labels),
            Some(2.0)
        );
        assert_eq!(
            sample(&families, "kube_binpacking_node_allocatable", &labels),
            Some(0.0)
        );
        let ratio = sample(&families, "kube_binpacking_node_utilization_ratio", &labels).unwrap();
        assert_eq!(ratio, 0.0);
        assert!(ratio.is_finite());

        let cluster_ratio = sample(
            &families,
            "kube_binpacking_cluster_utilization_ratio",
            &[("resource", "cpu")],
        )
        .unwrap();
        assert_eq!(cluster_ratio, 0.0);
    }

    #[test]
    fn test_excluded_pods_never_count() {
        let collector = builder(
            vec![make_node("node-1", "4", "8Gi")],
            vec![
                running("live", "node-1", "1", "1Gi"),
                make_pod(
                    "default",
                    "bound-pending",
                    "node-1",
                    "Pending",
                    vec![make_container("app", "500m", "512Mi")],
                    vec![],
                ),
                make_pod(
                    "default",
                    "unbound",
                    "",
                    "Pending",
                    vec![make_container("app", "2", "2Gi")],
                    vec![],
                ),
                make_pod(
                    "default",
                    "done",
                    "node-1",
                    "Succeeded",
                    vec![make_container("app", "2", "2Gi")],
                    vec![],
                ),
                make_pod(
                    "default",
                    "crashed",
                    "node-1",
                    "Failed",
                    vec![make_container("app", "2", "2Gi")],
                    vec![],
                ),
            ],
        )
        .build()
        .unwrap();

        let snapshot = collector.snapshot().unwrap();
        assert_eq!(snapshot.admitted_pods, 2);
        assert_eq!(snapshot.unscheduled_pods, 1);
        assert_eq!(snapshot.terminated_pods, 2);
        assert!(float_eq(snapshot.cluster_totals("cpu").unwrap().allocated, 1.5));
        assert_eq!(
            snapshot.cluster_totals("memory").unwrap().allocated,
            1_610_612_736.0
        );
    }

    #[test]
    fn test_metric_counts() {
        let nodes = vec![make_node("node-1", "4", "8Gi"), make_node("node-2", "8", "16Gi")];
        let pods = vec![
            running("a", "node-1", "1", "1Gi"),
            running("b", "node-2", "2", "2Gi"),
        ];

        let with_nodes = builder(nodes.clone(), pods.clone()).build().unwrap();
        // 3 node families x 2 nodes x 2 resources + 3 cluster families x 2 + node count
        assert_eq!(total_samples(&with_nodes.collect()), 19);

        let without_nodes = builder(nodes, pods).node_metrics(false).build().unwrap();
        let families = without_nodes.collect();
        assert_eq!(total_samples(&families), 7);
        assert!(family(&families, "kube_binpacking_node_allocated").is_none());
        assert_eq!(
            sample(&families, "kube_binpacking_cluster_node_count", &[]),
            Some(2.0)
        );
    }

    #[test]
    fn test_cluster_is_sum_of_nodes() {
        let collector = builder(
            vec![
                make_node("node-1", "4", "8Gi"),
                make_node("node-2", "8", "16Gi"),
                make_node("node-3", "2", "4Gi"),
            ],
            vec![
                running("a", "node-1", "1", "1Gi"),
                running("b", "node-2", "250m", "3Gi"),
                running("c", "node-2", "1500m", "512Mi"),
                running("orphan", "node-gone", "7", "7Gi"),
            ],
        )
        .build()
        .unwrap();

        let snapshot = collector.snapshot().unwrap();
        for (i, resource) in snapshot.resources.iter().enumerate() {
            let sum: f64 = snapshot.nodes.iter().map(|n| n.totals[i].allocated).sum();
            let cluster = snapshot.cluster_totals(resource).unwrap();
            assert!(float_eq(cluster.allocated, sum), "{resource}");
        }
        assert!(float_eq(snapshot.cluster_totals("cpu").unwrap().allocated, 2.75));
    }
}

#[cfg(test)]
mod grouping_tests {
    use super::*;

    const ZONE: &str = "topology.kubernetes.io/zone";
    const INSTANCE_TYPE: &str = "node.kubernetes.io/instance-type";

    fn fleet() -> (Vec<Node>, Vec<Pod>) {
        let nodes = vec![
            make_node_with_labels("a1", &[(ZONE, "us-east-1a"), (INSTANCE_TYPE, "m5.large")]),
            make_node_with_labels("a2", &[(ZONE, "us-east-1a"), (INSTANCE_TYPE, "m5.xlarge")]),
            make_node_with_labels("b1", &[(ZONE, "us-east-1b"), (INSTANCE_TYPE, "m5.large")]),
            make_node_with_labels("bare", &[(INSTANCE_TYPE, "m5.large")]),
        ];
        let pods = vec![
            running("p1", "a1", "1", "1Gi"),
            running("p2", "a2", "2", "2Gi"),
            running("p3", "b1", "500m", "512Mi"),
            running("p4", "bare", "250m", "256Mi"),
        ];
        (nodes, pods)
    }

    #[test]
    fn test_single_key_group() {
        let (nodes, pods) = fleet();
        let collector = builder(nodes, pods)
            .resources(["cpu"])
            .label_groups(parse_label_groups(ZONE))
            .build()
            .unwrap();

        let families = collector.collect();
        let zone_a = [("label_group", ZONE), ("label_group_value", "us-east-1a")];
        assert_eq!(
            sample(&families, "kube_binpacking_group_node_count", &zone_a),
            Some(2.0)
        );
        assert_eq!(
            sample(&families, "kube_binpacking_group_allocated", &zone_a),
            Some(3.0)
        );
        assert_eq!(
            sample(&families, "kube_binpacking_group_allocatable", &zone_a),
            Some(8.0)
        );
        assert_eq!(
            sample(
                &families,
                "kube_binpacking_group_node_count",
                &[("label_group", ZONE), ("label_group_value", "<none>")]
            ),
            Some(1.0)
        );
    }

    #[test]
    fn test_multi_key_group_with_missing_label() {
        let (nodes, pods) = fleet();
        let groups = parse_label_groups(&format!("{ZONE},{INSTANCE_TYPE}"));
        let collector = builder(nodes, pods).label_groups(groups).build().unwrap();

        let snapshot = collector.snapshot().unwrap();
        let name = format!("{ZONE},{INSTANCE_TYPE}");
        assert_eq!(snapshot.groups.len(), 4);

        let bare = snapshot.group(&name, "<none>,m5.large").unwrap();
        assert_eq!(bare.node_count, 1);
        assert!(float_eq(bare.totals[0].allocated, 0.25));
        assert!(snapshot.group(&name, "us-east-1a,m5.xlarge").is_some());
    }

    #[test]
    fn test_groups_partition_the_fleet() {
        let (nodes, pods) = fleet();
        let node_total = nodes.len();
        let collector = builder(nodes, pods)
            .label_groups(parse_label_groups(&format!("{ZONE};{INSTANCE_TYPE}")))
            .build()
            .unwrap();

        let snapshot = collector.snapshot().unwrap();
        for definition in [ZONE, INSTANCE_TYPE] {
            let buckets: Vec<_> = snapshot
                .groups
                .iter()
                .filter(|g| g.label_group == definition)
                .collect();

            let members: usize = buckets.iter().map(|g| g.node_count).sum();
            assert_eq!(members, node_total, "{definition}");

            for (i, resource) in snapshot.resources.iter().enumerate() {
                let sum: f64 = buckets.iter().map(|g| g.totals[i].allocated).sum();
                let cluster = snapshot.cluster_totals(resource).unwrap();
                assert!(float_eq(sum, cluster.allocated), "{definition}/{resource}");
            }
        }

        assert_eq!(
            snapshot.group(INSTANCE_TYPE, "m5.large").unwrap().node_count,
            3
        );
    }
}
