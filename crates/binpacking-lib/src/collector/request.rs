//! Effective pod resource requests
//!
//! The scheduler reserves, for each resource, the larger of the sum of the
//! regular container requests and the largest single init container request.
//! Init containers run one at a time before the regular containers start, so
//! the two phases never hold their reservations at the same time.

use crate::quantity::resource_value;
use k8s_openapi::api::core::v1::{Container, Pod};

/// Breakdown of how an effective request was derived
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodRequestDetails {
    pub regular_sum: f64,
    pub init_max: f64,
    pub effective: f64,
    /// Regular containers declaring a request for the resource
    pub container_count: usize,
    /// Init containers declaring a request for the resource
    pub init_container_count: usize,
    pub init_max_container: Option<String>,
    pub used_init: bool,
}

fn container_request(container: &Container, resource: &str) -> Option<f64> {
    let requests = container.resources.as_ref()?.requests.as_ref();
    resource_value(requests, resource)
}

/// Compute the amount of `resource` a pod reserves on its node.
pub fn calculate_pod_request(pod: &Pod, resource: &str) -> (f64, PodRequestDetails) {
    let mut details = PodRequestDetails::default();
    let Some(spec) = pod.spec.as_ref() else {
        return (0.0, details);
    };

    for container in &spec.containers {
        if let Some(value) = container_request(container, resource) {
            details.regular_sum += value;
            details.container_count += 1;
        }
    }

    for container in spec.init_containers.iter().flatten() {
        if let Some(value) = container_request(container, resource) {
            if value > details.init_max {
                details.init_max = value;
                details.init_max_container = Some(container.name.clone());
            }
            details.init_container_count += 1;
        }
    }

    // Strict comparison: a tie stays on the regular-container branch.
    if details.init_max > details.regular_sum {
        details.effective = details.init_max;
        details.used_init = true;
    } else {
        details.effective = details.regular_sum;
    }

    (details.effective, details)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::test_support::{make_container, make_pod};

    fn float_eq(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_regular_containers_only() {
        let pod = make_pod(
            "default",
            "web",
            "node-1",
            "Running",
            vec![
                make_container("app", "100m", "128Mi"),
                make_container("sidecar", "50m", "64Mi"),
            ],
            vec![],
        );

        let (value, details) = calculate_pod_request(&pod, "cpu");
        assert!(float_eq(value, 0.15));
        assert!(!details.used_init);
        assert_eq!(details.container_count, 2);
        assert_eq!(details.init_container_count, 0);
    }

    #[test]
    fn test_init_container_dominates() {
        let pod = make_pod(
            "default",
            "web",
            "node-1",
            "Running",
            vec![make_container("app", "100m", "128Mi")],
            vec![make_container("init-setup", "500m", "256Mi")],
        );

        let (value, details) = calculate_pod_request(&pod, "cpu");
        assert!(float_eq(value, 0.5));
        assert!(details.used_init);
        assert_eq!(details.init_max_container.as_deref(), Some("init-setup"));
        assert!(float_eq(details.regular_sum, 0.1));
    }

    #[test]
    fn test_regular_containers_dominate() {
        let pod = make_pod(
            "default",
            "web",
            "node-1",
            "Running",
            vec![
                make_container("app", "200m", "256Mi"),
                make_container("sidecar", "300m", "128Mi"),
            ],
            vec![make_container("init-setup", "100m", "64Mi")],
        );

        let (value, details) = calculate_pod_request(&pod, "cpu");
        assert!(float_eq(value, 0.5));
        assert!(!details.used_init);
    }

    #[test]
    fn test_tie_resolves_to_regular() {
        let pod = make_pod(
            "default",
            "web",
            "node-1",
            "Running",
            vec![make_container("app", "1", "1Gi")],
            vec![make_container("init", "1", "1Gi")],
        );

        let (value, details) = calculate_pod_request(&pod, "cpu");
        assert!(float_eq(value, 1.0));
        assert!(!details.used_init);
    }

    #[test]
    fn test_max_of_multiple_init_containers() {
        let pod = make_pod(
            "default",
            "web",
            "node-1",
            "Running",
            vec![make_container("app", "100m", "128Mi")],
            vec![
                make_container("init-1", "200m", "256Mi"),
                make_container("init-2", "500m", "512Mi"),
                make_container("init-3", "300m", "128Mi"),
            ],
        );

        let (value, details) = calculate_pod_request(&pod, "cpu");
        assert!(float_eq(value, 0.5));
        assert_eq!(details.init_max_container.as_deref(), Some("init-2"));
        assert_eq!(details.init_container_count, 3);
    }

    #[test]
    fn test_missing_requests_count_as_zero() {
        let pod = make_pod(
            "default",
            "web",
            "node-1",
            "Running",
            vec![
                make_container("app", "100m", "128Mi"),
                make_container("no-request", "", ""),
                make_container("sidecar", "50m", "64Mi"),
            ],
            vec![],
        );

        let (value, details) = calculate_pod_request(&pod, "cpu");
        assert!(float_eq(value, 0.15));
        assert_eq!(details.container_count, 2);
    }

    #[test]
    fn test_memory_and_unknown_resources() {
        let pod = make_pod(
            "default",
            "web",
            "node-1",
            "Running",
            vec![
                make_container("app", "100m", "256Mi"),
                make_container("sidecar", "50m", "128Mi"),
            ],
            vec![],
        );

        let (memory, _) = calculate_pod_request(&pod, "memory");
        assert_eq!(memory, 402_653_184.0);

        let (gpu, details) = calculate_pod_request(&pod, "nvidia.com/gpu");
        assert_eq!(gpu, 0.0);
        assert_eq!(details.container_count, 0);
    }

    #[test]
    fn test_pod_without_spec() {
        let (value, details) = calculate_pod_request(&Pod::default(), "cpu");
        assert_eq!(value, 0.0);
        assert_eq!(details, PodRequestDetails::default());
    }
}
