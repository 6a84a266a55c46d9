//! Trim cached objects down to the fields the engine reads
//!
//! Full pod and node objects carry managed fields, annotations, images,
//! conditions and so on. Only a handful of fields matter for bin-packing.

use k8s_openapi::api::core::v1::{
    Container, Node, NodeStatus, Pod, PodSpec, PodStatus, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

fn strip_container(container: &mut Container) -> Container {
    let requests = container
        .resources
        .as_mut()
        .and_then(|r| r.requests.take());

    Container {
        name: std::mem::take(&mut container.name),
        resources: requests.map(|requests| ResourceRequirements {
            requests: Some(requests),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Keep name, namespace, node name, phase and container requests.
pub fn strip_pod(pod: &mut Pod) {
    let metadata = ObjectMeta {
        name: pod.metadata.name.take(),
        namespace: pod.metadata.namespace.take(),
        resource_version: pod.metadata.resource_version.take(),
        ..Default::default()
    };

    let spec = pod.spec.as_mut().map(|spec| PodSpec {
        node_name: spec.node_name.take(),
        containers: spec.containers.iter_mut().map(strip_container).collect(),
        init_containers: spec
            .init_containers
            .as_mut()
            .map(|c| c.iter_mut().map(strip_container).collect()),
        ..Default::default()
    });

    let status = pod.status.as_mut().map(|status| PodStatus {
        phase: status.phase.take(),
        ..Default::default()
    });

    *pod = Pod {
        metadata,
        spec,
        status,
    };
}

/// Keep name, labels and allocatable resources.
pub fn strip_node(node: &mut Node) {
    let metadata = ObjectMeta {
        name: node.metadata.name.take(),
        labels: node.metadata.labels.take(),
        resource_version: node.metadata.resource_version.take(),
        ..Default::default()
    };

    let status = node.status.as_mut().map(|status| NodeStatus {
        allocatable: status.allocatable.take(),
        ..Default::default()
    });

    *node = Node {
        metadata,
        spec: None,
        status,
    };
}
