//! Builders and in-memory caches shared by the collector tests

use crate::cache::ObjectCache;
use crate::error::CacheError;
use k8s_openapi::api::core::v1::{
    Container, Node, NodeStatus, Pod, PodSpec, PodStatus, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

fn quantities(cpu: &str, memory: &str) -> BTreeMap<String, Quantity> {
    let mut map = BTreeMap::new();
    if !cpu.is_empty() {
        map.insert("cpu".to_string(), Quantity(cpu.to_string()));
    }
    if !memory.is_empty() {
        map.insert("memory".to_string(), Quantity(memory.to_string()));
    }
    map
}

/// Container requesting `cpu` and `memory`; an empty string omits that request.
pub fn make_container(name: &str, cpu: &str, memory: &str) -> Container {
    let requests = quantities(cpu, memory);
    Container {
        name: name.to_string(),
        resources: (!requests.is_empty()).then(|| ResourceRequirements {
            requests: Some(requests),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Pod bound to `node` (unbound when empty) in `phase`.
pub fn make_pod(
    namespace: &str,
    name: &str,
    node: &str,
    phase: &str,
    containers: Vec<Container>,
    init_containers: Vec<Container>,
) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: (!node.is_empty()).then(|| node.to_string()),
            containers,
            init_containers: (!init_containers.is_empty()).then_some(init_containers),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
    }
}

/// Node with the given allocatable cpu and memory.
pub fn make_node(name: &str, cpu: &str, memory: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: None,
        status: Some(NodeStatus {
            allocatable: Some(quantities(cpu, memory)),
            ..Default::default()
        }),
    }
}

/// 4 CPU / 8Gi node carrying `labels`.
pub fn make_node_with_labels(name: &str, labels: &[(&str, &str)]) -> Node {
    let mut node = make_node(name, "4", "8Gi");
    node.metadata.labels = Some(
        labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    );
    node
}

/// In-memory [`ObjectCache`] whose contents and failure mode tests can flip.
pub struct FakeCache<K> {
    objects: RwLock<Vec<Arc<K>>>,
    fail: RwLock<Option<String>>,
    synced: AtomicBool,
    kind: &'static str,
}

impl<K> FakeCache<K> {
    pub fn new(kind: &'static str, objects: Vec<K>) -> Self {
        Self {
            objects: RwLock::new(objects.into_iter().map(Arc::new).collect()),
            fail: RwLock::new(None),
            synced: AtomicBool::new(true),
            kind,
        }
    }

    pub fn failing(kind: &'static str, message: &str) -> Self {
        let cache = Self::new(kind, Vec::new());
        cache.set_failure(Some(message));
        cache
    }

    pub fn set_failure(&self, message: Option<&str>) {
        *self.fail.write().unwrap() = message.map(str::to_string);
    }

    pub fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::Release);
    }

    pub fn push(&self, object: K) {
        self.objects.write().unwrap().push(Arc::new(object));
    }
}

impl<K: Send + Sync> ObjectCache<K> for FakeCache<K> {
    fn list(&self) -> Result<Vec<Arc<K>>, CacheError> {
        if let Some(message) = self.fail.read().unwrap().as_ref() {
            return Err(CacheError::list(self.kind, message.clone()));
        }
        Ok(self.objects.read().unwrap().clone())
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}
