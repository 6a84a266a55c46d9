//! Liveness and readiness state
//!
//! Cache components are derived from [`SyncInfo`] on every probe: a cache
//! still waiting for its first list, or whose watch is currently failing, is
//! degraded; one whose watch has failed without a single successful event
//! for [`WATCH_STALL_TIMEOUT`] is unhealthy. The leader elector reports its
//! own component after every round.

use crate::cache::{CacheKind, SyncInfo, WatchState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// How long a watch may fail continuously before its cache is unhealthy
pub const WATCH_STALL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Working, but with something to look at
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn with_status(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::with_status(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

/// Body of `/healthz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status wins; no components means healthy.
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        let mut status = ComponentStatus::Healthy;
        for health in components.values() {
            match health.status {
                ComponentStatus::Unhealthy => return ComponentStatus::Unhealthy,
                ComponentStatus::Degraded => status = ComponentStatus::Degraded,
                ComponentStatus::Healthy => {}
            }
        }
        status
    }
}

/// Body of `/readyz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub mod components {
    use crate::cache::CacheKind;

    pub const NODE_CACHE: &str = "node_cache";
    pub const POD_CACHE: &str = "pod_cache";
    pub const LEADER_ELECTION: &str = "leader_election";

    pub fn cache(kind: CacheKind) -> &'static str {
        match kind {
            CacheKind::Nodes => NODE_CACHE,
            CacheKind::Pods => POD_CACHE,
        }
    }
}

/// Health of one cache from its watch state
pub fn cache_health(state: &WatchState) -> ComponentHealth {
    let error = state.last_error.as_deref().unwrap_or("unknown error");
    match state.failing_for {
        Some(failing_for) if failing_for >= WATCH_STALL_TIMEOUT => ComponentHealth::unhealthy(
            format!("watch failing for {}s: {error}", failing_for.as_secs()),
        ),
        Some(_) => ComponentHealth::degraded(format!("watch error: {error}")),
        None if !state.synced => ComponentHealth::degraded("waiting for initial list"),
        None => ComponentHealth::healthy(),
    }
}

/// Component health and readiness shared with the HTTP probes
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a component, initially healthy
    pub async fn register(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        self.components
            .write()
            .await
            .insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    /// Refresh both cache components and readiness from `sync_info`.
    pub async fn observe_sync(&self, sync_info: &SyncInfo) {
        for kind in CacheKind::ALL {
            let health = cache_health(&sync_info.watch_state(kind));
            self.update(components::cache(kind), health).await;
        }
        *self.ready.write().await = sync_info.is_ready();
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    /// Ready once both caches synced, unless a component is unhealthy
    pub async fn readiness(&self) -> ReadinessResponse {
        let reason = if !*self.ready.read().await {
            Some("Informer caches not yet synced")
        } else if self.health().await.status == ComponentStatus::Unhealthy {
            Some("Critical component unhealthy")
        } else {
            None
        };

        ReadinessResponse {
            ready: reason.is_none(),
            reason: reason.map(str::to_string),
        }
    }
}
