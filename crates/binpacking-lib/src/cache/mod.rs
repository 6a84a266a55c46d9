//! Read-only object caches for nodes and pods
//!
//! The bin-packing engine never talks to the API server. It reads whatever
//! the caches currently hold through [`ObjectCache`], which any mirror of the
//! cluster state can implement. [`ReflectorCache`] is the watch-based one.

mod reflector;
mod strip;

pub use reflector::{spawn_reflector, wait_for_sync, ReflectorCache, ReflectorConfig};
pub use strip::{strip_node, strip_pod};

use crate::error::CacheError;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Synchronous, non-blocking view of a cached collection
pub trait ObjectCache<K>: Send + Sync {
    /// Everything currently cached
    fn list(&self) -> Result<Vec<Arc<K>>, CacheError>;

    /// Whether the initial full load has completed
    fn has_synced(&self) -> bool;
}

/// The two cached collections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    Nodes,
    Pods,
}

impl CacheKind {
    pub const ALL: [CacheKind; 2] = [CacheKind::Nodes, CacheKind::Pods];

    pub fn as_str(self) -> &'static str {
        match self {
            CacheKind::Nodes => "nodes",
            CacheKind::Pods => "pods",
        }
    }
}

impl std::fmt::Display for CacheKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sync and watch state of one collection
#[derive(Debug)]
struct KindSync {
    synced: AtomicBool,
    last_sync_millis: AtomicI64,
    /// Start of the current run of watch errors; 0 while the watch is fine
    failing_since_millis: AtomicI64,
    last_error: Mutex<Option<String>>,
}

impl KindSync {
    fn new(now_millis: i64) -> Self {
        Self {
            synced: AtomicBool::new(false),
            last_sync_millis: AtomicI64::new(now_millis),
            failing_since_millis: AtomicI64::new(0),
            last_error: Mutex::new(None),
        }
    }

    fn set_error(&self, error: Option<String>) {
        match self.last_error.lock() {
            Ok(mut guard) => *guard = error,
            Err(poisoned) => *poisoned.into_inner() = error,
        }
    }

    fn error(&self) -> Option<String> {
        match self.last_error.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Point-in-time watch state of one collection
#[derive(Debug, Clone, PartialEq)]
pub struct WatchState {
    pub synced: bool,
    /// How long the watch has been failing without a successful event
    pub failing_for: Option<Duration>,
    pub last_error: Option<String>,
}

/// Shared cache synchronization state
///
/// Each collection tracks its own last full list, so one healthy watcher
/// cannot mask a stale one: [`SyncInfo::age_seconds`] reports the older.
#[derive(Debug)]
pub struct SyncInfo {
    nodes: KindSync,
    pods: KindSync,
    resync_period: Duration,
}

impl SyncInfo {
    pub fn new(resync_period: Duration) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            nodes: KindSync::new(now),
            pods: KindSync::new(now),
            resync_period,
        }
    }

    /// Sync state with a fixed last-sync time, both kinds marked synced
    pub fn synced_at(last_sync: DateTime<Utc>, resync_period: Duration) -> Self {
        let info = Self::new(resync_period);
        for kind in CacheKind::ALL {
            let state = info.kind(kind);
            state
                .last_sync_millis
                .store(last_sync.timestamp_millis(), Ordering::Release);
            state.synced.store(true, Ordering::Release);
        }
        info
    }

    fn kind(&self, kind: CacheKind) -> &KindSync {
        match kind {
            CacheKind::Nodes => &self.nodes,
            CacheKind::Pods => &self.pods,
        }
    }

    /// Record that a full list of `kind` completed now.
    ///
    /// Returns true if this was the initial list.
    pub fn record_sync(&self, kind: CacheKind) -> bool {
        let state = self.kind(kind);
        state
            .last_sync_millis
            .store(Utc::now().timestamp_millis(), Ordering::Release);
        !state.synced.swap(true, Ordering::AcqRel)
    }

    /// Record a failed watch or list call for `kind`.
    pub fn record_watch_error(&self, kind: CacheKind, error: impl Into<String>) {
        self.record_watch_error_at(kind, error, Utc::now());
    }

    /// Like [`record_watch_error`](Self::record_watch_error) with an explicit
    /// time; only the first error of a run sets the failure start.
    pub fn record_watch_error_at(
        &self,
        kind: CacheKind,
        error: impl Into<String>,
        at: DateTime<Utc>,
    ) {
        let state = self.kind(kind);
        let _ = state.failing_since_millis.compare_exchange(
            0,
            at.timestamp_millis(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        state.set_error(Some(error.into()));
    }

    /// Clear the failure run of `kind` after a successful event.
    ///
    /// Returns true if the watch had been failing.
    pub fn clear_watch_error(&self, kind: CacheKind) -> bool {
        let state = self.kind(kind);
        if state.failing_since_millis.load(Ordering::Acquire) == 0 {
            return false;
        }
        state.failing_since_millis.store(0, Ordering::Release);
        state.set_error(None);
        true
    }

    pub fn watch_state(&self, kind: CacheKind) -> WatchState {
        let state = self.kind(kind);
        let since = state.failing_since_millis.load(Ordering::Acquire);
        let failing_for = (since != 0).then(|| {
            let millis = (Utc::now().timestamp_millis() - since).max(0);
            Duration::from_millis(millis as u64)
        });
        WatchState {
            synced: state.synced.load(Ordering::Acquire),
            failing_for,
            last_error: failing_for.and_then(|_| state.error()),
        }
    }

    /// Last completed full list of `kind`
    pub fn last_sync_of(&self, kind: CacheKind) -> DateTime<Utc> {
        let millis = self.kind(kind).last_sync_millis.load(Ordering::Acquire);
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// The older of the two last full lists
    pub fn last_sync(&self) -> DateTime<Utc> {
        CacheKind::ALL
            .into_iter()
            .map(|kind| self.last_sync_of(kind))
            .min()
            .unwrap_or_else(Utc::now)
    }

    /// Seconds since the stalest cache last completed a full list
    pub fn age_seconds(&self) -> f64 {
        let millis = (Utc::now() - self.last_sync()).num_milliseconds();
        millis.max(0) as f64 / 1000.0
    }

    pub fn resync_period(&self) -> Duration {
        self.resync_period
    }

    pub fn is_synced(&self, kind: CacheKind) -> bool {
        self.kind(kind).synced.load(Ordering::Acquire)
    }

    pub fn node_synced(&self) -> bool {
        self.is_synced(CacheKind::Nodes)
    }

    pub fn pod_synced(&self) -> bool {
        self.is_synced(CacheKind::Pods)
    }

    /// Both caches completed their initial load
    pub fn is_ready(&self) -> bool {
        self.node_synced() && self.pod_synced()
    }

    pub fn status(&self) -> SyncStatus {
        let rfc3339 = |t: DateTime<Utc>| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        SyncStatus {
            last_sync: rfc3339(self.last_sync()),
            sync_age_seconds: self.age_seconds().round(),
            resync_period: format_duration(self.resync_period),
            node_synced: self.node_synced(),
            pod_synced: self.pod_synced(),
            node_last_sync: rfc3339(self.last_sync_of(CacheKind::Nodes)),
            pod_last_sync: rfc3339(self.last_sync_of(CacheKind::Pods)),
        }
    }
}

/// JSON view of [`SyncInfo`]
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub last_sync: String,
    pub sync_age_seconds: f64,
    pub resync_period: String,
    pub node_synced: bool,
    pub pod_synced: bool,
    pub node_last_sync: String,
    pub pod_last_sync: String,
}

/// Render a duration as `1h30m`, `45s`, `500ms` or `0s`.
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let millis = d.subsec_millis();
    if total == 0 {
        return if millis > 0 {
            format!("{millis}ms")
        } else {
            "0s".to_string()
        };
    }

    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    let mut out = String::new();
    if h > 0 {
        out.push_str(&format!("{h}h"));
    }
    if m > 0 {
        out.push_str(&format!("{m}m"));
    }
    if s > 0 || out.is_empty() {
        out.push_str(&format!("{s}s"));
    }
    out
}
