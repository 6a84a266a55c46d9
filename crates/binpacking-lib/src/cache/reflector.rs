//! Watch-based object cache backed by a kube reflector store

use super::{CacheKind, ObjectCache, SyncInfo};
use crate::error::CacheError;
use futures_util::{StreamExt, TryStreamExt};
use kube::runtime::reflector::{self, store::Writer, Store};
use kube::runtime::watcher::{self, watcher, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant};
use tracing::{debug, info, warn};

/// Watcher settings shared by the node and pod caches
#[derive(Debug, Clone)]
pub struct ReflectorConfig {
    /// Full relist interval; zero disables periodic relists
    pub resync_period: Duration,
    /// Objects fetched per list page; zero disables pagination
    pub list_page_size: u32,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            resync_period: Duration::from_secs(30 * 60),
            list_page_size: 500,
        }
    }
}

impl ReflectorConfig {
    fn watcher_config(&self) -> watcher::Config {
        let config = watcher::Config::default();
        if self.list_page_size > 0 {
            config.page_size(self.list_page_size)
        } else {
            watcher::Config {
                page_size: None,
                ..config
            }
        }
    }
}

/// Cache view over a reflector store
pub struct ReflectorCache<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + std::hash::Hash + Clone,
{
    store: Store<K>,
    kind: CacheKind,
    sync_info: Arc<SyncInfo>,
}

impl<K> ObjectCache<K> for ReflectorCache<K>
where
    K: Resource + Clone + Send + Sync + 'static,
    K::DynamicType: Eq + std::hash::Hash + Clone + Send + Sync,
{
    fn list(&self) -> Result<Vec<Arc<K>>, CacheError> {
        Ok(self.store.state())
    }

    fn has_synced(&self) -> bool {
        self.sync_info.is_synced(self.kind)
    }
}

/// Start a watcher task feeding a new store.
///
/// `transform` runs on every object before it is stored. Every full list is
/// recorded in `sync_info` under `kind`, and so is every watch error until
/// the next successful event.
pub fn spawn_reflector<K>(
    api: Api<K>,
    kind: CacheKind,
    config: ReflectorConfig,
    transform: fn(&mut K),
    sync_info: Arc<SyncInfo>,
    shutdown: broadcast::Receiver<()>,
) -> (ReflectorCache<K>, JoinHandle<()>)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone + Send + Sync,
{
    let (store, writer) = reflector::store::<K>();
    let cache = ReflectorCache {
        store,
        kind,
        sync_info: Arc::clone(&sync_info),
    };

    let task = ReflectorTask {
        api,
        kind,
        config,
        transform,
        sync_info,
    };
    let handle = tokio::spawn(task.run(writer, shutdown));

    (cache, handle)
}

struct ReflectorTask<K: Resource + 'static> {
    api: Api<K>,
    kind: CacheKind,
    config: ReflectorConfig,
    transform: fn(&mut K),
    sync_info: Arc<SyncInfo>,
}

impl<K> ReflectorTask<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone + Send + Sync,
{
    async fn run(self, mut writer: Writer<K>, mut shutdown: broadcast::Receiver<()>) {
        let kind = self.kind.as_str();
        info!(
            kind,
            resync_secs = self.config.resync_period.as_secs(),
            page_size = self.config.list_page_size,
            "starting watcher"
        );

        loop {
            let transform = self.transform;
            let mut events = watcher(self.api.clone(), self.config.watcher_config())
                .default_backoff()
                .map_ok(move |event| event.modify(transform))
                .boxed();

            let resync = sleep(self.resync_deadline());
            tokio::pin!(resync);

            loop {
                tokio::select! {
                    event = events.next() => match event {
                        Some(Ok(event)) => apply_event(&mut writer, self.kind, &self.sync_info, event),
                        Some(Err(e)) => {
                            warn!(kind, error = %e, "watch error, retrying");
                            self.sync_info.record_watch_error(self.kind, e.to_string());
                        }
                        None => break,
                    },
                    _ = &mut resync, if !self.config.resync_period.is_zero() => {
                        debug!(kind, "resync period elapsed, relisting");
                        break;
                    }
                    _ = shutdown.recv() => {
                        info!(kind, "stopping watcher");
                        return;
                    }
                }
            }
        }
    }

    fn resync_deadline(&self) -> Duration {
        if self.config.resync_period.is_zero() {
            // Never fires; the select branch is disabled anyway.
            Duration::from_secs(u32::MAX as u64)
        } else {
            self.config.resync_period
        }
    }
}

/// Apply one watcher event to the store and the sync bookkeeping of `kind`.
fn apply_event<K>(writer: &mut Writer<K>, kind: CacheKind, sync_info: &SyncInfo, event: Event<K>)
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + std::hash::Hash + Clone,
{
    writer.apply_watcher_event(&event);

    if sync_info.clear_watch_error(kind) {
        info!(kind = kind.as_str(), "watch recovered");
    }

    match &event {
        Event::Applied(obj) => {
            debug!(kind = kind.as_str(), name = %obj.name_any(), "object applied")
        }
        Event::Deleted(obj) => {
            debug!(kind = kind.as_str(), name = %obj.name_any(), "object deleted")
        }
        Event::Restarted(objs) => {
            if sync_info.record_sync(kind) {
                info!(kind = kind.as_str(), count = objs.len(), "initial list complete");
            } else {
                debug!(kind = kind.as_str(), count = objs.len(), "relist complete");
            }
        }
    }
}

/// Wait until both caches have completed their initial list.
pub async fn wait_for_sync(sync_info: &SyncInfo, timeout: Duration) -> anyhow::Result<()> {
    let start = Instant::now();
    let mut progress = interval(Duration::from_secs(5));
    let mut poll = interval(Duration::from_millis(100));

    // First tick of an interval completes immediately.
    progress.tick().await;

    loop {
        if sync_info.is_ready() {
            info!(
                elapsed_ms = start.elapsed().as_millis() as u64,
                "informer cache synced successfully"
            );
            return Ok(());
        }
        if start.elapsed() >= timeout {
            anyhow::bail!(
                "failed to sync informer caches within {}s",
                timeout.as_secs()
            );
        }

        tokio::select! {
            _ = poll.tick() => {}
            _ = progress.tick() => {
                info!(
                    node_synced = sync_info.node_synced(),
                    pod_synced = sync_info.pod_synced(),
                    elapsed_seconds = start.elapsed().as_secs(),
                    "still waiting for cache sync..."
                );
            }
        }
    }
}
