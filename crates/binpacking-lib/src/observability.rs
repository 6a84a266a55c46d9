//! Observability infrastructure for the exporter itself
//!
//! Provides:
//! - Self-metrics (scrape latency, cache errors, leadership transitions)
//! - Structured lifecycle logging with tracing

use prometheus::{Histogram, HistogramOpts, IntCounter, Opts, Registry};
use std::sync::Arc;
use tracing::{info, warn};

/// Histogram buckets for scrape latency (in seconds)
const SCRAPE_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
];

struct ExporterMetricsInner {
    scrape_duration_seconds: Histogram,
    cache_errors: IntCounter,
    leadership_transitions: IntCounter,
}

/// Exporter self-metrics
///
/// Registered on the registry passed to [`ExporterMetrics::register`], never
/// on the process-global one. Clones share the same underlying metrics.
#[derive(Clone)]
pub struct ExporterMetrics {
    inner: Arc<ExporterMetricsInner>,
}

impl ExporterMetrics {
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        let scrape_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "kube_binpacking_scrape_duration_seconds",
                "Time spent computing bin-packing metrics for one scrape",
            )
            .buckets(SCRAPE_BUCKETS.to_vec()),
        )?;
        let cache_errors = IntCounter::with_opts(Opts::new(
            "kube_binpacking_cache_errors_total",
            "Total number of failed cache list operations during scrapes",
        ))?;
        let leadership_transitions = IntCounter::with_opts(Opts::new(
            "kube_binpacking_leadership_transitions_total",
            "Total number of leader/standby transitions of this replica",
        ))?;

        registry.register(Box::new(scrape_duration_seconds.clone()))?;
        registry.register(Box::new(cache_errors.clone()))?;
        registry.register(Box::new(leadership_transitions.clone()))?;

        Ok(Self {
            inner: Arc::new(ExporterMetricsInner {
                scrape_duration_seconds,
                cache_errors,
                leadership_transitions,
            }),
        })
    }

    pub fn observe_scrape_duration(&self, duration_secs: f64) {
        self.inner.scrape_duration_seconds.observe(duration_secs);
    }

    pub fn inc_cache_errors(&self) {
        self.inner.cache_errors.inc();
    }

    pub fn inc_leadership_transitions(&self) {
        self.inner.leadership_transitions.inc();
    }

    pub fn scrape_count(&self) -> u64 {
        self.inner.scrape_duration_seconds.get_sample_count()
    }

    pub fn cache_errors(&self) -> u64 {
        self.inner.cache_errors.get()
    }

    pub fn leadership_transitions(&self) -> u64 {
        self.inner.leadership_transitions.get()
    }
}

/// Structured logger for exporter lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_startup(&self, version: &str, metrics_addr: &str, leader_election: bool) {
        info!(
            event = "exporter_started",
            instance = %self.instance,
            version = %version,
            metrics_addr = %metrics_addr,
            leader_election = leader_election,
            "Bin-packing exporter started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "exporter_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Bin-packing exporter shutting down"
        );
    }

    pub fn log_cache_synced(&self, nodes: usize, pods: usize, elapsed_ms: u64) {
        info!(
            event = "cache_synced",
            instance = %self.instance,
            nodes = nodes,
            pods = pods,
            elapsed_ms = elapsed_ms,
            "Informer caches synced"
        );
    }

    /// Log a leader/standby transition
    pub fn log_leadership_change(&self, identity: &str, lease: &str, leader: bool) {
        if leader {
            info!(
                event = "leadership_changed",
                instance = %self.instance,
                identity = %identity,
                lease = %lease,
                leader = true,
                "Acquired leadership"
            );
        } else {
            warn!(
                event = "leadership_changed",
                instance = %self.instance,
                identity = %identity,
                lease = %lease,
                leader = false,
                "Lost leadership, now standby"
            );
        }
    }
}
