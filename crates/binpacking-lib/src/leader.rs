//! Lease-based leader election
//!
//! Exactly one replica holds the `coordination.k8s.io/v1` Lease at a time.
//! The holder renews it every retry period. Other replicas take it over once
//! the lease record has gone unchanged for `leaseDurationSeconds`, timed by
//! their own clock so skew between nodes cannot expire a live lease. The
//! outcome is published through [`LeadershipState`], which scrapes read
//! without locking.

use crate::error::LeaderElectionError;
use crate::health::{components, HealthRegistry};
use crate::observability::{ExporterMetrics, StructuredLogger};
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::PostParams;
use kube::{Api, Client};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const SERVICE_ACCOUNT_NAMESPACE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";
const HOSTNAME_FILE: &str = "/etc/hostname";

/// Shared "am I the leader" flag
///
/// Written only by the elector, read by any number of concurrent scrapes.
#[derive(Debug, Clone, Default)]
pub struct LeadershipState(Arc<AtomicBool>);

impl LeadershipState {
    /// Starts as standby.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_leader(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Store a new value, returning the previous one.
    pub fn set(&self, leader: bool) -> bool {
        self.0.swap(leader, Ordering::AcqRel)
    }
}

/// Lease lock settings
#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    pub lease_name: String,
    pub lease_namespace: String,
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl LeaderElectionConfig {
    pub fn validate(&self) -> Result<(), LeaderElectionError> {
        if self.lease_duration <= self.renew_deadline {
            return Err(LeaderElectionError::Timing(
                "lease duration must be greater than renew deadline".to_string(),
            ));
        }
        if self.retry_period.is_zero() || self.renew_deadline <= self.retry_period {
            return Err(LeaderElectionError::Timing(
                "renew deadline must be greater than a non-zero retry period".to_string(),
            ));
        }
        Ok(())
    }
}

/// Resolve the lease namespace: explicit value, else the service account's.
pub fn detect_namespace(explicit: Option<&str>) -> Result<String, LeaderElectionError> {
    detect_namespace_from(explicit, Path::new(SERVICE_ACCOUNT_NAMESPACE))
}

fn detect_namespace_from(explicit: Option<&str>, path: &Path) -> Result<String, LeaderElectionError> {
    if let Some(ns) = explicit.map(str::trim).filter(|ns| !ns.is_empty()) {
        return Ok(ns.to_string());
    }
    let ns = std::fs::read_to_string(path).map_err(|e| {
        LeaderElectionError::Namespace(format!(
            "no namespace given and {} unreadable: {e}",
            path.display()
        ))
    })?;
    let ns = ns.trim();
    if ns.is_empty() {
        return Err(LeaderElectionError::Namespace(format!(
            "{} is empty",
            path.display()
        )));
    }
    Ok(ns.to_string())
}

/// Resolve this replica's identity: explicit value, else the hostname.
pub fn detect_identity(explicit: Option<&str>) -> Result<String, LeaderElectionError> {
    explicit
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.trim().is_empty()))
        .or_else(|| {
            std::fs::read_to_string(HOSTNAME_FILE)
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .ok_or(LeaderElectionError::Identity)
}

/// What to do with the lease on this round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseAction {
    /// No lease exists yet
    Create,
    /// We hold it
    Renew,
    /// Held by nobody, or the holder let it expire
    Acquire,
    /// Someone else holds a live lease
    Follow { holder: String },
}

/// Fields whose change proves the holder is alive
#[derive(Debug, Clone, PartialEq)]
struct LeaseRecord {
    holder: Option<String>,
    acquire_time: Option<DateTime<Utc>>,
    renew_time: Option<DateTime<Utc>>,
    lease_transitions: Option<i32>,
    resource_version: Option<String>,
}

impl LeaseRecord {
    fn of(lease: Option<&Lease>) -> Option<Self> {
        let lease = lease?;
        let spec = lease.spec.as_ref();
        Some(Self {
            holder: spec.and_then(|s| s.holder_identity.clone()),
            acquire_time: spec.and_then(|s| s.acquire_time.as_ref()).map(|t| t.0),
            renew_time: spec.and_then(|s| s.renew_time.as_ref()).map(|t| t.0),
            lease_transitions: spec.and_then(|s| s.lease_transitions),
            resource_version: lease.metadata.resource_version.clone(),
        })
    }
}

/// Remembers when the lease record last changed, by the local clock
#[derive(Debug, Default)]
pub struct LeaseObserver {
    last: Option<(LeaseRecord, Instant)>,
}

impl LeaseObserver {
    /// How long `lease` has gone unchanged as of `now`; zero on any change.
    pub fn observe(&mut self, lease: Option<&Lease>, now: Instant) -> Duration {
        let Some(record) = LeaseRecord::of(lease) else {
            self.last = None;
            return Duration::ZERO;
        };
        match &self.last {
            Some((seen, at)) if *seen == record => now.saturating_duration_since(*at),
            _ => {
                self.last = Some((record, now));
                Duration::ZERO
            }
        }
    }
}

/// Decide the next step from the current lease state.
///
/// `unchanged_for` is how long this replica has seen the same lease record
/// (see [`LeaseObserver`]); a foreign holder has expired once that exceeds
/// the lease duration.
pub fn decide(lease: Option<&Lease>, identity: &str, unchanged_for: Duration) -> LeaseAction {
    let Some(spec) = lease.and_then(|l| l.spec.as_ref()) else {
        return if lease.is_some() {
            LeaseAction::Acquire
        } else {
            LeaseAction::Create
        };
    };

    let holder = spec.holder_identity.as_deref().unwrap_or_default();
    if holder.is_empty() {
        return LeaseAction::Acquire;
    }
    if holder == identity {
        return LeaseAction::Renew;
    }

    let duration = Duration::from_secs(spec.lease_duration_seconds.unwrap_or(0).max(0) as u64);
    if unchanged_for > duration {
        LeaseAction::Acquire
    } else {
        LeaseAction::Follow {
            holder: holder.to_string(),
        }
    }
}

/// Result of one election round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// We hold the lease after this round
    Held,
    /// Someone else does, or we lost a write race
    NotHeld,
    /// The API call failed; the lease state is unknown
    Failed,
}

/// Leadership after a round.
///
/// A failed round keeps an existing leader only while its last successful
/// renewal is within `renew_deadline`.
pub fn leadership_after(
    outcome: RoundOutcome,
    was_leader: bool,
    since_last_renew: Option<Duration>,
    renew_deadline: Duration,
) -> bool {
    match outcome {
        RoundOutcome::Held => true,
        RoundOutcome::NotHeld => false,
        RoundOutcome::Failed => {
            was_leader && since_last_renew.is_some_and(|elapsed| elapsed <= renew_deadline)
        }
    }
}

/// Map a lease write to a round result; a 409 conflict means another replica
/// wrote between our read and write.
fn write_outcome<T>(result: Result<T, kube::Error>) -> Result<bool, LeaderElectionError> {
    match result {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(resp)) if resp.code == 409 => {
            debug!("lost lease update race");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// Clear the holder of a lease we hold so a standby can take it at once.
///
/// Returns false, leaving the lease untouched, if `identity` is not the holder.
fn release_lease(lease: &mut Lease, identity: &str, now: DateTime<Utc>) -> bool {
    let held = lease
        .spec
        .as_ref()
        .and_then(|s| s.holder_identity.as_deref())
        == Some(identity);
    if !held {
        return false;
    }

    let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
    spec.holder_identity = None;
    spec.lease_duration_seconds = Some(1);
    spec.renew_time = Some(MicroTime(now));
    true
}

/// Participates in the election and publishes the result
pub struct LeaderElector {
    api: Api<Lease>,
    config: LeaderElectionConfig,
    state: LeadershipState,
    metrics: Option<ExporterMetrics>,
    health: Option<HealthRegistry>,
    logger: StructuredLogger,
    observer: LeaseObserver,
}

impl LeaderElector {
    pub fn new(
        client: Client,
        config: LeaderElectionConfig,
        state: LeadershipState,
        logger: StructuredLogger,
    ) -> Self {
        let api = Api::namespaced(client, &config.lease_namespace);
        Self {
            api,
            config,
            state,
            metrics: None,
            health: None,
            logger,
            observer: LeaseObserver::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: ExporterMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Report round failures as a degraded `leader_election` component
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Run until shutdown, releasing the lease on the way out if held.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            lease = %self.config.lease_name,
            namespace = %self.config.lease_namespace,
            identity = %self.config.identity,
            "starting leader election"
        );

        let mut ticker = tokio::time::interval(self.config.retry_period);
        let mut last_renew: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = match self.try_acquire_or_renew().await {
                        Ok(true) => RoundOutcome::Held,
                        Ok(false) => RoundOutcome::NotHeld,
                        Err(e) => {
                            warn!(error = %e, lease = %self.config.lease_name, "leader election round failed");
                            if let Some(health) = &self.health {
                                health
                                    .set_degraded(components::LEADER_ELECTION, e.to_string())
                                    .await;
                            }
                            RoundOutcome::Failed
                        }
                    };
                    if outcome != RoundOutcome::Failed {
                        if let Some(health) = &self.health {
                            health.set_healthy(components::LEADER_ELECTION).await;
                        }
                    }

                    let was_leader = self.state.is_leader();
                    let leader = leadership_after(
                        outcome,
                        was_leader,
                        last_renew.map(|t| t.elapsed()),
                        self.config.renew_deadline,
                    );
                    if outcome == RoundOutcome::Held {
                        last_renew = Some(Instant::now());
                    } else if !leader {
                        if was_leader && outcome == RoundOutcome::Failed {
                            warn!("failed to renew lease within renew deadline, stepping down");
                        }
                        last_renew = None;
                    }
                    self.publish(leader);
                }
                _ = shutdown.recv() => {
                    if self.state.is_leader() {
                        if let Err(e) = self.release().await {
                            warn!(error = %e, "failed to release lease");
                        }
                        self.publish(false);
                    }
                    info!("leader election stopped");
                    return;
                }
            }
        }
    }

    fn publish(&self, leader: bool) {
        let previous = self.state.set(leader);
        if previous != leader {
            self.logger
                .log_leadership_change(&self.config.identity, &self.config.lease_name, leader);
            if let Some(metrics) = &self.metrics {
                metrics.inc_leadership_transitions();
            }
        }
    }

    fn lease_duration_seconds(&self) -> i32 {
        i32::try_from(self.config.lease_duration.as_secs()).unwrap_or(i32::MAX)
    }

    /// One election round; `Ok(true)` means we hold the lease afterwards.
    async fn try_acquire_or_renew(&mut self) -> Result<bool, LeaderElectionError> {
        let now = Utc::now();
        let current = self.api.get_opt(&self.config.lease_name).await?;
        let unchanged_for = self.observer.observe(current.as_ref(), Instant::now());
        let action = decide(current.as_ref(), &self.config.identity, unchanged_for);
        debug!(action = ?action, "leader election round");

        let pp = PostParams::default();
        let result = match (action, current) {
            (LeaseAction::Create, _) => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(self.config.lease_name.clone()),
                        namespace: Some(self.config.lease_namespace.clone()),
                        ..Default::default()
                    },
                    spec: Some(LeaseSpec {
                        holder_identity: Some(self.config.identity.clone()),
                        lease_duration_seconds: Some(self.lease_duration_seconds()),
                        acquire_time: Some(MicroTime(now)),
                        renew_time: Some(MicroTime(now)),
                        lease_transitions: Some(0),
                        ..Default::default()
                    }),
                };
                self.api.create(&pp, &lease).await.map(|_| ())
            }
            (LeaseAction::Renew, Some(mut lease)) => {
                let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
                spec.renew_time = Some(MicroTime(now));
                spec.lease_duration_seconds = Some(self.lease_duration_seconds());
                self.api
                    .replace(&self.config.lease_name, &pp, &lease)
                    .await
                    .map(|_| ())
            }
            (LeaseAction::Acquire, Some(mut lease)) => {
                let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
                spec.holder_identity = Some(self.config.identity.clone());
                spec.lease_duration_seconds = Some(self.lease_duration_seconds());
                spec.acquire_time = Some(MicroTime(now));
                spec.renew_time = Some(MicroTime(now));
                spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
                self.api
                    .replace(&self.config.lease_name, &pp, &lease)
                    .await
                    .map(|_| ())
            }
            (LeaseAction::Follow { holder }, _) => {
                debug!(holder = %holder, "lease held by another replica");
                return Ok(false);
            }
            (_, None) => return Ok(false),
        };

        write_outcome(result)
    }

    /// Clear the holder so a standby can take over immediately.
    async fn release(&self) -> Result<(), LeaderElectionError> {
        let Some(mut lease) = self.api.get_opt(&self.config.lease_name).await? else {
            return Ok(());
        };
        if !release_lease(&mut lease, &self.config.identity, Utc::now()) {
            return Ok(());
        }
        self.api
            .replace(&self.config.lease_name, &PostParams::default(), &lease)
            .await?;
        info!(lease = %self.config.lease_name, "released lease");
        Ok(())
    }
}
