//! Kube Binpacking Exporter - cluster bin-packing efficiency metrics
//!
//! Runs as a Deployment, watches nodes and pods, and serves per-node,
//! cluster-wide and label-group allocation metrics to Prometheus.

use anyhow::{Context, Result};
use binpacking_lib::{
    cache::{spawn_reflector, strip_node, strip_pod, wait_for_sync, ObjectCache, ReflectorConfig},
    CacheKind,
    health::{components, HealthRegistry},
    leader::{detect_identity, detect_namespace, LeaderElectionConfig, LeaderElector},
    BinpackingCollector, ExporterMetrics, LeadershipState, StructuredLogger, SyncInfo,
};
use clap::Parser;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client};
use kube_binpacking_exporter::{
    api,
    config::{Cli, ExporterConfig, LogFormat, Settings},
};
use prometheus::Registry;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const EXPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");
const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(120);
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = ExporterConfig::load(&cli)?.settings()?;

    init_tracing(&settings);
    info!(version = EXPORTER_VERSION, "Starting kube-binpacking-exporter");

    if let Err(e) = run(settings).await {
        error!(error = ?e, "exporter failed");
        return Err(e);
    }
    Ok(())
}

fn init_tracing(settings: &Settings) {
    // RUST_LOG wins over --log-level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    match settings.log_format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Text => registry.with(fmt::layer()).init(),
    }
}

async fn kube_client(kubeconfig: Option<&Path>) -> Result<Client> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("Failed to read kubeconfig {}", path.display()))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("Failed to load kubeconfig")?
        }
        None => kube::Config::infer()
            .await
            .context("Failed to infer Kubernetes client configuration")?,
    };

    let client = Client::try_from(config).context("Failed to build Kubernetes client")?;
    let version = client
        .apiserver_version()
        .await
        .context("Failed to reach Kubernetes API server")?;
    info!(server_version = %version.git_version, "Connected to Kubernetes API server");

    Ok(client)
}

async fn run(settings: Settings) -> Result<()> {
    let client = kube_client(settings.kubeconfig.as_deref()).await?;
    let (shutdown_tx, _) = broadcast::channel::<()>(4);

    // Caches
    let sync_info = Arc::new(SyncInfo::new(settings.resync_period));
    let reflector_config = ReflectorConfig {
        resync_period: settings.resync_period,
        list_page_size: settings.list_page_size,
    };
    let (node_cache, node_task) = spawn_reflector(
        Api::<Node>::all(client.clone()),
        CacheKind::Nodes,
        reflector_config.clone(),
        strip_node,
        Arc::clone(&sync_info),
        shutdown_tx.subscribe(),
    );
    let (pod_cache, pod_task) = spawn_reflector(
        Api::<Pod>::all(client.clone()),
        CacheKind::Pods,
        reflector_config,
        strip_pod,
        Arc::clone(&sync_info),
        shutdown_tx.subscribe(),
    );
    let node_cache = Arc::new(node_cache);
    let pod_cache = Arc::new(pod_cache);

    // Health
    let health_registry = HealthRegistry::new();
    health_registry.observe_sync(&sync_info).await;

    // Metrics
    let registry = Registry::new();
    let metrics = ExporterMetrics::register(&registry)?;

    let identity = settings
        .leader_election
        .as_ref()
        .map(|le| detect_identity(le.identity.as_deref()))
        .transpose()?;
    let logger = StructuredLogger::new(
        identity
            .clone()
            .or_else(|| detect_identity(None).ok())
            .unwrap_or_else(|| "kube-binpacking-exporter".to_string()),
    );

    let mut collector = BinpackingCollector::builder(node_cache.clone(), pod_cache.clone())
        .resources(settings.resources.clone())
        .label_groups(settings.label_groups.clone())
        .node_metrics(settings.node_metrics)
        .sync_info(Arc::clone(&sync_info))
        .metrics(metrics.clone());

    // Leader election
    let mut elector_task = None;
    if let (Some(le), Some(identity)) = (settings.leader_election.as_ref(), identity) {
        let config = LeaderElectionConfig {
            lease_name: le.lease_name.clone(),
            lease_namespace: detect_namespace(le.namespace.as_deref())?,
            identity,
            lease_duration: le.lease_duration,
            renew_deadline: le.renew_deadline,
            retry_period: le.retry_period,
        };
        config.validate()?;
        info!(
            lease = %config.lease_name,
            namespace = %config.lease_namespace,
            identity = %config.identity,
            "Leader election enabled"
        );

        health_registry.register(components::LEADER_ELECTION).await;
        let leadership = LeadershipState::new();
        collector = collector.leadership(leadership.clone());

        let elector = LeaderElector::new(client.clone(), config, leadership, logger.clone())
            .with_metrics(metrics.clone())
            .with_health(health_registry.clone());
        elector_task = Some(tokio::spawn(elector.run(shutdown_tx.subscribe())));
    } else {
        info!("Leader election disabled, running as single replica");
    }

    let collector = collector.build()?;
    registry
        .register(Box::new(collector))
        .context("Failed to register bin-packing collector")?;

    logger.log_startup(
        EXPORTER_VERSION,
        &settings.metrics_addr,
        settings.leader_election.is_some(),
    );

    // Signals
    let mut main_shutdown = shutdown_tx.subscribe();
    tokio::spawn({
        let tx = shutdown_tx.clone();
        let logger = logger.clone();
        async move {
            let reason = shutdown_signal().await;
            logger.log_shutdown(reason);
            let _ = tx.send(());
        }
    });

    // HTTP server; probes answer while the caches sync
    let state = Arc::new(api::AppState::new(
        registry,
        health_registry.clone(),
        Arc::clone(&sync_info),
        settings.metrics_path.clone(),
    ));
    let server_shutdown = {
        let mut rx = shutdown_tx.subscribe();
        async move {
            let _ = rx.recv().await;
        }
    };
    let mut server = tokio::spawn(api::serve(
        settings.metrics_addr.clone(),
        state,
        server_shutdown,
    ));

    let sync_start = Instant::now();
    let startup = await_startup(
        wait_for_sync(&sync_info, CACHE_SYNC_TIMEOUT),
        &mut server,
        &mut main_shutdown,
    )
    .await;

    let served = match startup {
        Startup::Synced => {
            health_registry.observe_sync(&sync_info).await;
            logger.log_cache_synced(
                node_cache.list().map(|n| n.len()).unwrap_or(0),
                pod_cache.list().map(|p| p.len()).unwrap_or(0),
                sync_start.elapsed().as_millis() as u64,
            );
            server.await
        }
        Startup::SyncFailed(e) => {
            let _ = shutdown_tx.send(());
            return Err(e);
        }
        Startup::ServerExited(served) => served,
        Startup::ShutdownRequested => server.await,
    };
    let _ = shutdown_tx.send(());
    let served = served.context("API server task panicked")?;

    if let Some(task) = elector_task {
        if tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, task).await.is_err() {
            warn!("leader election did not stop in time");
        }
    }
    for task in [node_task, pod_task] {
        if tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, task).await.is_err() {
            warn!("watcher did not stop in time");
        }
    }

    served?;
    info!("Shutdown complete");
    Ok(())
}

/// How the wait for the initial cache sync ended
enum Startup {
    Synced,
    SyncFailed(anyhow::Error),
    /// The server stopped first, usually because it could not bind
    ServerExited(Result<Result<()>, JoinError>),
    ShutdownRequested,
}

/// Wait for the caches to sync, bailing out early if the API server task
/// ends or shutdown is requested.
async fn await_startup<S>(
    sync: S,
    server: &mut JoinHandle<Result<()>>,
    shutdown: &mut broadcast::Receiver<()>,
) -> Startup
where
    S: Future<Output = Result<()>>,
{
    tokio::select! {
        result = sync => match result {
            Ok(()) => Startup::Synced,
            Err(e) => Startup::SyncFailed(e),
        },
        served = server => Startup::ServerExited(served),
        _ = shutdown.recv() => Startup::ShutdownRequested,
    }
}

async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT received",
        _ = terminate => "SIGTERM received",
    }
}
