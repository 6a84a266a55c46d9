//! Exporter configuration
//!
//! Sources, lowest to highest precedence: built-in defaults, an optional
//! config file, `BINPACKING_*` environment variables, command-line flags.

use anyhow::{bail, Context, Result};
use binpacking_lib::collector::{parse_label_groups, parse_resources, LabelGroup};
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "BINPACKING";
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
const RESERVED_PATHS: &[&str] = &["/", "/healthz", "/readyz", "/sync"];

/// Kubernetes cluster bin-packing exporter
#[derive(Debug, Default, Parser)]
#[command(name = "kube-binpacking-exporter")]
#[command(version, about = "Prometheus exporter for Kubernetes cluster bin-packing efficiency", long_about = None)]
pub struct Cli {
    /// Config file (TOML, YAML or JSON)
    #[arg(long, env = "BINPACKING_CONFIG")]
    pub config: Option<PathBuf>,

    /// Path to kubeconfig file (defaults to in-cluster or ~/.kube/config)
    #[arg(long)]
    pub kubeconfig: Option<String>,

    /// Address to serve metrics and probes on, e.g. `:9101`
    #[arg(long)]
    pub metrics_addr: Option<String>,

    /// HTTP path for Prometheus metrics
    #[arg(long)]
    pub metrics_path: Option<String>,

    /// Comma-separated resources to track, e.g. `cpu,memory,nvidia.com/gpu`
    #[arg(long)]
    pub resources: Option<String>,

    /// Label groups: keys within a group joined by `,`, groups by `;`
    #[arg(long)]
    pub label_groups: Option<String>,

    /// Skip per-node metrics
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub disable_node_metrics: Option<bool>,

    /// trace, debug, info, warn or error
    #[arg(long)]
    pub log_level: Option<String>,

    /// json or text
    #[arg(long)]
    pub log_format: Option<String>,

    /// Full cache relist interval, e.g. `30m`; `0` disables
    #[arg(long)]
    pub resync_period: Option<String>,

    /// Objects per list page; 0 disables pagination
    #[arg(long)]
    pub list_page_size: Option<u32>,

    /// Run as one of several replicas with lease-based leader election
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub leader_election: Option<bool>,

    #[arg(long)]
    pub leader_election_lease_name: Option<String>,

    /// Lease namespace (defaults to the pod's namespace)
    #[arg(long)]
    pub leader_election_namespace: Option<String>,

    /// Replica identity (defaults to the hostname)
    #[arg(long)]
    pub leader_election_id: Option<String>,

    #[arg(long)]
    pub leader_election_lease_duration: Option<String>,

    #[arg(long)]
    pub leader_election_renew_deadline: Option<String>,

    #[arg(long)]
    pub leader_election_retry_period: Option<String>,
}

/// Merged configuration, values still in their textual form
#[derive(Debug, Clone, Deserialize)]
pub struct ExporterConfig {
    pub kubeconfig: Option<String>,
    pub metrics_addr: String,
    pub metrics_path: String,
    pub resources: String,
    pub label_groups: String,
    pub disable_node_metrics: bool,
    pub log_level: String,
    pub log_format: String,
    pub resync_period: String,
    pub list_page_size: u32,
    pub leader_election: bool,
    pub leader_election_lease_name: String,
    pub leader_election_namespace: Option<String>,
    pub leader_election_id: Option<String>,
    pub leader_election_lease_duration: String,
    pub leader_election_renew_deadline: String,
    pub leader_election_retry_period: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

/// Lease settings; namespace and identity are resolved at startup
#[derive(Debug, Clone)]
pub struct LeaderElectionSettings {
    pub lease_name: String,
    pub namespace: Option<String>,
    pub identity: Option<String>,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

/// Validated, typed configuration
#[derive(Debug, Clone)]
pub struct Settings {
    pub kubeconfig: Option<PathBuf>,
    /// `host:port`; the host may be a name, resolved when binding
    pub metrics_addr: String,
    pub metrics_path: String,
    pub resources: Vec<String>,
    pub label_groups: Vec<LabelGroup>,
    pub node_metrics: bool,
    pub log_level: String,
    pub log_format: LogFormat,
    pub resync_period: Duration,
    pub list_page_size: u32,
    pub leader_election: Option<LeaderElectionSettings>,
}

impl ExporterConfig {
    /// Merge every configuration source for `cli`.
    pub fn load(cli: &Cli) -> Result<Self> {
        Self::from_sources(cli, cli.config.as_deref())
    }

    fn from_sources(cli: &Cli, file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("metrics_addr", ":9101")?
            .set_default("metrics_path", "/metrics")?
            .set_default("resources", "cpu,memory")?
            .set_default("label_groups", "")?
            .set_default("disable_node_metrics", false)?
            .set_default("log_level", "info")?
            .set_default("log_format", "json")?
            .set_default("resync_period", "30m")?
            .set_default("list_page_size", 500)?
            .set_default("leader_election", false)?
            .set_default("leader_election_lease_name", "binpacking-exporter")?
            .set_default("leader_election_lease_duration", "15s")?
            .set_default("leader_election_renew_deadline", "10s")?
            .set_default("leader_election_retry_period", "2s")?;

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX))
            .set_override_option("kubeconfig", cli.kubeconfig.clone())?
            .set_override_option("metrics_addr", cli.metrics_addr.clone())?
            .set_override_option("metrics_path", cli.metrics_path.clone())?
            .set_override_option("resources", cli.resources.clone())?
            .set_override_option("label_groups", cli.label_groups.clone())?
            .set_override_option("disable_node_metrics", cli.disable_node_metrics)?
            .set_override_option("log_level", cli.log_level.clone())?
            .set_override_option("log_format", cli.log_format.clone())?
            .set_override_option("resync_period", cli.resync_period.clone())?
            .set_override_option("list_page_size", cli.list_page_size.map(i64::from))?
            .set_override_option("leader_election", cli.leader_election)?
            .set_override_option(
                "leader_election_lease_name",
                cli.leader_election_lease_name.clone(),
            )?
            .set_override_option(
                "leader_election_namespace",
                cli.leader_election_namespace.clone(),
            )?
            .set_override_option("leader_election_id", cli.leader_election_id.clone())?
            .set_override_option(
                "leader_election_lease_duration",
                cli.leader_election_lease_duration.clone(),
            )?
            .set_override_option(
                "leader_election_renew_deadline",
                cli.leader_election_renew_deadline.clone(),
            )?
            .set_override_option(
                "leader_election_retry_period",
                cli.leader_election_retry_period.clone(),
            )?
            .build()
            .context("Failed to load configuration")?;

        config
            .try_deserialize()
            .context("Failed to parse configuration")
    }

    /// Validate and convert into typed settings.
    pub fn settings(&self) -> Result<Settings> {
        let resources = parse_resources(&self.resources);
        if resources.is_empty() {
            bail!("at least one resource must be configured");
        }

        let log_level = self.log_level.trim().to_ascii_lowercase();
        if !LOG_LEVELS.contains(&log_level.as_str()) {
            bail!("invalid log level {:?}", self.log_level);
        }

        let log_format = match self.log_format.trim().to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            "text" => LogFormat::Text,
            other => bail!("invalid log format {other:?}, expected json or text"),
        };

        let metrics_path = self.metrics_path.trim().to_string();
        if !metrics_path.starts_with('/') {
            bail!("metrics path {metrics_path:?} must start with '/'");
        }
        if RESERVED_PATHS.contains(&metrics_path.as_str()) {
            bail!("metrics path {metrics_path:?} collides with a built-in endpoint");
        }

        let resync_period = parse_duration(&self.resync_period).context("resync_period")?;

        let lease_duration = parse_duration(&self.leader_election_lease_duration)
            .context("leader_election_lease_duration")?;
        let renew_deadline = parse_duration(&self.leader_election_renew_deadline)
            .context("leader_election_renew_deadline")?;
        let retry_period = parse_duration(&self.leader_election_retry_period)
            .context("leader_election_retry_period")?;
        if renew_deadline >= lease_duration {
            bail!("leader election renew deadline must be shorter than the lease duration");
        }

        let leader_election = self.leader_election.then(|| LeaderElectionSettings {
            lease_name: self.leader_election_lease_name.clone(),
            namespace: non_empty(&self.leader_election_namespace),
            identity: non_empty(&self.leader_election_id),
            lease_duration,
            renew_deadline,
            retry_period,
        });

        Ok(Settings {
            kubeconfig: non_empty(&self.kubeconfig).map(PathBuf::from),
            metrics_addr: parse_listen_addr(&self.metrics_addr)?,
            metrics_path,
            resources,
            label_groups: parse_label_groups(&self.label_groups),
            node_metrics: !self.disable_node_metrics,
            log_level,
            log_format,
            resync_period,
            list_page_size: self.list_page_size,
            leader_election,
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Normalize a `host:port` listen address; a bare `:port` binds all
/// interfaces. Hostnames are kept as given and resolved by the listener.
pub fn parse_listen_addr(addr: &str) -> Result<String> {
    let addr = addr.trim();
    let Some((host, port)) = addr.rsplit_once(':') else {
        bail!("invalid listen address {addr:?}: expected host:port");
    };
    port.parse::<u16>()
        .with_context(|| format!("invalid port in listen address {addr:?}"))?;

    let host = match host {
        "" => "0.0.0.0",
        h if h.starts_with('[') && !h.ends_with(']') => {
            bail!("invalid listen address {addr:?}: unterminated IPv6 literal")
        }
        h if !h.starts_with('[') && h.contains(':') => {
            bail!("invalid listen address {addr:?}: IPv6 hosts need brackets")
        }
        h => h,
    };
    Ok(format!("{host}:{port}"))
}

/// Parse a duration like `30s`, `500ms` or `1h30m`.
///
/// Units are `ns`, `us`/`µs`, `ms`, `s`, `m` and `h`; components may be
/// fractional. A bare `0` is accepted.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        bail!("empty duration");
    }

    let is_number = |c: char| c.is_ascii_digit() || c == '.';
    let mut nanos = 0f64;
    let mut rest = s;

    while !rest.is_empty() {
        let number_end = rest.find(|c: char| !is_number(c)).unwrap_or(rest.len());
        if number_end == 0 {
            bail!("invalid duration {s:?}: expected a number");
        }
        let value: f64 = rest[..number_end]
            .parse()
            .with_context(|| format!("invalid duration {s:?}"))?;
        rest = &rest[number_end..];

        let unit_end = rest.find(is_number).unwrap_or(rest.len());
        let scale = match &rest[..unit_end] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "" => bail!("invalid duration {s:?}: missing unit"),
            unit => bail!("invalid duration {s:?}: unknown unit {unit:?}"),
        };
        nanos += value * scale;
        rest = &rest[unit_end..];
    }

    Ok(Duration::from_nanos(nanos.round() as u64))
}
