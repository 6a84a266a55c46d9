//! Bin-packing metrics for Kubernetes nodes
//!
//! This crate provides the core functionality for:
//! - Effective pod request calculation and admission filtering
//! - Per-node, cluster-wide and label-group aggregation
//! - A leader-gated Prometheus collector
//! - Watch-based node and pod caches
//! - Lease-based leader election
//! - Health checks and observability

pub mod cache;
pub mod collector;
pub mod error;
pub mod health;
pub mod leader;
pub mod models;
pub mod observability;
pub mod quantity;

pub use cache::{CacheKind, ObjectCache, SyncInfo, SyncStatus, WatchState};
pub use collector::{BinpackingCollector, BinpackingCollectorBuilder, CollectorConfig, LabelGroup};
pub use error::{CacheError, LeaderElectionError, QuantityError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use leader::{LeaderElectionConfig, LeaderElector, LeadershipState};
pub use models::*;
pub use observability::{ExporterMetrics, StructuredLogger};
