//! Error types for the bin-packing engine and its collaborators

use thiserror::Error;

/// Failure to read from an object cache
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to list {kind}: {message}")]
    List { kind: &'static str, message: String },

    #[error("{kind} cache has not completed its initial sync")]
    NotSynced { kind: &'static str },
}

impl CacheError {
    pub fn list(kind: &'static str, message: impl Into<String>) -> Self {
        Self::List {
            kind,
            message: message.into(),
        }
    }
}

/// Malformed resource quantity string
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuantityError {
    #[error("empty quantity")]
    Empty,

    #[error("invalid number in quantity {0:?}")]
    InvalidNumber(String),

    #[error("unknown suffix {suffix:?} in quantity {input:?}")]
    UnknownSuffix { input: String, suffix: String },
}

/// Errors raised while participating in leader election
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("could not determine leader election namespace: {0}")]
    Namespace(String),

    #[error("could not determine leader election identity")]
    Identity,

    #[error("invalid leader election timing: {0}")]
    Timing(String),
}
