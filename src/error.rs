//! Error types for the provisioning pipeline

use thiserror::Error;

use crate::models::ResourceRef;
use crate::quantity::QuantityError;

/// Errors reported by a [`ClusterClient`](crate::cluster::ClusterClient).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("{0} not found")]
    NotFound(ResourceRef),

    #[error("{0} already exists")]
    AlreadyExists(ResourceRef),

    #[error("conflict updating {resource}: expected version {expected}, found {actual}")]
    Conflict {
        resource: ResourceRef,
        expected: u64,
        actual: u64,
    },

    #[error("{resource} rejected: {reason}")]
    Invalid { resource: ResourceRef, reason: String },

    #[error("cluster API error: {0}")]
    Api(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict { .. })
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Invalid quantity: {0}")]
    Quantity(#[from] QuantityError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("Timed out after {attempts} attempts waiting for {resource} to become {condition}")]
    ReadinessTimeout {
        resource: ResourceRef,
        condition: String,
        attempts: u32,
    },

    #[error("{resource} reached terminal phase {phase} before becoming ready")]
    Unready { resource: ResourceRef, phase: String },

    #[error("Cancelled while waiting for {0}")]
    Cancelled(ResourceRef),

    #[error("Gave up updating {resource} after {attempts} conflicting writes")]
    ConflictRetriesExhausted { resource: ResourceRef, attempts: u32 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Validation failures happen before any cluster call and are never retried
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_) | Error::Quantity(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::ReadinessTimeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }
}
