//! Error taxonomy for the feature server
//!
//! Startup errors (`ArtifactLoad`, `Bind`, `UnknownBackendKind`, `Config`) abort
//! the process before any socket is exposed. Per-call errors
//! (`DimensionMismatch`, `InvalidFeature`, `BackendPrediction`) are returned
//! to the caller and never end the session.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result alias used across the crate
pub type ServeResult<T> = Result<T, ServeError>;

/// Errors raised while loading, binding or serving a model
#[derive(Debug, Error)]
pub enum ServeError {
    /// Artifact missing, unreadable, or structurally wrong for the backend kind
    #[error("failed to load model artifact {path}: {reason}")]
    ArtifactLoad { path: PathBuf, reason: String },

    /// Listening endpoint could not be parsed or bound
    #[error("cannot bind {address}: {reason}")]
    Bind { address: String, reason: String },

    /// Feature vector length differs from what the backend expects
    #[error("dimension mismatch: expected {expected} features, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Feature vector holds a NaN or infinite component
    #[error("feature {index} is not finite ({value})")]
    InvalidFeature { index: usize, value: f64 },

    /// The numeric backend failed while producing a prediction
    #[error("backend prediction failed: {0}")]
    BackendPrediction(String),

    /// Startup argument named a backend kind this build does not support
    #[error("{0} is an unsupported backend kind")]
    UnknownBackendKind(String),

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Wire decode or transport failure
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ServeError {
    pub fn artifact_load(path: &Path, reason: impl Into<String>) -> Self {
        Self::ArtifactLoad {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    pub fn bind(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Bind {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error must stop the process rather than fail a single call.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ServeError::ArtifactLoad { .. }
                | ServeError::Bind { .. }
                | ServeError::UnknownBackendKind(_)
                | ServeError::Config(_)
        )
    }

    /// Short, stable label used for metrics and log fields
    pub fn kind_label(&self) -> &'static str {
        match self {
            ServeError::ArtifactLoad { .. } => "artifact_load",
            ServeError::Bind { .. } => "bind",
            ServeError::DimensionMismatch { .. } => "dimension_mismatch",
            ServeError::InvalidFeature { .. } => "invalid_feature",
            ServeError::BackendPrediction(_) => "backend_prediction",
            ServeError::UnknownBackendKind(_) => "unknown_backend_kind",
            ServeError::Config(_) => "config",
            ServeError::Protocol(_) => "protocol",
        }
    }
}
