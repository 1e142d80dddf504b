//! The `Feature` capability: the one object a connection exposes
//!
//! Translates wire calls into backend predictions. Holds no per-call state, so
//! one instance is shared by every call of every session.

use crate::error::{ServeError, ServeResult};
use crate::models::{check_features, ModelBackend};
use crate::rpc::schema::{CallError, CallResult, Method};
use std::sync::Arc;
use tracing::debug;

/// Wraps exactly one loaded model backend
#[derive(Debug, Clone)]
pub struct FeatureCapability {
    backend: Arc<dyn ModelBackend>,
}

impl FeatureCapability {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &dyn ModelBackend {
        self.backend.as_ref()
    }

    /// `computeFeature(features) -> score`
    pub fn compute_feature(&self, features: &[f64]) -> ServeResult<f64> {
        let expected = self.backend.num_features();
        if features.is_empty() {
            return Err(ServeError::DimensionMismatch {
                expected,
                actual: 0,
            });
        }
        check_features(expected, features)?;

        let value = self.backend.predict(features)?;
        debug!(model = %self.backend.name(), value = value, "computeFeature");
        Ok(value)
    }

    /// Answer one wire method; failures become a failed result, never a panic
    pub fn dispatch(&self, method: Method) -> CallResult {
        match method {
            Method::ComputeFeature { features } => match self.compute_feature(&features) {
                Ok(value) => CallResult::Value { value },
                Err(err) => CallResult::Failed(CallError::from(err)),
            },
        }
    }
}
