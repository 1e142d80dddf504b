//! Wire schema for the `Feature` interface
//!
//! Every message is bincode-encoded inside one length-delimited frame. Field
//! order is part of the contract; append new variants, never reorder.

use crate::error::{ServeError, ServeResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Name of the interface published as the bootstrap object
pub const INTERFACE_NAME: &str = "Feature";
/// Bumped on incompatible schema changes
pub const SCHEMA_VERSION: u16 = 1;
/// Call id used for replies to frames that could not be decoded
pub const UNKNOWN_CALL_ID: u64 = 0;

/// First frame a server sends on a new connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bootstrap {
    pub interface: String,
    pub schema_version: u16,
}

impl Bootstrap {
    pub fn feature() -> Self {
        Self {
            interface: INTERFACE_NAME.to_string(),
            schema_version: SCHEMA_VERSION,
        }
    }

    pub fn is_compatible(&self) -> bool {
        self.interface == INTERFACE_NAME && self.schema_version == SCHEMA_VERSION
    }
}

/// Client request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    /// Chosen by the client, echoed in the matching [`Return`]; never 0
    pub call_id: u64,
    pub method: Method,
}

/// Remote operations of the `Feature` interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Method {
    /// `computeFeature(features: List<Float64>) -> (value: Float64)`
    ComputeFeature { features: Vec<f64> },
}

/// Server reply to one [`Call`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Return {
    pub call_id: u64,
    pub result: CallResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallResult {
    Value { value: f64 },
    Failed(CallError),
}

impl CallResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, CallResult::Value { .. })
    }
}

/// Failure reported for a single call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallError {
    DimensionMismatch { expected: u64, actual: u64 },
    BackendPrediction { message: String },
    MalformedCall { message: String },
    InvalidFeature { index: u64, value: f64 },
}

impl CallError {
    pub fn kind_label(&self) -> &'static str {
        match self {
            CallError::DimensionMismatch { .. } => "dimension_mismatch",
            CallError::BackendPrediction { .. } => "backend_prediction",
            CallError::MalformedCall { .. } => "malformed_call",
            CallError::InvalidFeature { .. } => "invalid_feature",
        }
    }
}

impl From<ServeError> for CallError {
    fn from(err: ServeError) -> Self {
        match err {
            ServeError::DimensionMismatch { expected, actual } => CallError::DimensionMismatch {
                expected: expected as u64,
                actual: actual as u64,
            },
            ServeError::Protocol(message) => CallError::MalformedCall { message },
            ServeError::InvalidFeature { index, value } => CallError::InvalidFeature {
                index: index as u64,
                value,
            },
            other => CallError::BackendPrediction {
                message: other.to_string(),
            },
        }
    }
}

impl From<CallError> for ServeError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::DimensionMismatch { expected, actual } => ServeError::DimensionMismatch {
                expected: expected as usize,
                actual: actual as usize,
            },
            CallError::BackendPrediction { message } => ServeError::BackendPrediction(message),
            CallError::MalformedCall { message } => ServeError::Protocol(message),
            CallError::InvalidFeature { index, value } => ServeError::InvalidFeature {
                index: index as usize,
                value,
            },
        }
    }
}

pub fn encode<T: Serialize>(msg: &T) -> ServeResult<Vec<u8>> {
    bincode::serialize(msg).map_err(|e| ServeError::Protocol(format!("encode failed: {e}")))
}

pub fn decode<T: DeserializeOwned>(data: &[u8]) -> ServeResult<T> {
    bincode::deserialize(data).map_err(|e| ServeError::Protocol(format!("decode failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_error_mapping() {
        let wire: CallError = ServeError::DimensionMismatch { expected: 4, actual: 2 }.into();
        assert_eq!(wire, CallError::DimensionMismatch { expected: 4, actual: 2 });
        assert!(matches!(
            ServeError::from(wire),
            ServeError::DimensionMismatch { expected: 4, actual: 2 }
        ));

        let wire: CallError = ServeError::BackendPrediction("boom".into()).into();
        assert_eq!(wire.kind_label(), "backend_prediction");

        let wire: CallError = ServeError::InvalidFeature { index: 1, value: f64::INFINITY }.into();
        assert_eq!(wire, CallError::InvalidFeature { index: 1, value: f64::INFINITY });
        assert!(matches!(
            ServeError::from(wire),
            ServeError::InvalidFeature { index: 1, .. }
        ));
    }

    #[test]
    fn test_garbage_does_not_decode_as_call() {
        assert!(decode::<Call>(&[0xff, 0x01]).is_err());
    }

    #[test]
    fn test_bootstrap_compatibility() {
        assert!(Bootstrap::feature().is_compatible());
        let other = Bootstrap {
            interface: "Calculator".to_string(),
            schema_version: SCHEMA_VERSION,
        };
        assert!(!other.is_compatible());
    }
}
