//! Per-backend linear rescaling of input features

use crate::error::ServeError;
use std::borrow::Cow;

/// Divides every feature by a constant before it reaches the numeric model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputScaling {
    divisor: f64,
}

impl InputScaling {
    /// Scaling that leaves features untouched
    pub const fn identity() -> Self {
        Self { divisor: 1.0 }
    }

    /// Create a scaling that divides by `divisor`
    pub fn divide_by(divisor: f64) -> Result<Self, ServeError> {
        if !divisor.is_finite() || divisor <= 0.0 {
            return Err(ServeError::Config(format!(
                "input_scale must be a positive finite number, got {divisor}"
            )));
        }
        Ok(Self { divisor })
    }

    pub fn divisor(&self) -> f64 {
        self.divisor
    }

    pub fn is_identity(&self) -> bool {
        self.divisor == 1.0
    }

    /// Apply the scaling, borrowing when there is nothing to do
    pub fn apply<'a>(&self, features: &'a [f64]) -> Cow<'a, [f64]> {
        if self.is_identity() {
            Cow::Borrowed(features)
        } else {
            Cow::Owned(features.iter().map(|v| v / self.divisor).collect())
        }
    }
}

impl Default for InputScaling {
    fn default() -> Self {
        Self::identity()
    }
}
