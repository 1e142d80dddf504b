//! Model backends behind a uniform `predict(features) -> score` contract
//!
//! Each backend kind owns its artifact format and any runtime it needs.
//! Adding a kind means adding a variant to [`BackendKind`] and a branch in
//! [`load`]; the feature capability and connection server only see
//! `dyn ModelBackend`.

#[cfg(feature = "onnx")]
pub mod onnx;
pub mod scaling;
pub mod sklearn;
pub mod spark;

pub use scaling::InputScaling;
pub use sklearn::SklearnBackend;
pub use spark::{ComputeContext, SparkBackend};

use crate::config::BackendsConfig;
use crate::error::{ServeError, ServeResult};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// Selector for the model runtime that answers predictions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Fitted scikit-learn linear estimator held in process memory
    Sklearn,
    /// Spark MLlib model loaded through a local compute context
    Spark,
    /// ONNX Runtime session (requires the `onnx` feature)
    Onnx,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Sklearn => "sklearn",
            BackendKind::Spark => "spark",
            BackendKind::Onnx => "onnx",
        }
    }

    /// Kinds this build can load
    pub fn supported() -> Vec<BackendKind> {
        let mut kinds = vec![BackendKind::Sklearn, BackendKind::Spark];
        if cfg!(feature = "onnx") {
            kinds.push(BackendKind::Onnx);
        }
        kinds
    }
}

impl FromStr for BackendKind {
    type Err = ServeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sklearn" => Ok(BackendKind::Sklearn),
            "spark" => Ok(BackendKind::Spark),
            "onnx" if cfg!(feature = "onnx") => Ok(BackendKind::Onnx),
            other => Err(ServeError::UnknownBackendKind(other.to_string())),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A loaded, read-only predictor.
///
/// Implementations must be safe to call from several threads at once; a
/// backend whose runtime is not reentrant serializes access internally.
pub trait ModelBackend: Send + Sync {
    /// Which runtime produced this backend
    fn kind(&self) -> BackendKind;

    /// Informational artifact name, for logs and metrics only
    fn name(&self) -> &str;

    /// Number of features the loaded parameters expect
    fn num_features(&self) -> usize;

    /// Score one feature vector.
    ///
    /// Fails with [`ServeError::DimensionMismatch`] when `features` has the
    /// wrong length, [`ServeError::InvalidFeature`] when a component is not
    /// finite and [`ServeError::BackendPrediction`] when the runtime
    /// fails or yields a non-finite value.
    fn predict(&self, features: &[f64]) -> ServeResult<f64>;
}

impl fmt::Debug for dyn ModelBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelBackend")
            .field("kind", &self.kind())
            .field("name", &self.name())
            .field("num_features", &self.num_features())
            .finish()
    }
}

/// Load the artifact at `path` with the backend selected by `kind`
pub fn load(
    kind: BackendKind,
    path: &Path,
    config: &BackendsConfig,
) -> ServeResult<Arc<dyn ModelBackend>> {
    if !path.exists() {
        return Err(ServeError::artifact_load(path, "path does not exist"));
    }

    info!(kind = %kind, path = %path.display(), "Loading model artifact");

    let backend: Arc<dyn ModelBackend> = match kind {
        BackendKind::Sklearn => {
            let scaling = InputScaling::divide_by(config.sklearn.input_scale)?;
            Arc::new(SklearnBackend::load(path, scaling)?)
        }
        BackendKind::Spark => Arc::new(SparkBackend::load(path, &config.spark)?),
        #[cfg(feature = "onnx")]
        BackendKind::Onnx => Arc::new(onnx::OnnxBackend::load(path, &config.onnx)?),
        #[cfg(not(feature = "onnx"))]
        BackendKind::Onnx => {
            return Err(ServeError::UnknownBackendKind(kind.as_str().to_string()))
        }
    };

    info!(
        kind = %kind,
        model = %backend.name(),
        num_features = backend.num_features(),
        "Model loaded successfully"
    );

    Ok(backend)
}

/// Informational name for an artifact: the final path component without its extension
pub fn artifact_name(path: &Path) -> String {
    path.file_stem()
        .or_else(|| path.file_name())
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "model".to_string())
}

/// Reject feature vectors whose length differs from `expected` or that hold
/// a NaN or infinite component
pub(crate) fn check_features(expected: usize, features: &[f64]) -> ServeResult<()> {
    if features.len() != expected {
        return Err(ServeError::DimensionMismatch {
            expected,
            actual: features.len(),
        });
    }
    match features.iter().position(|x| !x.is_finite()) {
        Some(index) => Err(ServeError::InvalidFeature {
            index,
            value: features[index],
        }),
        None => Ok(()),
    }
}

/// Turn a non-finite backend output into a prediction failure
pub(crate) fn ensure_finite(value: f64) -> ServeResult<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ServeError::BackendPrediction(format!(
            "model produced a non-finite value ({value})"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_parse_backend_kind() {
        assert_eq!("sklearn".parse::<BackendKind>().unwrap(), BackendKind::Sklearn);
        assert_eq!("spark".parse::<BackendKind>().unwrap(), BackendKind::Spark);
        assert!(matches!(
            "tensorflow".parse::<BackendKind>(),
            Err(ServeError::UnknownBackendKind(kind)) if kind == "tensorflow"
        ));
        // matching is exact
        assert!("SKLEARN".parse::<BackendKind>().is_err());
    }

    #[cfg(not(feature = "onnx"))]
    #[test]
    fn test_onnx_unavailable_without_feature() {
        assert!("onnx".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::supported().len(), 2);
    }

    #[test]
    fn test_artifact_name() {
        assert_eq!(artifact_name(&PathBuf::from("/models/clf.json")), "clf");
        // no suffix to strip: name is kept whole
        assert_eq!(artifact_name(&PathBuf::from("/models/spark_model")), "spark_model");
        assert_eq!(artifact_name(&PathBuf::from("/models/lkp.json")), "lkp");
    }

    #[test]
    fn test_load_missing_path() {
        let err = load(
            BackendKind::Sklearn,
            Path::new("/definitely/not/here.json"),
            &BackendsConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ServeError::ArtifactLoad { .. }));
    }

    #[test]
    fn test_check_features() {
        assert!(check_features(2, &[0.5, -1.0]).is_ok());
        assert!(matches!(
            check_features(2, &[0.5]),
            Err(ServeError::DimensionMismatch { expected: 2, actual: 1 })
        ));
        assert!(matches!(
            check_features(3, &[0.0, f64::NAN, f64::INFINITY]),
            Err(ServeError::InvalidFeature { index: 1, .. })
        ));
        assert!(matches!(
            check_features(2, &[f64::NEG_INFINITY, 0.0]),
            Err(ServeError::InvalidFeature { index: 0, .. })
        ));
    }

    #[test]
    fn test_ensure_finite() {
        assert_eq!(ensure_finite(1.5).unwrap(), 1.5);
        assert!(ensure_finite(f64::NAN).is_err());
        assert!(ensure_finite(f64::INFINITY).is_err());
    }
}
