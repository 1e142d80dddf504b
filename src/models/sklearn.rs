//! Local-estimator backend for fitted scikit-learn linear models
//!
//! The artifact is a JSON export of the estimator's learned attributes:
//!
//! ```json
//! {"estimator": "LogisticRegression", "coef": [[0.5, -1.2, 0.3, 2.0]], "intercept": [-0.1], "classes": [0, 1]}
//! ```

use super::{artifact_name, check_features, ensure_finite, BackendKind, InputScaling, ModelBackend};
use crate::error::{ServeError, ServeResult};
use ndarray::{Array1, Array2, ArrayView1};
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info};

/// Coefficients as exported: a single row or one row per class
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Coef {
    Row(Vec<f64>),
    Matrix(Vec<Vec<f64>>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Intercept {
    Scalar(f64),
    Vector(Vec<f64>),
}

#[derive(Debug, Deserialize)]
struct SklearnArtifact {
    estimator: String,
    coef: Coef,
    #[serde(default)]
    intercept: Option<Intercept>,
    #[serde(default)]
    classes: Option<Vec<f64>>,
}

/// How the decision function is turned into a prediction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimatorFamily {
    /// Returns a class label
    Classifier,
    /// Returns the linear response
    Regressor,
}

impl EstimatorFamily {
    fn of(estimator: &str) -> Option<Self> {
        match estimator {
            "LogisticRegression" | "LinearSVC" | "SGDClassifier" | "RidgeClassifier"
            | "Perceptron" => Some(EstimatorFamily::Classifier),
            "LinearRegression" | "Ridge" | "Lasso" | "ElasticNet" | "SGDRegressor" => {
                Some(EstimatorFamily::Regressor)
            }
            _ => None,
        }
    }
}

/// Fitted linear estimator held in memory
#[derive(Debug)]
pub struct SklearnBackend {
    name: String,
    estimator: String,
    family: EstimatorFamily,
    /// One row per decision function, `[rows, num_features]`
    coef: Array2<f64>,
    intercept: Array1<f64>,
    classes: Vec<f64>,
    scaling: InputScaling,
}

impl SklearnBackend {
    /// Read and validate a JSON estimator export
    pub fn load(path: &Path, scaling: InputScaling) -> ServeResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ServeError::artifact_load(path, format!("unreadable: {e}")))?;
        let artifact: SklearnArtifact = serde_json::from_str(&raw)
            .map_err(|e| ServeError::artifact_load(path, format!("not a sklearn export: {e}")))?;

        let backend = Self::from_artifact(artifact, artifact_name(path), scaling)
            .map_err(|reason| ServeError::artifact_load(path, reason))?;

        info!(
            model = %backend.name,
            estimator = %backend.estimator,
            family = ?backend.family,
            num_features = backend.num_features(),
            input_scale = backend.scaling.divisor(),
            "started sklearn"
        );

        Ok(backend)
    }

    fn from_artifact(
        artifact: SklearnArtifact,
        name: String,
        scaling: InputScaling,
    ) -> Result<Self, String> {
        let family = EstimatorFamily::of(&artifact.estimator)
            .ok_or_else(|| format!("unsupported estimator {}", artifact.estimator))?;

        let rows = match artifact.coef {
            Coef::Row(row) => vec![row],
            Coef::Matrix(rows) => rows,
        };
        let num_features = rows.first().map(Vec::len).unwrap_or(0);
        if rows.is_empty() || num_features == 0 {
            return Err("coef is empty".to_string());
        }
        if rows.iter().any(|r| r.len() != num_features) {
            return Err("coef rows have different lengths".to_string());
        }

        let intercept = match artifact.intercept {
            None => vec![0.0; rows.len()],
            Some(Intercept::Scalar(b)) => vec![b],
            Some(Intercept::Vector(b)) => b,
        };
        if intercept.len() != rows.len() {
            return Err(format!(
                "intercept has {} entries for {} coef rows",
                intercept.len(),
                rows.len()
            ));
        }

        let classes = artifact.classes.unwrap_or_default();
        match family {
            EstimatorFamily::Classifier => {
                let consistent = (rows.len() == 1 && classes.len() == 2)
                    || (rows.len() > 1 && classes.len() == rows.len());
                if !consistent {
                    return Err(format!(
                        "{} classes do not match {} coef rows",
                        classes.len(),
                        rows.len()
                    ));
                }
            }
            EstimatorFamily::Regressor => {
                if rows.len() != 1 {
                    return Err("multi-output regressors are not supported".to_string());
                }
            }
        }

        let n_rows = rows.len();
        let flat: Vec<f64> = rows.into_iter().flatten().collect();
        if flat.iter().chain(&intercept).chain(&classes).any(|v| !v.is_finite()) {
            return Err("parameters contain non-finite values".to_string());
        }
        let coef = Array2::from_shape_vec((n_rows, num_features), flat)
            .map_err(|e| format!("bad coef shape: {e}"))?;

        Ok(Self {
            name,
            estimator: artifact.estimator,
            family,
            coef,
            intercept: Array1::from(intercept),
            classes,
            scaling,
        })
    }

    pub fn family(&self) -> EstimatorFamily {
        self.family
    }

    pub fn estimator(&self) -> &str {
        &self.estimator
    }

    fn decision_function(&self, x: ArrayView1<f64>) -> Array1<f64> {
        self.coef.dot(&x) + &self.intercept
    }
}

impl ModelBackend for SklearnBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sklearn
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn num_features(&self) -> usize {
        self.coef.ncols()
    }

    fn predict(&self, features: &[f64]) -> ServeResult<f64> {
        check_features(self.num_features(), features)?;
        let x = self.scaling.apply(features);
        let scores = self.decision_function(ArrayView1::from(&*x));

        let pred = match self.family {
            EstimatorFamily::Regressor => scores[0],
            EstimatorFamily::Classifier if scores.len() == 1 => {
                if scores[0] > 0.0 {
                    self.classes[1]
                } else {
                    self.classes[0]
                }
            }
            EstimatorFamily::Classifier => {
                let best = argmax(&scores).ok_or_else(|| {
                    ServeError::BackendPrediction("decision function is not comparable".into())
                })?;
                self.classes[best]
            }
        };

        debug!(model = %self.name, pred = pred, "Model predicted");
        ensure_finite(pred)
    }
}

/// Index of the largest value; first index wins ties, NaN aborts
fn argmax(values: &Array1<f64>) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &v) in values.iter().enumerate() {
        if v.is_nan() {
            return None;
        }
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}
