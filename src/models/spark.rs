//! Distributed-compute backend for Spark MLlib logistic regression models
//!
//! The model directory follows the MLlib save layout:
//!
//! ```text
//! <model>/metadata/part-00000   {"class": "...LogisticRegressionModel", "version": "1.0", "numFeatures": N, "numClasses": K}
//! <model>/data/part-00000       {"weights": [...], "intercept": b, "threshold": 0.5}
//! ```
//!
//! Loading and prediction both go through a [`ComputeContext`], a local
//! compute runtime that lives as long as the backend that owns it.

use super::{artifact_name, check_features, ensure_finite, BackendKind, InputScaling, ModelBackend};
use crate::config::SparkConfig;
use crate::error::{ServeError, ServeResult};
use serde::Deserialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Model class accepted in the metadata file
pub const LOGISTIC_REGRESSION_CLASS: &str =
    "org.apache.spark.mllib.classification.LogisticRegressionModel";

/// Only one compute context may exist per process
static CONTEXT_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Parsed compute context settings.
///
/// Informational: the values are validated at startup and recorded in the
/// context's start log, but do not size anything. Jobs always run one at a
/// time under the session lock, whatever `parallelism` says.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConf {
    pub app_name: String,
    pub master: String,
    /// Worker slots the master string names
    pub parallelism: usize,
    pub executor_memory_bytes: u64,
    pub kryo_buffer_mb: u32,
}

impl ContextConf {
    pub fn from_config(config: &SparkConfig) -> ServeResult<Self> {
        Ok(Self {
            app_name: config.app_name.clone(),
            master: config.master.clone(),
            parallelism: parse_master(&config.master)?,
            executor_memory_bytes: parse_memory(&config.executor_memory)?,
            kryo_buffer_mb: config.kryo_buffer_mb,
        })
    }
}

/// Local compute runtime.
///
/// Acquired once, before the model is read, and kept until process exit.
/// It is not reentrant: jobs run one at a time under its session lock, and it
/// cannot be re-created while another context is alive in the process.
#[derive(Debug)]
pub struct ComputeContext {
    conf: ContextConf,
    session: Mutex<SessionState>,
}

#[derive(Debug, Default)]
struct SessionState {
    jobs_run: u64,
}

impl ComputeContext {
    /// Start the process-wide context
    pub fn acquire(config: &SparkConfig) -> ServeResult<Self> {
        let conf = ContextConf::from_config(config)?;

        if CONTEXT_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ServeError::Config(
                "a compute context is already active in this process".to_string(),
            ));
        }

        info!(
            app_name = %conf.app_name,
            master = %conf.master,
            parallelism = conf.parallelism,
            executor_memory_bytes = conf.executor_memory_bytes,
            kryo_buffer_mb = conf.kryo_buffer_mb,
            "Compute context started"
        );

        Ok(Self {
            conf,
            session: Mutex::new(SessionState::default()),
        })
    }

    pub fn conf(&self) -> &ContextConf {
        &self.conf
    }

    /// Run a job with exclusive access to the context
    pub fn run<R>(&self, job: impl FnOnce() -> R) -> ServeResult<R> {
        let mut session = self.session.lock().map_err(|_| {
            ServeError::BackendPrediction("compute context is poisoned".to_string())
        })?;
        session.jobs_run += 1;
        Ok(job())
    }

    /// Number of jobs executed so far
    pub fn jobs_run(&self) -> u64 {
        self.session.lock().map(|s| s.jobs_run).unwrap_or(0)
    }
}

impl Drop for ComputeContext {
    fn drop(&mut self) {
        CONTEXT_ACTIVE.store(false, Ordering::Release);
    }
}

/// `local` -> 1, `local[N]` -> N, `local[*]` -> available cores
fn parse_master(master: &str) -> ServeResult<usize> {
    if master == "local" {
        return Ok(1);
    }
    let slots = master
        .strip_prefix("local[")
        .and_then(|rest| rest.strip_suffix(']'))
        .ok_or_else(|| {
            ServeError::Config(format!("unsupported compute master {master}, only local masters"))
        })?;
    if slots == "*" {
        return Ok(std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1));
    }
    match slots.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ServeError::Config(format!("invalid worker count in master {master}"))),
    }
}

/// Parse sizes like `512m` or `2g` into bytes
fn parse_memory(value: &str) -> ServeResult<u64> {
    let value = value.trim().to_ascii_lowercase();
    let (digits, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => value.split_at(idx),
        None => (value.as_str(), ""),
    };
    let shift = match unit {
        "" | "b" => 0,
        "k" | "kb" => 10,
        "m" | "mb" => 20,
        "g" | "gb" => 30,
        "t" | "tb" => 40,
        _ => return Err(ServeError::Config(format!("invalid memory size {value}"))),
    };
    digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(1u64 << shift))
        .filter(|n| *n > 0)
        .ok_or_else(|| ServeError::Config(format!("invalid memory size {value}")))
}

#[derive(Debug, Deserialize)]
struct ModelMetadata {
    class: String,
    version: String,
    #[serde(rename = "numFeatures")]
    num_features: usize,
    #[serde(rename = "numClasses")]
    num_classes: usize,
}

#[derive(Debug, Deserialize)]
struct ModelData {
    weights: Vec<f64>,
    intercept: f64,
    #[serde(default)]
    threshold: Option<f64>,
}

/// Learned parameters of an MLlib logistic regression
#[derive(Debug, Clone)]
pub struct LogisticRegressionParams {
    pub weights: Vec<f64>,
    pub intercept: f64,
    pub threshold: Option<f64>,
    pub num_features: usize,
    pub num_classes: usize,
}

impl LogisticRegressionParams {
    fn validate(&self) -> Result<(), String> {
        if self.num_features == 0 {
            return Err("numFeatures must be positive".to_string());
        }
        if self.num_classes < 2 {
            return Err("numClasses must be at least 2".to_string());
        }
        if self.num_classes == 2 {
            if self.weights.len() != self.num_features {
                return Err(format!(
                    "expected {} weights, found {}",
                    self.num_features,
                    self.weights.len()
                ));
            }
        } else {
            let blocks = self.num_classes - 1;
            let plain = blocks * self.num_features;
            let with_bias = blocks * (self.num_features + 1);
            if self.weights.len() != plain && self.weights.len() != with_bias {
                return Err(format!(
                    "expected {plain} or {with_bias} weights for {} classes, found {}",
                    self.num_classes,
                    self.weights.len()
                ));
            }
        }
        if let Some(t) = self.threshold {
            if !(0.0..=1.0).contains(&t) {
                return Err(format!("threshold {t} outside [0, 1]"));
            }
        }
        if !self.intercept.is_finite() || self.weights.iter().any(|w| !w.is_finite()) {
            return Err("parameters contain non-finite values".to_string());
        }
        Ok(())
    }

    /// Predict one point, mirroring MLlib's `predictPoint`
    pub fn predict_point(&self, x: &[f64]) -> f64 {
        if self.num_classes == 2 {
            let margin = dot(&self.weights, x) + self.intercept;
            let score = 1.0 / (1.0 + (-margin).exp());
            return match self.threshold {
                Some(t) if score > t => 1.0,
                Some(_) => 0.0,
                None => score,
            };
        }

        let block = self.weights.len() / (self.num_classes - 1);
        let with_bias = block == self.num_features + 1;
        let mut best_class = 0;
        let mut max_margin = 0.0;
        for (j, w) in self.weights.chunks(block).enumerate() {
            let mut margin = dot(&w[..self.num_features], x);
            if with_bias {
                margin += w[self.num_features];
            }
            if margin > max_margin {
                max_margin = margin;
                best_class = j + 1;
            }
        }
        best_class as f64
    }
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Spark MLlib model bound to its compute context
#[derive(Debug)]
pub struct SparkBackend {
    name: String,
    model: LogisticRegressionParams,
    scaling: InputScaling,
    context: ComputeContext,
}

impl SparkBackend {
    /// Start the compute context and read the model directory through it
    pub fn load(path: &Path, config: &SparkConfig) -> ServeResult<Self> {
        let scaling = InputScaling::divide_by(config.input_scale)?;
        if !path.is_dir() {
            return Err(ServeError::artifact_load(path, "expected a model directory"));
        }

        let context = ComputeContext::acquire(config)?;
        let model = context
            .run(|| read_model(path))?
            .map_err(|reason| ServeError::artifact_load(path, reason))?;

        let backend = Self {
            name: artifact_name(path),
            model,
            scaling,
            context,
        };

        info!(
            model = %backend.name,
            num_features = backend.model.num_features,
            num_classes = backend.model.num_classes,
            threshold = ?backend.model.threshold,
            input_scale = backend.scaling.divisor(),
            "started spark"
        );

        Ok(backend)
    }

    pub fn params(&self) -> &LogisticRegressionParams {
        &self.model
    }

    pub fn context(&self) -> &ComputeContext {
        &self.context
    }
}

impl ModelBackend for SparkBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Spark
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn num_features(&self) -> usize {
        self.model.num_features
    }

    fn predict(&self, features: &[f64]) -> ServeResult<f64> {
        check_features(self.model.num_features, features)?;
        let x = self.scaling.apply(features);
        let pred = self.context.run(|| self.model.predict_point(&x))?;
        debug!(model = %self.name, pred = pred, "Model predicted");
        ensure_finite(pred)
    }
}

fn read_model(path: &Path) -> Result<LogisticRegressionParams, String> {
    let metadata: ModelMetadata = serde_json::from_str(&read_first_part(&path.join("metadata"))?)
        .map_err(|e| format!("bad metadata: {e}"))?;
    if metadata.class != LOGISTIC_REGRESSION_CLASS {
        return Err(format!("unsupported model class {}", metadata.class));
    }
    if metadata.version != "1.0" {
        warn!(version = %metadata.version, "Unexpected model format version");
    }

    let data: ModelData = serde_json::from_str(&read_first_part(&path.join("data"))?)
        .map_err(|e| format!("bad model data: {e}"))?;

    let params = LogisticRegressionParams {
        weights: data.weights,
        intercept: data.intercept,
        threshold: data.threshold,
        num_features: metadata.num_features,
        num_classes: metadata.num_classes,
    };
    params.validate()?;
    Ok(params)
}

/// First non-empty line of the lowest-numbered `part-*` file in `dir`
fn read_first_part(dir: &Path) -> Result<String, String> {
    let entries =
        std::fs::read_dir(dir).map_err(|e| format!("cannot read {}: {e}", dir.display()))?;
    let mut parts: Vec<_> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("part-"))
        })
        .collect();
    parts.sort();

    let first = parts
        .first()
        .ok_or_else(|| format!("no part files in {}", dir.display()))?;
    let contents = std::fs::read_to_string(first)
        .map_err(|e| format!("cannot read {}: {e}", first.display()))?;
    contents
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
        .ok_or_else(|| format!("{} is empty", first.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    // The compute context is process-wide; tests that start one take turns.
    static CONTEXT_LOCK: Mutex<()> = Mutex::new(());

    fn context_guard() -> std::sync::MutexGuard<'static, ()> {
        CONTEXT_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write_model(metadata: &str, data: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("metadata")).unwrap();
        fs::create_dir(dir.path().join("data")).unwrap();
        fs::write(dir.path().join("metadata/part-00000"), metadata).unwrap();
        fs::write(dir.path().join("data/part-00000"), data).unwrap();
        dir
    }

    fn binary_metadata(n: usize) -> String {
        format!(
            r#"{{"class": "{LOGISTIC_REGRESSION_CLASS}", "version": "1.0", "numFeatures": {n}, "numClasses": 2}}"#
        )
    }

    #[test]
    fn test_parse_master() {
        assert_eq!(parse_master("local").unwrap(), 1);
        assert_eq!(parse_master("local[4]").unwrap(), 4);
        assert!(parse_master("local[*]").unwrap() >= 1);
        assert!(parse_master("local[0]").is_err());
        assert!(parse_master("spark://host:7077").is_err());
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("2g").unwrap(), 2 << 30);
        assert_eq!(parse_memory("512M").unwrap(), 512 << 20);
        assert_eq!(parse_memory("1024").unwrap(), 1024);
        assert!(parse_memory("lots").is_err());
        assert!(parse_memory("0g").is_err());
    }

    #[test]
    fn test_binary_with_threshold_and_scaling() {
        let _guard = context_guard();
        let dir = write_model(
            &binary_metadata(2),
            r#"{"weights": [1.0, 1.0], "intercept": -1.0, "threshold": 0.5}"#,
        );
        let backend = SparkBackend::load(dir.path(), &SparkConfig::default()).unwrap();

        assert_eq!(backend.num_features(), 2);
        // (255 + 255) / 255 - 1 = 1 > 0
        assert_eq!(backend.predict(&[255.0, 255.0]).unwrap(), 1.0);
        // 0 - 1 < 0
        assert_eq!(backend.predict(&[0.0, 0.0]).unwrap(), 0.0);
        assert_eq!(backend.context().jobs_run(), 3);
    }

    #[test]
    fn test_binary_without_threshold_returns_probability() {
        let _guard = context_guard();
        let dir = write_model(
            &binary_metadata(1),
            r#"{"weights": [0.0], "intercept": 0.0, "threshold": null}"#,
        );
        let backend = SparkBackend::load(dir.path(), &SparkConfig::default()).unwrap();
        assert!((backend.predict(&[42.0]).unwrap() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_multinomial() {
        let params = LogisticRegressionParams {
            // two blocks of (2 weights + bias)
            weights: vec![1.0, 0.0, 0.0, 0.0, 1.0, -0.5],
            intercept: 0.0,
            threshold: None,
            num_features: 2,
            num_classes: 3,
        };
        params.validate().unwrap();
        assert_eq!(params.predict_point(&[2.0, 1.0]), 1.0);
        assert_eq!(params.predict_point(&[0.0, 2.0]), 2.0);
        assert_eq!(params.predict_point(&[-1.0, -1.0]), 0.0);
    }

    #[test]
    fn test_dimension_mismatch() {
        let _guard = context_guard();
        let dir = write_model(
            &binary_metadata(3),
            r#"{"weights": [1.0, 1.0, 1.0], "intercept": 0.0, "threshold": 0.5}"#,
        );
        let backend = SparkBackend::load(dir.path(), &SparkConfig::default()).unwrap();
        assert!(matches!(
            backend.predict(&[1.0]),
            Err(ServeError::DimensionMismatch { expected: 3, actual: 1 })
        ));
    }

    #[test]
    fn test_concurrent_jobs_are_serialized() {
        let _guard = context_guard();
        let context = ComputeContext::acquire(&SparkConfig::default()).unwrap();
        let busy = AtomicBool::new(false);
        let overlaps = std::sync::atomic::AtomicU64::new(0);

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..10 {
                        context
                            .run(|| {
                                if busy.swap(true, Ordering::SeqCst) {
                                    overlaps.fetch_add(1, Ordering::SeqCst);
                                }
                                std::thread::sleep(std::time::Duration::from_micros(200));
                                busy.store(false, Ordering::SeqCst);
                            })
                            .unwrap();
                    }
                });
            }
        });

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(context.jobs_run(), 40);
    }

    #[test]
    fn test_concurrent_predictions_share_one_context() {
        let _guard = context_guard();
        let dir = write_model(
            &binary_metadata(2),
            r#"{"weights": [1.0, 1.0], "intercept": -1.0, "threshold": 0.5}"#,
        );
        let backend = SparkBackend::load(dir.path(), &SparkConfig::default()).unwrap();
        let loaded_jobs = backend.context().jobs_run();

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..25 {
                        assert_eq!(backend.predict(&[255.0, 255.0]).unwrap(), 1.0);
                        assert_eq!(backend.predict(&[0.0, 0.0]).unwrap(), 0.0);
                    }
                });
            }
        });

        assert_eq!(backend.context().jobs_run(), loaded_jobs + 8 * 25 * 2);
    }

    #[test]
    fn test_non_finite_input_is_rejected_before_the_job() {
        let _guard = context_guard();
        let dir = write_model(
            &binary_metadata(2),
            r#"{"weights": [1.0, 1.0], "intercept": -1.0, "threshold": 0.5}"#,
        );
        let backend = SparkBackend::load(dir.path(), &SparkConfig::default()).unwrap();
        let loaded_jobs = backend.context().jobs_run();
        assert!(matches!(
            backend.predict(&[f64::NAN, 0.0]),
            Err(ServeError::InvalidFeature { index: 0, .. })
        ));
        assert_eq!(backend.context().jobs_run(), loaded_jobs);
    }

    #[test]
    fn test_second_context_is_rejected() {
        let _guard = context_guard();
        let first = ComputeContext::acquire(&SparkConfig::default()).unwrap();
        assert!(matches!(
            ComputeContext::acquire(&SparkConfig::default()),
            Err(ServeError::Config(_))
        ));
        drop(first);
        assert!(ComputeContext::acquire(&SparkConfig::default()).is_ok());
    }

    #[test]
    fn test_load_errors() {
        let _guard = context_guard();
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            SparkBackend::load(file.path(), &SparkConfig::default()),
            Err(ServeError::ArtifactLoad { .. })
        ));

        let wrong_class = write_model(
            r#"{"class": "org.apache.spark.mllib.classification.SVMModel", "version": "1.0", "numFeatures": 1, "numClasses": 2}"#,
            r#"{"weights": [1.0], "intercept": 0.0}"#,
        );
        assert!(matches!(
            SparkBackend::load(wrong_class.path(), &SparkConfig::default()),
            Err(ServeError::ArtifactLoad { .. })
        ));

        let wrong_width = write_model(
            &binary_metadata(4),
            r#"{"weights": [1.0], "intercept": 0.0}"#,
        );
        assert!(matches!(
            SparkBackend::load(wrong_width.path(), &SparkConfig::default()),
            Err(ServeError::ArtifactLoad { .. })
        ));
    }
}
