//! ONNX Runtime backend

use super::{artifact_name, check_features, ensure_finite, BackendKind, InputScaling, ModelBackend};
use crate::config::OnnxConfig;
use crate::error::{ServeError, ServeResult};
use ort::memory::Allocator;
use ort::session::{builder::GraphOptimizationLevel, Session, SessionOutputs};
use ort::value::{DowncastableTarget, DynMapValueType, DynSequenceValueType, DynValue, Tensor, ValueType};
use std::path::Path;
use std::sync::{Mutex, Once};
use tracing::{debug, info};

static ORT_INIT: Once = Once::new();

/// ONNX model with its session; runs take the session lock
pub struct OnnxBackend {
    name: String,
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    num_features: usize,
    scaling: InputScaling,
}

impl OnnxBackend {
    pub fn load(path: &Path, config: &OnnxConfig) -> ServeResult<Self> {
        let scaling = InputScaling::divide_by(config.input_scale)?;
        let load_err = |e: ort::Error| ServeError::artifact_load(path, e.to_string());

        ORT_INIT.call_once(|| {
            if let Err(e) = ort::init().commit() {
                tracing::warn!(error = %e, "ONNX Runtime environment setup failed");
            }
        });

        let session = Session::builder()
            .map_err(load_err)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(load_err)?
            .with_intra_threads(config.intra_threads)
            .map_err(load_err)?
            .commit_from_file(path)
            .map_err(load_err)?;

        let input = session
            .inputs
            .first()
            .ok_or_else(|| ServeError::artifact_load(path, "model has no inputs"))?;
        let input_name = input.name.clone();

        // [batch, features]; a negative width means the dimension is dynamic
        let declared = match &input.input_type {
            ValueType::Tensor { shape, .. } => shape.last().copied().filter(|d| *d > 0),
            _ => None,
        };
        let num_features = declared
            .map(|d| d as usize)
            .or(config.num_features)
            .filter(|n| *n > 0)
            .ok_or_else(|| {
                ServeError::artifact_load(
                    path,
                    "input width is dynamic; set backends.onnx.num_features",
                )
            })?;

        let output_name = session
            .outputs
            .iter()
            .find(|o| o.name.contains("prob") || o.name.contains("output"))
            .or_else(|| session.outputs.last())
            .map(|o| o.name.clone())
            .ok_or_else(|| ServeError::artifact_load(path, "model has no outputs"))?;

        info!(
            input = %input_name,
            output = %output_name,
            num_features = num_features,
            threads = config.intra_threads,
            "started onnx"
        );

        Ok(Self {
            name: artifact_name(path),
            session: Mutex::new(session),
            input_name,
            output_name,
            num_features,
            scaling,
        })
    }

    fn run(&self, x: &[f64]) -> Result<f64, String> {
        let values: Vec<f32> = x.iter().map(|v| *v as f32).collect();
        let input = Tensor::from_array((vec![1_i64, values.len() as i64], values))
            .map_err(|e| format!("cannot build input tensor: {e}"))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| "session lock poisoned".to_string())?;
        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => input])
            .map_err(|e| e.to_string())?;

        score_from_outputs(&outputs, &self.output_name)
    }
}

impl ModelBackend for OnnxBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Onnx
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn num_features(&self) -> usize {
        self.num_features
    }

    fn predict(&self, features: &[f64]) -> ServeResult<f64> {
        check_features(self.num_features, features)?;
        let x = self.scaling.apply(features);
        let pred = self.run(&x).map_err(ServeError::BackendPrediction)?;
        debug!(model = %self.name, pred = pred, "Model predicted");
        ensure_finite(pred)
    }
}

/// Prefer the named output, then any non-label output
fn score_from_outputs(outputs: &SessionOutputs, output_name: &str) -> Result<f64, String> {
    if let Some(output) = outputs.get(output_name) {
        if let Some(score) = score_from_value(output) {
            return Ok(score);
        }
    }
    for (name, output) in outputs.iter() {
        if name.contains("label") {
            continue;
        }
        if let Some(score) = score_from_value(&output) {
            return Ok(score);
        }
    }
    Err("no scalar score in model outputs".to_string())
}

fn score_from_value(value: &DynValue) -> Option<f64> {
    if let Ok((shape, data)) = value.try_extract_tensor::<f32>() {
        // [batch, classes] or [classes]: class 1 when there are two or more
        let width = shape.last().copied().unwrap_or(1);
        return if width >= 2 {
            data.get(1).map(|v| *v as f64)
        } else {
            data.first().map(|v| *v as f64)
        };
    }

    // seq(map(int64, float)) as emitted by ZipMap classifiers
    if DynSequenceValueType::can_downcast(&value.dtype()) {
        let allocator = Allocator::default();
        let sequence = value.downcast_ref::<DynSequenceValueType>().ok()?;
        let maps = sequence
            .try_extract_sequence::<DynMapValueType>(&allocator)
            .ok()?;
        let pairs = maps.first()?.try_extract_key_values::<i64, f32>().ok()?;
        return pairs
            .iter()
            .find(|(class, _)| *class == 1)
            .map(|(_, p)| *p as f64)
            .or_else(|| pairs.first().map(|(_, p)| *p as f64));
    }

    None
}
