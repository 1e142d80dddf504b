//! Configuration management for the feature server
//!
//! Layers, lowest priority first: built-in defaults, an optional TOML file,
//! then `FEATURE_SERVER__SECTION__KEY` environment variables.

use crate::error::ServeError;
use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "FEATURE_SERVER";

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub server: ConnectionConfig,
    pub backends: BackendsConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

/// Connection server tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Maximum calls of one session executing at the same time
    pub max_in_flight: usize,
    /// Largest accepted wire frame, in bytes
    pub max_frame_bytes: usize,
}

/// Per-backend settings, keyed by backend kind
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendsConfig {
    #[serde(default)]
    pub sklearn: SklearnConfig,
    #[serde(default)]
    pub spark: SparkConfig,
    #[serde(default)]
    pub onnx: OnnxConfig,
}

/// Local-estimator backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SklearnConfig {
    /// Each feature is divided by this before prediction
    pub input_scale: f64,
}

impl Default for SklearnConfig {
    fn default() -> Self {
        Self { input_scale: 1.0 }
    }
}

/// Distributed-compute backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparkConfig {
    /// Each feature is divided by this before prediction
    pub input_scale: f64,
    /// Application name reported by the compute context
    pub app_name: String,
    /// Compute master; only local masters are supported
    pub master: String,
    /// Executor memory setting, e.g. "2g"
    pub executor_memory: String,
    /// Serializer buffer size in MiB
    pub kryo_buffer_mb: u32,
}

impl Default for SparkConfig {
    fn default() -> Self {
        Self {
            input_scale: 255.0,
            app_name: "feature-server".to_string(),
            master: "local".to_string(),
            executor_memory: "2g".to_string(),
            kryo_buffer_mb: 128,
        }
    }
}

/// ONNX Runtime backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnnxConfig {
    /// Each feature is divided by this before prediction
    pub input_scale: f64,
    /// Number of intra-op threads for the session
    pub intra_threads: usize,
    /// Input width, required only when the model's input shape is dynamic
    #[serde(default)]
    pub num_features: Option<usize>,
}

impl Default for OnnxConfig {
    fn default() -> Self {
        Self {
            input_scale: 1.0,
            intra_threads: 1,
            num_features: None,
        }
    }
}

/// Metrics reporting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Seconds between summaries; 0 disables periodic reports
    pub report_interval_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty)
    pub format: String,
}

impl ServerConfig {
    /// Load configuration, layering an optional file between defaults and environment
    pub fn load_with(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(
            Config::try_from(&ServerConfig::default())
                .context("Failed to build default configuration")?,
        );

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        let config: ServerConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the server cannot run with
    pub fn validate(&self) -> Result<(), ServeError> {
        if self.server.max_in_flight == 0 {
            return Err(ServeError::Config("server.max_in_flight must be at least 1".into()));
        }
        if self.server.max_frame_bytes < 64 {
            return Err(ServeError::Config("server.max_frame_bytes is too small".into()));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            return Err(ServeError::Config(format!(
                "logging.format must be json or pretty, got {}",
                self.logging.format
            )));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server: ConnectionConfig {
                max_in_flight: 16,
                max_frame_bytes: 8 * 1024 * 1024,
            },
            backends: BackendsConfig::default(),
            metrics: MetricsConfig {
                report_interval_secs: 60,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }
}
