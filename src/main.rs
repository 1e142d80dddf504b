//! Feature Server - Main Entry Point
//!
//! Loads one model artifact, binds the endpoint and serves `computeFeature`
//! until the process is terminated.

use anyhow::{Context, Result};
use clap::Parser;
use feature_server::{
    cli::Cli,
    config::{LoggingConfig, ServerConfig},
    metrics::{MetricsReporter, ServingMetrics},
    models::{self, BackendKind},
    ConnectionServer, FeatureCapability,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = ServerConfig::load_with(cli.config.as_deref())?;
    init_logging(&config.logging)?;

    info!("Starting feature server");

    // Reject bad arguments before touching the artifact or the network
    let kind = cli.backend_kind().with_context(|| {
        let supported: Vec<&str> = BackendKind::supported().iter().map(|k| k.as_str()).collect();
        format!("Supported backend kinds: {}", supported.join("|"))
    })?;
    let address = cli.bind_address()?;

    // Load the model; may start a compute context
    let backends = config.backends.clone();
    let model_path = cli.model_path.clone();
    let backend = tokio::task::spawn_blocking(move || models::load(kind, &model_path, &backends))
        .await
        .context("Model loading task failed")??;
    let capability = Arc::new(FeatureCapability::new(backend));

    let metrics = Arc::new(ServingMetrics::new());
    let server = ConnectionServer::new(config.server.clone(), metrics.clone())
        .bind(&address)
        .await?;
    info!(
        local_addr = %server.local_addr(),
        kind = %kind,
        model = %cli.model_path.display(),
        "Listening"
    );

    if config.metrics.report_interval_secs > 0 {
        let reporter = MetricsReporter::new(metrics, config.metrics.report_interval_secs);
        tokio::spawn(reporter.start());
    }

    match server.serve(capability).await {}
}

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("feature_server={}", logging.level)))
        .context("Invalid log level")?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}
