//! Bench Client
//!
//! Sends random feature vectors to a running feature server and reports call
//! latency percentiles.

use anyhow::{Context, Result};
use clap::Parser;
use feature_server::{FeatureClient, ServeError};
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "bench_client")]
struct Args {
    /// Server address, HOST:PORT
    address: String,

    /// Feature vector length the model expects
    #[arg(long, default_value_t = 4)]
    dim: usize,

    /// Number of measured calls
    #[arg(long, default_value_t = 1000)]
    requests: usize,

    /// Calls issued before measuring
    #[arg(long, default_value_t = 10)]
    warmup: usize,

    /// Pause between calls, in milliseconds
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,
}

/// Uniform [0, 1) feature vectors
struct VectorGenerator {
    rng: rand::rngs::ThreadRng,
    dim: usize,
}

impl VectorGenerator {
    fn new(dim: usize) -> Self {
        Self {
            rng: rand::thread_rng(),
            dim,
        }
    }

    fn generate(&mut self) -> Vec<f64> {
        (0..self.dim).map(|_| self.rng.gen_range(0.0..1.0)).collect()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("bench_client=info".parse()?),
        )
        .init();

    let args = Args::parse();
    info!(
        address = %args.address,
        dim = args.dim,
        requests = args.requests,
        warmup = args.warmup,
        "Starting bench client"
    );

    let mut client = FeatureClient::connect(args.address.as_str())
        .await
        .with_context(|| format!("Failed to connect to {}", args.address))?;
    info!(
        interface = %client.bootstrap().interface,
        schema_version = client.bootstrap().schema_version,
        "Connected"
    );

    let mut generator = VectorGenerator::new(args.dim);

    for _ in 0..args.warmup {
        client.compute_feature(&generator.generate()).await?;
    }

    let mut latencies_us = Vec::with_capacity(args.requests);
    let mut failures = 0usize;
    let started = Instant::now();

    for i in 0..args.requests {
        let features = generator.generate();
        let start = Instant::now();
        match client.compute_feature(&features).await {
            Ok(_) => latencies_us.push(start.elapsed().as_micros() as u64),
            Err(e @ ServeError::Protocol(_)) => return Err(e.into()),
            Err(e) => {
                failures += 1;
                warn!(error = %e, "Call failed");
            }
        }

        if (i + 1) % 100 == 0 {
            info!("Completed {}/{} calls", i + 1, args.requests);
        }
        if args.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(args.delay_ms)).await;
        }
    }

    let elapsed = started.elapsed().as_secs_f64();
    if latencies_us.is_empty() {
        anyhow::bail!("No successful calls ({failures} failed)");
    }

    info!(
        calls = latencies_us.len(),
        failures = failures,
        throughput = format!("{:.1} calls/s", latencies_us.len() as f64 / elapsed),
        mean_us = format!("{:.1}", mean(&latencies_us)),
        p50_us = format!("{:.1}", percentile(&latencies_us, 0.50)),
        p95_us = format!("{:.1}", percentile(&latencies_us, 0.95)),
        p99_us = format!("{:.1}", percentile(&latencies_us, 0.99)),
        "Benchmark complete"
    );

    Ok(())
}

fn mean(samples: &[u64]) -> f64 {
    samples.iter().sum::<u64>() as f64 / samples.len() as f64
}

/// Percentile with linear interpolation between ranks (rank = p * (n + 1), clamped to [1, n])
fn percentile(samples: &[u64], p: f64) -> f64 {
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    let n = sorted.len() as f64;

    let rank = if p <= 1.0 / (n + 1.0) {
        1.0
    } else if p < n / (n + 1.0) {
        p * (n + 1.0)
    } else {
        n
    };

    let index = rank.floor() as usize - 1;
    let mut value = sorted[index] as f64;
    let fraction = rank.fract();
    if fraction != 0.0 {
        value += fraction * (sorted[index + 1] as f64 - sorted[index] as f64);
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_interpolates() {
        let samples = [10, 20, 30, 40];
        // rank = 0.5 * 5 = 2.5 -> halfway between 20 and 30
        assert_eq!(percentile(&samples, 0.5), 25.0);
        assert_eq!(percentile(&samples, 0.0), 10.0);
        assert_eq!(percentile(&samples, 1.0), 40.0);
    }

    #[test]
    fn test_generator_dimension() {
        let mut generator = VectorGenerator::new(7);
        let v = generator.generate();
        assert_eq!(v.len(), 7);
        assert!(v.iter().all(|x| (0.0..1.0).contains(x)));
    }
}
