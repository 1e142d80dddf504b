//! Serving metrics and periodic summaries for the feature server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::info;

/// Keep at most this many latency samples
const MAX_SAMPLES: usize = 10_000;

/// Metrics collector for served calls
pub struct ServingMetrics {
    /// Calls answered, successful or not
    pub calls_served: AtomicU64,
    /// Calls answered with a failure
    pub calls_failed: AtomicU64,
    /// Connections accepted
    pub sessions_accepted: AtomicU64,
    /// Failures by error kind
    failures_by_kind: RwLock<HashMap<String, u64>>,
    /// Call latencies (in microseconds)
    call_times: RwLock<Vec<u64>>,
    /// Start time for rate calculation
    start_time: Instant,
}

impl ServingMetrics {
    pub fn new() -> Self {
        Self {
            calls_served: AtomicU64::new(0),
            calls_failed: AtomicU64::new(0),
            sessions_accepted: AtomicU64::new(0),
            failures_by_kind: RwLock::new(HashMap::new()),
            call_times: RwLock::new(Vec::with_capacity(1000)),
            start_time: Instant::now(),
        }
    }

    /// Record an answered call; `failure` names the error kind when it failed
    pub fn record_call(&self, elapsed: Duration, failure: Option<&str>) {
        self.calls_served.fetch_add(1, Ordering::Relaxed);

        if let Ok(mut times) = self.call_times.write() {
            times.push(elapsed.as_micros() as u64);
            if times.len() > MAX_SAMPLES {
                times.drain(0..MAX_SAMPLES / 2);
            }
        }

        if let Some(kind) = failure {
            self.record_failure(kind);
        }
    }

    /// Record a failure that is not tied to a dispatched call (e.g. an undecodable frame)
    pub fn record_failure(&self, kind: &str) {
        self.calls_failed.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut by_kind) = self.failures_by_kind.write() {
            *by_kind.entry(kind.to_string()).or_insert(0) += 1;
        }
    }

    pub fn record_session(&self) {
        self.sessions_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Latency statistics over the retained samples
    pub fn get_processing_stats(&self) -> ProcessingStats {
        let mut sorted = match self.call_times.read() {
            Ok(times) if !times.is_empty() => times.clone(),
            _ => return ProcessingStats::default(),
        };
        sorted.sort_unstable();

        let count = sorted.len();
        let sum: u64 = sorted.iter().sum();
        ProcessingStats {
            count: count as u64,
            mean_us: sum / count as u64,
            p50_us: sorted[count / 2],
            p95_us: sorted[(count as f64 * 0.95) as usize],
            p99_us: sorted[(count as f64 * 0.99) as usize],
            max_us: sorted[count - 1],
        }
    }

    /// Calls per second since startup
    pub fn get_throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.calls_served.load(Ordering::Relaxed) as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn get_failures_by_kind(&self) -> HashMap<String, u64> {
        self.failures_by_kind
            .read()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Log a summary of everything recorded so far
    pub fn print_summary(&self) {
        let calls = self.calls_served.load(Ordering::Relaxed);
        let failed = self.calls_failed.load(Ordering::Relaxed);
        let sessions = self.sessions_accepted.load(Ordering::Relaxed);
        let stats = self.get_processing_stats();

        info!(
            calls = calls,
            failed = failed,
            sessions = sessions,
            throughput = format!("{:.1} calls/s", self.get_throughput()),
            "Serving summary"
        );
        info!(
            mean_us = stats.mean_us,
            p50_us = stats.p50_us,
            p95_us = stats.p95_us,
            p99_us = stats.p99_us,
            max_us = stats.max_us,
            "Call latency"
        );
        for (kind, count) in self.get_failures_by_kind() {
            info!(kind = %kind, count = count, "Call failures");
        }
    }
}

impl Default for ServingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Call latency statistics
#[derive(Debug, Default)]
pub struct ProcessingStats {
    pub count: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

/// Logs a summary at a fixed interval
pub struct MetricsReporter {
    metrics: Arc<ServingMetrics>,
    interval_secs: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<ServingMetrics>, interval_secs: u64) -> Self {
        Self {
            metrics,
            interval_secs,
        }
    }

    /// Run forever; callers spawn this on the runtime
    pub async fn start(self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.interval_secs));
        // the first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            self.metrics.print_summary();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = ServingMetrics::new();

        metrics.record_call(Duration::from_micros(100), None);
        metrics.record_call(Duration::from_micros(300), Some("dimension_mismatch"));
        metrics.record_failure("malformed_call");
        metrics.record_session();

        assert_eq!(metrics.calls_served.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.calls_failed.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.sessions_accepted.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.get_failures_by_kind().get("dimension_mismatch"), Some(&1));
    }

    #[test]
    fn test_processing_stats() {
        let metrics = ServingMetrics::new();
        assert_eq!(metrics.get_processing_stats().count, 0);

        for us in 1..=100 {
            metrics.record_call(Duration::from_micros(us), None);
        }
        let stats = metrics.get_processing_stats();
        assert_eq!(stats.count, 100);
        assert_eq!(stats.mean_us, 50);
        assert_eq!(stats.p50_us, 51);
        assert_eq!(stats.max_us, 100);
    }
}
