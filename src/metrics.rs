//! Latency and throughput accounting for the echo harness.
//!
//! Round-trip times are recorded in an HDR histogram so the summary can
//! report meaningful percentiles rather than just an average.

use anyhow::Result;
use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Accumulates round-trip latencies in microseconds.
pub struct LatencyRecorder {
    histogram: Histogram<u64>,
}

impl LatencyRecorder {
    pub fn new() -> Result<LatencyRecorder> {
        Ok(LatencyRecorder {
            histogram: Histogram::new(3)?,
        })
    }

    pub fn record(&mut self, latency: Duration) {
        let micros = latency.as_micros().min(u64::MAX as u128) as u64;
        // Auto-resizing histogram; recording cannot fail for in-range values.
        let _ = self.histogram.record(micros.max(1));
    }

    pub fn summary(&self) -> LatencySummary {
        LatencySummary {
            count: self.histogram.len(),
            mean_us: self.histogram.mean(),
            p50_us: self.histogram.value_at_quantile(0.50),
            p95_us: self.histogram.value_at_quantile(0.95),
            p99_us: self.histogram.value_at_quantile(0.99),
            max_us: self.histogram.max(),
        }
    }
}

/// Percentile summary of recorded round-trip latencies.
#[derive(Debug, Clone, Serialize)]
pub struct LatencySummary {
    pub count: u64,
    pub mean_us: f64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

/// The JSON-serializable record of one harness run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub timestamp: DateTime<Utc>,
    pub echoers: usize,
    pub message_size: usize,
    pub simulated_latency_ms: u64,
    pub elapsed_ms: u64,
    pub total_bytes: u64,
    pub throughput_mbps: f64,
    pub latency: LatencySummary,
}

impl RunSummary {
    pub fn new(
        echoers: usize,
        message_size: usize,
        simulated_latency_ms: u64,
        elapsed: Duration,
        latency: LatencySummary,
    ) -> RunSummary {
        let total_bytes = (echoers * message_size * 2) as u64;
        let throughput_mbps = if elapsed.as_secs_f64() > 0.0 {
            total_bytes as f64 / elapsed.as_secs_f64() / 1_000_000.0
        } else {
            0.0
        };
        RunSummary {
            timestamp: Utc::now(),
            echoers,
            message_size,
            simulated_latency_ms,
            elapsed_ms: elapsed.as_millis() as u64,
            total_bytes,
            throughput_mbps,
            latency,
        }
    }

    /// Log the human-readable summary.
    pub fn print(&self) {
        info!(
            "completed {} echo round trips of {} bytes in {} ms ({:.1} MB/s)",
            self.echoers, self.message_size, self.elapsed_ms, self.throughput_mbps
        );
        info!(
            "round-trip latency: mean {:.0} us, p50 {} us, p95 {} us, p99 {} us, max {} us",
            self.latency.mean_us,
            self.latency.p50_us,
            self.latency.p95_us,
            self.latency.p99_us,
            self.latency.max_us
        );
    }

    /// Write the summary as pretty-printed JSON.
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        info!("run summary written to {}", path.display());
        Ok(())
    }
}
