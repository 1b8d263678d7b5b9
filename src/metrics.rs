use anyhow::Result;
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Latency summary of one consumer replica
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyMetrics {
    pub min_ns: u64,
    pub max_ns: u64,
    pub mean_ns: f64,
    pub p99_ns: u64,
    pub total_samples: usize,
}

impl LatencyMetrics {
    /// Mean latency in milliseconds, the unit summaries are reported in
    pub fn mean_ms(&self) -> f64 {
        self.mean_ns / 1_000_000.0
    }
}

/// Throughput metrics of one replica
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThroughputMetrics {
    pub messages_per_second: f64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Time between the first and the last recorded message
    pub duration_ns: u64,
}

/// Point-in-time view of a replica's counters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaSnapshot {
    pub replica: usize,
    pub throughput: ThroughputMetrics,
    pub latency: Option<LatencyMetrics>,
}

/// Latency collector using HDR histogram for accurate measurement
pub struct LatencyCollector {
    histogram: Histogram<u64>,
    sample_count: usize,
}

impl LatencyCollector {
    /// Create a new latency collector
    pub fn new() -> Result<Self> {
        // 3 significant figures, auto-resizing
        let histogram = Histogram::<u64>::new(3)?;

        Ok(Self {
            histogram,
            sample_count: 0,
        })
    }

    /// Record a latency measurement
    pub fn record(&mut self, latency: Duration) -> Result<()> {
        let latency_ns = latency.as_nanos() as u64;
        self.histogram.record(latency_ns)?;
        self.sample_count += 1;
        Ok(())
    }

    /// Get the current metrics, `None` before the first sample
    pub fn get_metrics(&self) -> Option<LatencyMetrics> {
        if self.sample_count == 0 {
            return None;
        }

        Some(LatencyMetrics {
            min_ns: self.histogram.min(),
            max_ns: self.histogram.max(),
            mean_ns: self.histogram.mean(),
            p99_ns: self.histogram.value_at_percentile(99.0),
            total_samples: self.sample_count,
        })
    }
}

/// Throughput calculator for measuring message rates
///
/// The rate window opens at the first recorded message and closes at the
/// latest one, so idle time before the first message (a consumer waiting for
/// publishers to start) does not dilute the figure.
#[derive(Default)]
pub struct ThroughputCalculator {
    first_message_at: Option<Instant>,
    last_message_at: Option<Instant>,
    message_count: u64,
    byte_count: u64,
}

impl ThroughputCalculator {
    /// Create a new throughput calculator
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a message transmission
    pub fn record_message(&mut self, message_size: usize) {
        self.record_message_at(message_size, Instant::now());
    }

    fn record_message_at(&mut self, message_size: usize, at: Instant) {
        if self.first_message_at.is_none() {
            self.first_message_at = Some(at);
        }
        self.last_message_at = Some(at);
        self.message_count += 1;
        self.byte_count += message_size as u64;
    }

    /// Number of messages recorded so far
    pub fn message_count(&self) -> u64 {
        self.message_count
    }

    /// Get current throughput metrics
    pub fn get_metrics(&self) -> ThroughputMetrics {
        let window = match (self.first_message_at, self.last_message_at) {
            (Some(first), Some(last)) => last.duration_since(first),
            _ => Duration::ZERO,
        };
        let duration_secs = window.as_secs_f64();

        let messages_per_second = if duration_secs > 0.0 {
            self.message_count as f64 / duration_secs
        } else {
            0.0
        };

        ThroughputMetrics {
            messages_per_second,
            total_messages: self.message_count,
            total_bytes: self.byte_count,
            duration_ns: window.as_nanos() as u64,
        }
    }
}

struct ReplicaCounters {
    throughput: ThroughputCalculator,
    latency: Option<LatencyCollector>,
}

/// Statistics of one client replica, shared between the replica task and
/// whoever asks the client for its figures.
pub struct ReplicaStats {
    replica: usize,
    counters: Mutex<ReplicaCounters>,
}

impl ReplicaStats {
    /// Stats for a publisher replica (throughput only)
    pub fn for_publisher(replica: usize) -> Self {
        Self {
            replica,
            counters: Mutex::new(ReplicaCounters {
                throughput: ThroughputCalculator::new(),
                latency: None,
            }),
        }
    }

    /// Stats for a consumer replica (throughput and latency)
    pub fn for_consumer(replica: usize) -> Result<Self> {
        Ok(Self {
            replica,
            counters: Mutex::new(ReplicaCounters {
                throughput: ThroughputCalculator::new(),
                latency: Some(LatencyCollector::new()?),
            }),
        })
    }

    /// Record one message; returns the replica's message count including it
    pub fn record(&self, message_size: usize, latency: Option<Duration>) -> Result<u64> {
        let mut counters = self.counters.lock();
        counters.throughput.record_message(message_size);
        if let (Some(collector), Some(latency)) = (counters.latency.as_mut(), latency) {
            collector.record(latency)?;
        }
        Ok(counters.throughput.message_count())
    }

    pub fn message_count(&self) -> u64 {
        self.counters.lock().throughput.message_count()
    }

    pub fn snapshot(&self) -> ReplicaSnapshot {
        let counters = self.counters.lock();
        ReplicaSnapshot {
            replica: self.replica,
            throughput: counters.throughput.get_metrics(),
            latency: counters
                .latency
                .as_ref()
                .and_then(LatencyCollector::get_metrics),
        }
    }
}

/// Client-level aggregation over replica snapshots
pub mod aggregate {
    use super::ReplicaSnapshot;

    /// Mean of the replicas' message rates; 0 with no replicas
    pub fn mean_tps(snapshots: &[ReplicaSnapshot]) -> f64 {
        if snapshots.is_empty() {
            return 0.0;
        }
        snapshots
            .iter()
            .map(|s| s.throughput.messages_per_second)
            .sum::<f64>()
            / snapshots.len() as f64
    }

    /// Mean of the per-replica mean latencies in milliseconds
    ///
    /// Replicas that never received a message are left out; 0 when none did.
    pub fn mean_latency_ms(snapshots: &[ReplicaSnapshot]) -> f64 {
        let means: Vec<f64> = snapshots
            .iter()
            .filter_map(|s| s.latency.as_ref().map(|l| l.mean_ms()))
            .collect();
        if means.is_empty() {
            return 0.0;
        }
        means.iter().sum::<f64>() / means.len() as f64
    }

    pub fn total_messages(snapshots: &[ReplicaSnapshot]) -> u64 {
        snapshots.iter().map(|s| s.throughput.total_messages).sum()
    }
}

/// Utility functions for metrics formatting
pub mod utils {
    /// Format latency value for human-readable output
    pub fn format_latency(latency_ns: u64) -> String {
        if latency_ns < 1_000 {
            format!("{}ns", latency_ns)
        } else if latency_ns < 1_000_000 {
            format!("{:.2}μs", latency_ns as f64 / 1_000.0)
        } else if latency_ns < 1_000_000_000 {
            format!("{:.2}ms", latency_ns as f64 / 1_000_000.0)
        } else {
            format!("{:.2}s", latency_ns as f64 / 1_000_000_000.0)
        }
    }
}
