//! Per-node execution counters

use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    successful: u64,
    failed: u64,
    total_time: Duration,
    min_time: Option<Duration>,
    max_time: Duration,
}

/// Execution statistics for one node, shared by every run of a graph
#[derive(Debug, Default)]
pub struct NodeMetrics {
    counters: Mutex<Counters>,
}

/// Point-in-time copy of [`NodeMetrics`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub min_duration_ms: f64,
    pub max_duration_ms: f64,
}

impl NodeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, elapsed: Duration, success: bool) {
        let mut c = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        c.total += 1;
        if success {
            c.successful += 1;
        } else {
            c.failed += 1;
        }
        c.total_time += elapsed;
        c.min_time = Some(c.min_time.map_or(elapsed, |m| m.min(elapsed)));
        c.max_time = c.max_time.max(elapsed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let ms = |d: Duration| d.as_micros() as f64 / 1000.0;
        let (avg, rate) = if c.total == 0 {
            (0.0, 0.0)
        } else {
            (
                ms(c.total_time) / c.total as f64,
                c.successful as f64 / c.total as f64,
            )
        };
        MetricsSnapshot {
            total_executions: c.total,
            successful_executions: c.successful,
            failed_executions: c.failed,
            success_rate: rate,
            avg_duration_ms: avg,
            min_duration_ms: c.min_time.map(ms).unwrap_or(0.0),
            max_duration_ms: ms(c.max_time),
        }
    }

    pub fn reset(&self) {
        *self.counters.lock().unwrap_or_else(|e| e.into_inner()) = Counters::default();
    }
}
