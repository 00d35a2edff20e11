use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Point-in-time copy of the rolling execution counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    /// Milliseconds.
    pub average_execution_time: f64,
    /// Bytes.
    pub peak_memory_usage: u64,
    pub security_violations: u64,
    pub timeouts: u64,
}

/// Process-wide counters shared by every execution of one executor.
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    inner: Mutex<Metrics>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Metrics> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record one finished attempt. Call exactly once per attempt.
    pub fn record_attempt(&self, success: bool, duration: Duration, memory_bytes: u64) {
        let mut metrics = self.lock();
        metrics.total_executions += 1;
        if success {
            metrics.successful_executions += 1;
        } else {
            metrics.failed_executions += 1;
        }

        let n = metrics.total_executions as f64;
        let duration_ms = duration.as_secs_f64() * 1000.0;
        metrics.average_execution_time =
            (metrics.average_execution_time * (n - 1.0) + duration_ms) / n;
        metrics.peak_memory_usage = metrics.peak_memory_usage.max(memory_bytes);
    }

    pub fn record_security_violation(&self) {
        self.lock().security_violations += 1;
    }

    pub fn record_timeout(&self) {
        self.lock().timeouts += 1;
    }

    pub fn snapshot(&self) -> Metrics {
        self.lock().clone()
    }
}
