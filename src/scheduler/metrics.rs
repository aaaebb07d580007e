// Scheduler counters and the stats views exposed to callers

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::ErrorKind;
use crate::scheduler::types::Priority;

#[derive(Default)]
pub struct SchedulerMetrics {
    total_requests: AtomicU64,
    total_batches: AtomicU64,
    batched_requests: AtomicU64,
    processing_time_ms: AtomicU64,
    failed_requests: AtomicU64,
    timed_out_requests: AtomicU64,
    by_priority: [AtomicU64; Priority::COUNT],
    failures_by_kind: Mutex<HashMap<ErrorKind, u64>>,
}

impl SchedulerMetrics {
    pub fn record_submission(&self, priority: Priority) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.by_priority[priority.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch(&self, size: usize, elapsed: Duration) {
        self.total_batches.fetch_add(1, Ordering::Relaxed);
        self.batched_requests.fetch_add(size as u64, Ordering::Relaxed);
        self.processing_time_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self, kind: ErrorKind) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        *self.failures_by_kind.lock().unwrap().entry(kind).or_insert(0) += 1;
    }

    pub fn record_timeout(&self) {
        self.timed_out_requests.fetch_add(1, Ordering::Relaxed);
        *self
            .failures_by_kind
            .lock()
            .unwrap()
            .entry(ErrorKind::Timeout)
            .or_insert(0) += 1;
    }

    pub fn perf_stats(&self) -> PerfStats {
        let total = self.total_requests.load(Ordering::Relaxed);
        let batches = self.total_batches.load(Ordering::Relaxed);
        let failed = self.failed_requests.load(Ordering::Relaxed);

        let by_priority = Priority::HIGHEST_FIRST
            .iter()
            .map(|p| {
                (
                    p.name().to_string(),
                    self.by_priority[p.index()].load(Ordering::Relaxed),
                )
            })
            .collect();

        let failures_by_kind = self
            .failures_by_kind
            .lock()
            .unwrap()
            .iter()
            .map(|(kind, count)| (kind.to_string(), *count))
            .collect();

        PerfStats {
            total_requests: total,
            total_batches: batches,
            failed_requests: failed,
            timed_out_requests: self.timed_out_requests.load(Ordering::Relaxed),
            success_rate: (total.saturating_sub(failed)) as f64 / total.max(1) as f64,
            avg_batch_size: self.batched_requests.load(Ordering::Relaxed) as f64
                / batches.max(1) as f64,
            avg_processing_time_ms: self.processing_time_ms.load(Ordering::Relaxed) as f64
                / batches.max(1) as f64,
            requests_by_priority: by_priority,
            failures_by_kind,
        }
    }
}

/// Aggregate performance statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PerfStats {
    pub total_requests: u64,
    pub total_batches: u64,
    pub failed_requests: u64,
    pub timed_out_requests: u64,
    pub success_rate: f64,
    pub avg_batch_size: f64,
    pub avg_processing_time_ms: f64,
    pub requests_by_priority: HashMap<String, u64>,
    pub failures_by_kind: HashMap<String, u64>,
}

/// Point-in-time queue occupancy.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub per_priority: HashMap<String, usize>,
    pub pending: usize,
    pub in_flight_batch: usize,
    pub capacity_per_level: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_and_rates() {
        let metrics = SchedulerMetrics::default();
        for _ in 0..8 {
            metrics.record_submission(Priority::Normal);
        }
        metrics.record_batch(4, Duration::from_millis(100));
        metrics.record_batch(4, Duration::from_millis(300));
        metrics.record_failure(ErrorKind::InferenceFailed);

        let stats = metrics.perf_stats();
        assert_eq!(stats.total_requests, 8);
        assert_eq!(stats.total_batches, 2);
        assert_eq!(stats.avg_batch_size, 4.0);
        assert_eq!(stats.avg_processing_time_ms, 200.0);
        assert_eq!(stats.failed_requests, 1);
        assert!((stats.success_rate - 7.0 / 8.0).abs() < 1e-9);
        assert_eq!(stats.failures_by_kind.get("INFERENCE_FAILED"), Some(&1));
        assert_eq!(stats.requests_by_priority.get("normal"), Some(&8));
    }

    #[test]
    fn empty_metrics_do_not_divide_by_zero() {
        let stats = SchedulerMetrics::default().perf_stats();
        assert_eq!(stats.success_rate, 0.0);
        assert_eq!(stats.avg_batch_size, 0.0);
    }
}
