use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

/// Read-only metrics snapshot returned by `Coordinator::metrics`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorMetrics {
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub pending_tasks: usize,
    pub active_tasks: usize,
    /// Incremental mean over successfully processed tasks.
    pub average_processing_ms: f64,
    pub consensus_attempts: u64,
    pub consensus_accepted: u64,
    /// `consensus_accepted / consensus_attempts`, 0 before the first attempt.
    pub consensus_success_rate: f64,
    /// Workload reading per worker from the last health cycle.
    pub worker_utilization: HashMap<String, f64>,
    /// Completed tasks per minute, estimated between health cycles.
    pub throughput_per_minute: f64,
    pub healthy_workers: usize,
    pub unhealthy_workers: usize,
    pub last_health_check: Option<DateTime<Utc>>,
    pub uptime_ms: u64,
}

struct MetricsState {
    total: u64,
    completed: u64,
    failed: u64,
    average_processing_ms: f64,
    consensus_attempts: u64,
    consensus_accepted: u64,
    utilization: HashMap<String, f64>,
    throughput_per_minute: f64,
    throughput_baseline: (u64, Instant),
    healthy_workers: usize,
    unhealthy_workers: usize,
    last_health_check: Option<DateTime<Utc>>,
}

/// Aggregate counters shared by the execution engine and the health monitor.
///
/// Counters only grow; readers may observe a snapshot that is one update
/// behind, which is fine for monitoring.
pub struct MetricsTracker {
    state: RwLock<MetricsState>,
    started_at: Instant,
}

impl MetricsTracker {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            state: RwLock::new(MetricsState {
                total: 0,
                completed: 0,
                failed: 0,
                average_processing_ms: 0.0,
                consensus_attempts: 0,
                consensus_accepted: 0,
                utilization: HashMap::new(),
                throughput_per_minute: 0.0,
                throughput_baseline: (0, now),
                healthy_workers: 0,
                unhealthy_workers: 0,
                last_health_check: None,
            }),
            started_at: now,
        }
    }

    pub fn record_submitted(&self) {
        self.state.write().total += 1;
    }

    /// Count a completion and fold its duration into the running mean.
    pub fn record_completed(&self, duration_ms: u64) {
        let mut state = self.state.write();
        state.completed += 1;
        let n = state.completed as f64;
        state.average_processing_ms += (duration_ms as f64 - state.average_processing_ms) / n;
    }

    pub fn record_failed(&self) {
        self.state.write().failed += 1;
    }

    pub fn record_consensus(&self, accepted: bool) {
        let mut state = self.state.write();
        state.consensus_attempts += 1;
        if accepted {
            state.consensus_accepted += 1;
        }
    }

    /// Store the outcome of a health cycle.
    pub fn record_health_cycle(
        &self,
        utilization: HashMap<String, f64>,
        healthy: usize,
        unhealthy: usize,
    ) {
        let mut state = self.state.write();
        state.utilization = utilization;
        state.healthy_workers = healthy;
        state.unhealthy_workers = unhealthy;
        state.last_health_check = Some(Utc::now());
    }

    /// Recompute throughput as completions since the previous call scaled to
    /// a per-minute rate. Not a sliding window.
    pub fn refresh_throughput(&self, now: Instant) -> f64 {
        let mut state = self.state.write();
        let (baseline_completed, baseline_at) = state.throughput_baseline;
        let elapsed_minutes = now.saturating_duration_since(baseline_at).as_secs_f64() / 60.0;
        if elapsed_minutes > 0.0 {
            let delta = state.completed.saturating_sub(baseline_completed);
            state.throughput_per_minute = delta as f64 / elapsed_minutes;
            state.throughput_baseline = (state.completed, now);
        }
        state.throughput_per_minute
    }

    pub fn forget_worker(&self, name: &str) {
        self.state.write().utilization.remove(name);
    }

    /// Snapshot the counters; queue depths come from the caller.
    pub fn snapshot(&self, pending: usize, active: usize) -> CoordinatorMetrics {
        let state = self.state.read();
        let consensus_success_rate = if state.consensus_attempts == 0 {
            0.0
        } else {
            state.consensus_accepted as f64 / state.consensus_attempts as f64
        };
        CoordinatorMetrics {
            total_tasks: state.total,
            completed_tasks: state.completed,
            failed_tasks: state.failed,
            pending_tasks: pending,
            active_tasks: active,
            average_processing_ms: state.average_processing_ms,
            consensus_attempts: state.consensus_attempts,
            consensus_accepted: state.consensus_accepted,
            consensus_success_rate,
            worker_utilization: state.utilization.clone(),
            throughput_per_minute: state.throughput_per_minute,
            healthy_workers: state.healthy_workers,
            unhealthy_workers: state.unhealthy_workers,
            last_health_check: state.last_health_check,
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
        }
    }
}

impl Default for MetricsTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_initial_snapshot() {
        let metrics = MetricsTracker::new();
        let snap = metrics.snapshot(0, 0);
        assert_eq!(snap.total_tasks, 0);
        assert_eq!(snap.consensus_success_rate, 0.0);
        assert!(snap.last_health_check.is_none());
    }

    #[test]
    fn test_incremental_mean() {
        let metrics = MetricsTracker::new();
        metrics.record_completed(100);
        metrics.record_completed(200);
        metrics.record_completed(600);
        let snap = metrics.snapshot(0, 0);
        assert_eq!(snap.completed_tasks, 3);
        assert!((snap.average_processing_ms - 300.0).abs() < 1e-9);
    }

    #[test]
    fn test_counts() {
        let metrics = MetricsTracker::new();
        metrics.record_submitted();
        metrics.record_submitted();
        metrics.record_failed();
        let snap = metrics.snapshot(1, 0);
        assert_eq!(snap.total_tasks, 2);
        assert_eq!(snap.failed_tasks, 1);
        assert_eq!(snap.pending_tasks, 1);
    }

    #[test]
    fn test_consensus_rate() {
        let metrics = MetricsTracker::new();
        metrics.record_consensus(true);
        metrics.record_consensus(false);
        metrics.record_consensus(true);
        metrics.record_consensus(true);
        let snap = metrics.snapshot(0, 0);
        assert_eq!(snap.consensus_attempts, 4);
        assert_eq!(snap.consensus_accepted, 3);
        assert!((snap.consensus_success_rate - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_throughput_scaled_rate() {
        let metrics = MetricsTracker::new();
        let start = Instant::now();
        metrics.refresh_throughput(start);
        for _ in 0..5 {
            metrics.record_completed(10);
        }
        let rate = metrics.refresh_throughput(start + Duration::from_secs(30));
        assert!((rate - 10.0).abs() < 1e-6);

        // Nothing completed in the next window.
        let rate = metrics.refresh_throughput(start + Duration::from_secs(90));
        assert_eq!(rate, 0.0);
    }

    #[test]
    fn test_health_cycle_and_forget() {
        let metrics = MetricsTracker::new();
        let mut utilization = HashMap::new();
        utilization.insert("coder".to_string(), 0.5);
        utilization.insert("hunter".to_string(), 0.0);
        metrics.record_health_cycle(utilization, 1, 1);

        let snap = metrics.snapshot(0, 0);
        assert_eq!(snap.healthy_workers, 1);
        assert_eq!(snap.unhealthy_workers, 1);
        assert_eq!(snap.worker_utilization["coder"], 0.5);
        assert!(snap.last_health_check.is_some());

        metrics.forget_worker("coder");
        assert!(!metrics.snapshot(0, 0).worker_utilization.contains_key("coder"));
    }
}
