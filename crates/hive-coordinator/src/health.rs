use crate::events::{CoordinatorEvent, EventBus};
use crate::metrics::MetricsTracker;
use crate::registry::WorkerRegistry;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use hive_core::HiveError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Summary of one health cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: usize,
    pub unhealthy: usize,
    pub unhealthy_workers: Vec<String>,
    pub throughput_per_minute: f64,
    pub checked_at: DateTime<Utc>,
}

/// Periodically probes every worker and refreshes utilization metrics.
///
/// Unhealthy workers stay registered but are skipped by selection until a
/// later cycle sees them healthy again. The monitor never touches the queue.
/// At most one cycle runs at a time, whether from the timer or on demand.
pub struct HealthMonitor {
    registry: Arc<RwLock<WorkerRegistry>>,
    metrics: Arc<MetricsTracker>,
    events: EventBus,
    interval: Duration,
    probe_timeout: Duration,
    cycle: Mutex<()>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<RwLock<WorkerRegistry>>,
        metrics: Arc<MetricsTracker>,
        events: EventBus,
        interval: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            metrics,
            events,
            interval,
            probe_timeout,
            cycle: Mutex::new(()),
        }
    }

    /// Probe all workers once. Waits for a cycle already in flight to finish
    /// first.
    pub async fn run_cycle(&self) -> HealthReport {
        let _cycle = self.cycle.lock().await;
        let workers = self.registry.read().await.workers();

        // Probes run without holding the registry lock.
        let probes = join_all(workers.iter().map(|(name, worker)| async move {
            let healthy = match time::timeout(self.probe_timeout, worker.is_healthy()).await {
                Ok(healthy) => healthy,
                Err(_) => {
                    let timeout_ms = self.probe_timeout.as_millis() as u64;
                    warn!(worker = %name, timeout_ms, "Health probe timed out");
                    false
                }
            };
            (name.clone(), healthy, worker.workload().clamp(0.0, 1.0))
        }))
        .await;

        let mut utilization = HashMap::with_capacity(probes.len());
        let mut unhealthy_workers = Vec::new();
        let mut transitions = Vec::new();
        {
            let mut registry = self.registry.write().await;
            for (name, healthy, workload) in probes {
                // Removed mid-cycle: nothing to record.
                let Some(previous) = registry.record_health(&name, healthy, workload) else {
                    continue;
                };
                if previous != healthy {
                    transitions.push((name.clone(), healthy));
                }
                if !healthy {
                    unhealthy_workers.push(name.clone());
                }
                utilization.insert(name, workload);
            }
        }

        for (name, healthy) in transitions {
            if healthy {
                info!(worker = %name, "Worker recovered, back in rotation");
            } else {
                let err = HiveError::WorkerUnhealthy(name.clone());
                warn!(worker = %name, error = %err, "Worker excluded from selection");
            }
            self.events.publish(CoordinatorEvent::WorkerHealthChanged {
                worker: name,
                healthy,
            });
        }

        let unhealthy = unhealthy_workers.len();
        let healthy = utilization.len() - unhealthy;
        self.metrics.record_health_cycle(utilization, healthy, unhealthy);
        let throughput_per_minute = self.metrics.refresh_throughput(std::time::Instant::now());

        self.events.publish(CoordinatorEvent::HealthCheck { healthy, unhealthy });
        debug!(healthy, unhealthy, throughput_per_minute, "Health check complete");

        HealthReport {
            healthy,
            unhealthy,
            unhealthy_workers,
            throughput_per_minute,
            checked_at: Utc::now(),
        }
    }

    /// Run cycles on a fixed interval until `shutdown` flips to `true`.
    ///
    /// The first cycle fires one interval after start; a slow cycle delays the
    /// next tick rather than overlapping it.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_ms = self.interval.as_millis() as u64, "Health monitor started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_cycle().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Health monitor stopped");
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::worker::Worker;
    use async_trait::async_trait;
    use hive_core::{HiveResult, Task, WorkerOutput};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct ProbeWorker {
        healthy: AtomicBool,
        hang: bool,
        delay: Duration,
        probes: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ProbeWorker {
        fn new(healthy: bool) -> Self {
            Self {
                healthy: AtomicBool::new(healthy),
                hang: false,
                delay: Duration::ZERO,
                probes: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Worker for ProbeWorker {
        fn specialty(&self) -> &str {
            "general"
        }

        fn workload(&self) -> f64 {
            0.4
        }

        fn can_accept_task(&self, _task: &Task) -> bool {
            true
        }

        async fn process(&self, _task: &Task) -> HiveResult<WorkerOutput> {
            Ok(WorkerOutput::new("probe", serde_json::Value::Null, 1.0))
        }

        async fn is_healthy(&self) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.healthy.load(Ordering::SeqCst)
        }

        async fn shutdown(&self) {}
    }

    fn monitor(
        registry: Arc<RwLock<WorkerRegistry>>,
        events: EventBus,
    ) -> (HealthMonitor, Arc<MetricsTracker>) {
        let metrics = Arc::new(MetricsTracker::new());
        let monitor = HealthMonitor::new(
            registry,
            Arc::clone(&metrics),
            events,
            Duration::from_millis(20),
            Duration::from_millis(50),
        );
        (monitor, metrics)
    }

    #[tokio::test]
    async fn test_cycle_flags_unhealthy_workers() {
        let registry = Arc::new(RwLock::new(WorkerRegistry::new()));
        let flaky = Arc::new(ProbeWorker::new(false));
        {
            let mut r = registry.write().await;
            r.register("steady", Arc::new(ProbeWorker::new(true))).unwrap();
            r.register("flaky", Arc::clone(&flaky) as Arc<dyn Worker>).unwrap();
        }
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let (monitor, metrics) = monitor(Arc::clone(&registry), events);

        let report = monitor.run_cycle().await;
        assert_eq!(report.healthy, 1);
        assert_eq!(report.unhealthy, 1);
        assert_eq!(report.unhealthy_workers, vec!["flaky".to_string()]);

        let candidates = registry.read().await.healthy_candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].name, "steady");

        let snap = metrics.snapshot(0, 0);
        assert_eq!(snap.healthy_workers, 1);
        assert!((snap.worker_utilization["steady"] - 0.4).abs() < 1e-9);

        assert_eq!(
            rx.recv().await.unwrap(),
            CoordinatorEvent::WorkerHealthChanged {
                worker: "flaky".into(),
                healthy: false
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            CoordinatorEvent::HealthCheck {
                healthy: 1,
                unhealthy: 1
            }
        );

        // Recovery puts the worker back in rotation.
        flaky.healthy.store(true, Ordering::SeqCst);
        let report = monitor.run_cycle().await;
        assert_eq!(report.unhealthy, 0);
        assert_eq!(registry.read().await.healthy_candidates().len(), 2);
    }

    #[tokio::test]
    async fn test_hanging_probe_counts_as_unhealthy() {
        let registry = Arc::new(RwLock::new(WorkerRegistry::new()));
        registry
            .write()
            .await
            .register(
                "stuck",
                Arc::new(ProbeWorker {
                    hang: true,
                    ..ProbeWorker::new(true)
                }),
            )
            .unwrap();
        let (monitor, _) = monitor(Arc::clone(&registry), EventBus::new(4));
        let report = monitor.run_cycle().await;
        assert_eq!(report.unhealthy_workers, vec!["stuck".to_string()]);
    }

    #[tokio::test]
    async fn test_spawned_monitor_runs_and_stops() {
        let registry = Arc::new(RwLock::new(WorkerRegistry::new()));
        let worker = Arc::new(ProbeWorker::new(true));
        registry
            .write()
            .await
            .register("w", Arc::clone(&worker) as Arc<dyn Worker>)
            .unwrap();
        let (monitor, metrics) = monitor(Arc::clone(&registry), EventBus::new(16));

        let (tx, rx) = watch::channel(false);
        let handle = Arc::new(monitor).spawn(rx);
        tokio::time::sleep(Duration::from_millis(120)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(worker.probes.load(Ordering::SeqCst) >= 2);
        assert!(metrics.snapshot(0, 0).last_health_check.is_some());
    }

    #[tokio::test]
    async fn test_cycles_never_overlap() {
        let registry = Arc::new(RwLock::new(WorkerRegistry::new()));
        let worker = Arc::new(ProbeWorker {
            delay: Duration::from_millis(100),
            ..ProbeWorker::new(true)
        });
        registry
            .write()
            .await
            .register("slow", Arc::clone(&worker) as Arc<dyn Worker>)
            .unwrap();
        let (monitor, _) = monitor(Arc::clone(&registry), EventBus::new(16));
        let monitor = Arc::new(HealthMonitor {
            probe_timeout: Duration::from_secs(1),
            ..monitor
        });

        let (tx, rx) = watch::channel(false);
        let handle = Arc::clone(&monitor).spawn(rx);
        // The first tick at 20ms is still probing when these arrive.
        tokio::time::sleep(Duration::from_millis(40)).await;
        let (a, b) = tokio::join!(monitor.run_cycle(), monitor.run_cycle());
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(a.healthy, 1);
        assert_eq!(b.healthy, 1);
        assert!(worker.probes.load(Ordering::SeqCst) >= 3);
        assert_eq!(worker.peak.load(Ordering::SeqCst), 1);
    }
}
