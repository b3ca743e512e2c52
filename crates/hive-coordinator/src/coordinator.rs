use crate::builtins::{builtin_workers, DEFAULT_CAPACITY};
use crate::config::CoordinatorConfig;
use crate::events::{CoordinatorEvent, EventBus, WorkerEvent, WorkerEventSender};
use crate::execution::ExecutionEngine;
use crate::health::{HealthMonitor, HealthReport};
use crate::metrics::{CoordinatorMetrics, MetricsTracker};
use crate::registry::{WorkerRecord, WorkerRegistry};
use crate::task_queue::TaskQueue;
use crate::worker::Worker;
use chrono::Utc;
use futures_util::future::join_all;
use hive_core::{
    FailureKind, HiveError, HiveResult, Task, TaskFailure, TaskId, TaskOptions, TaskOutcome,
    TaskStatus,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

/// Where a coordinator is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Stopped => write!(f, "stopped"),
            LifecycleState::Starting => write!(f, "starting"),
            LifecycleState::Running => write!(f, "running"),
            LifecycleState::Stopping => write!(f, "stopping"),
        }
    }
}

/// Handles of the loops spawned by `start`.
struct Background {
    shutdown: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
    forwarder_shutdown: watch::Sender<bool>,
    forwarder: JoinHandle<()>,
}

/// Owns a task queue and a worker registry and runs submitted tasks against
/// the registered workers.
///
/// Submission is fire-and-forget: execution failures never reach the caller
/// of [`submit`](Self::submit) and are read back through
/// [`error`](Self::error) or [`await_result`](Self::await_result).
pub struct Coordinator {
    config: CoordinatorConfig,
    state: parking_lot::RwLock<LifecycleState>,
    queue: Arc<RwLock<TaskQueue>>,
    registry: Arc<RwLock<WorkerRegistry>>,
    metrics: Arc<MetricsTracker>,
    events: EventBus,
    engine: Arc<ExecutionEngine>,
    monitor: Arc<HealthMonitor>,
    sequence: AtomicU64,
    worker_events: parking_lot::Mutex<Option<WorkerEventSender>>,
    /// Built-ins registered by `start`; `stop` deregisters them.
    builtins: parking_lot::Mutex<Vec<String>>,
    background: parking_lot::Mutex<Option<Background>>,
}

impl Coordinator {
    /// Build a stopped coordinator. Fails if the config does not validate.
    pub fn new(config: CoordinatorConfig) -> HiveResult<Self> {
        config.validate()?;

        let queue = Arc::new(RwLock::new(TaskQueue::new()));
        let registry = Arc::new(RwLock::new(WorkerRegistry::new()));
        let metrics = Arc::new(MetricsTracker::new());
        let events = EventBus::new(config.event_buffer);
        let engine = Arc::new(ExecutionEngine::new(
            &config,
            Arc::clone(&queue),
            Arc::clone(&metrics),
            events.clone(),
        ));
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&registry),
            Arc::clone(&metrics),
            events.clone(),
            config.health_check_interval(),
            config.health_check_timeout(),
        ));

        Ok(Self {
            config,
            state: parking_lot::RwLock::new(LifecycleState::Stopped),
            queue,
            registry,
            metrics,
            events,
            engine,
            monitor,
            sequence: AtomicU64::new(0),
            worker_events: parking_lot::Mutex::new(None),
            builtins: parking_lot::Mutex::new(Vec::new()),
            background: parking_lot::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.read()
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// Register a worker. While running it is subscribed to the worker event
    /// channel immediately and becomes selectable on the next dispatch.
    pub async fn add_worker(
        &self,
        name: impl Into<String>,
        worker: Arc<dyn Worker>,
    ) -> HiveResult<()> {
        let name = name.into();
        let specialty = worker.specialty().to_string();
        self.registry
            .write()
            .await
            .register(name.clone(), Arc::clone(&worker))?;

        let sender = self.worker_events.lock().clone();
        if let Some(tx) = sender {
            worker.subscribe(tx);
        }

        info!(worker = %name, specialty = %specialty, "Worker added");
        self.events.publish(CoordinatorEvent::WorkerAdded {
            worker: name,
            specialty,
        });
        Ok(())
    }

    /// Unregister a worker, shut it down, and hand it back.
    ///
    /// Tasks it is already running are not interrupted.
    pub async fn remove_worker(&self, name: &str) -> HiveResult<Arc<dyn Worker>> {
        let worker = self.registry.write().await.remove(name)?;
        self.builtins.lock().retain(|builtin| builtin != name);
        worker.shutdown().await;
        self.metrics.forget_worker(name);

        info!(worker = %name, "Worker removed");
        self.events.publish(CoordinatorEvent::WorkerRemoved {
            worker: name.to_string(),
        });
        Ok(worker)
    }

    pub async fn workers(&self) -> Vec<WorkerRecord> {
        self.registry.read().await.records()
    }

    async fn deregister_builtins(&self) {
        let names = std::mem::take(&mut *self.builtins.lock());
        if names.is_empty() {
            return;
        }
        let mut registry = self.registry.write().await;
        for name in &names {
            // Already gone if the caller removed it by hand.
            if registry.remove(name).is_ok() {
                self.metrics.forget_worker(name);
            }
        }
        debug!(workers = ?names, "Built-in workers deregistered");
    }

    /// Start the background loops. A no-op unless the coordinator is stopped.
    pub async fn start(&self) -> HiveResult<()> {
        {
            let mut state = self.state.write();
            let current = *state;
            if current != LifecycleState::Stopped {
                debug!(state = %current, "Start ignored");
                return Ok(());
            }
            *state = LifecycleState::Starting;
        }

        // Built-ins are fresh on every start; the previous set was shut down
        // and deregistered by `stop`.
        if self.config.register_builtin_workers && self.registry.read().await.is_empty() {
            for (name, worker) in builtin_workers(DEFAULT_CAPACITY) {
                if let Err(e) = self.add_worker(name.clone(), worker).await {
                    self.deregister_builtins().await;
                    *self.state.write() = LifecycleState::Stopped;
                    return Err(e);
                }
                self.builtins.lock().push(name);
            }
        }

        // Workers added from here on subscribe in `add_worker`; everything
        // registered before subscribes once below.
        let (tx, rx) = mpsc::channel(self.config.event_buffer.max(1));
        *self.worker_events.lock() = Some(tx.clone());

        let workers = self.registry.read().await.workers();
        for (_, worker) in &workers {
            worker.subscribe(tx.clone());
        }
        drop(tx);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (forwarder_shutdown, forwarder_rx) = watch::channel(false);

        let forwarder = tokio::spawn(forward_worker_events(
            rx,
            self.events.clone(),
            forwarder_rx,
        ));
        let health = Arc::clone(&self.monitor).spawn(shutdown_rx.clone());
        let drain = tokio::spawn(drain_loop(
            Arc::clone(&self.queue),
            Arc::clone(&self.registry),
            Arc::clone(&self.engine),
            self.events.clone(),
            self.config.max_concurrent_tasks,
            self.config.drain_interval(),
            shutdown_rx,
        ));

        *self.background.lock() = Some(Background {
            shutdown,
            loops: vec![drain, health],
            forwarder_shutdown,
            forwarder,
        });
        *self.state.write() = LifecycleState::Running;

        info!(
            workers = workers.len(),
            max_concurrent_tasks = self.config.max_concurrent_tasks,
            consensus = self.config.enable_consensus,
            "Coordinator started"
        );
        self.events.publish(CoordinatorEvent::Started {
            workers: workers.len(),
        });
        Ok(())
    }

    /// Stop the loops and shut every worker down once. A no-op unless
    /// running.
    ///
    /// Tasks already dispatched still run to completion. Tasks still pending
    /// stay queued and are dispatched after the next [`start`](Self::start);
    /// until then `await_result` on them can only time out. Built-in workers
    /// are deregistered so a restart gets live ones.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write();
            let current = *state;
            if current != LifecycleState::Running {
                debug!(state = %current, "Stop ignored");
                return;
            }
            *state = LifecycleState::Stopping;
        }
        info!("Coordinator stopping");

        let background = self.background.lock().take();
        let forwarder = match background {
            Some(bg) => {
                let _ = bg.shutdown.send(true);
                for joined in join_all(bg.loops).await {
                    if let Err(e) = joined {
                        warn!(error = %e, "Background loop ended abnormally");
                    }
                }
                Some((bg.forwarder_shutdown, bg.forwarder))
            }
            None => None,
        };

        let workers = self.registry.read().await.workers();
        join_all(workers.iter().map(|(_, worker)| worker.shutdown())).await;
        self.worker_events.lock().take();
        self.deregister_builtins().await;

        // Forward whatever the workers emitted while shutting down.
        if let Some((forwarder_shutdown, forwarder)) = forwarder {
            let _ = forwarder_shutdown.send(true);
            if let Err(e) = forwarder.await {
                warn!(error = %e, "Worker event forwarder ended abnormally");
            }
        }

        *self.state.write() = LifecycleState::Stopped;
        info!(workers = workers.len(), "Coordinator stopped");
        self.events.publish(CoordinatorEvent::Stopped);
    }

    /// Queue a task and return its id. Execution happens in the background.
    pub async fn submit(
        &self,
        prompt: impl Into<String>,
        options: TaskOptions,
    ) -> HiveResult<TaskId> {
        if !self.is_running() {
            return Err(HiveError::NotRunning);
        }

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let id = TaskId::generate(Utc::now(), sequence);
        let task = Task::new(id.clone(), prompt, options);
        let task_type = task.task_type.clone();

        self.queue.write().await.enqueue(task);
        self.metrics.record_submitted();

        debug!(task_id = %id, task_type = %task_type, "Task submitted");
        self.events.publish(CoordinatorEvent::TaskSubmitted {
            task_id: id.clone(),
            task_type,
        });
        Ok(id)
    }

    pub async fn status(&self, id: &TaskId) -> TaskStatus {
        self.queue.read().await.status(id)
    }

    pub async fn result(&self, id: &TaskId) -> Option<TaskOutcome> {
        self.queue.read().await.result(id).cloned()
    }

    pub async fn error(&self, id: &TaskId) -> Option<TaskFailure> {
        self.queue.read().await.error(id).cloned()
    }

    /// Poll until the task reaches a terminal state or `timeout` elapses.
    ///
    /// A timeout only abandons this wait; the task keeps running and its
    /// outcome is still recorded.
    pub async fn await_result(&self, id: &TaskId, timeout: Duration) -> HiveResult<TaskOutcome> {
        let poll = self.config.poll_interval();
        let wait = async {
            loop {
                {
                    let queue = self.queue.read().await;
                    match queue.status(id) {
                        TaskStatus::Completed => {
                            if let Some(outcome) = queue.result(id) {
                                return Ok(outcome.clone());
                            }
                        }
                        TaskStatus::Failed => {
                            if let Some(failure) = queue.error(id) {
                                return Err(reraise(failure.clone()));
                            }
                        }
                        TaskStatus::NotFound => return Err(HiveError::TaskNotFound(id.clone())),
                        TaskStatus::Pending | TaskStatus::Active => {}
                    }
                }
                time::sleep(poll).await;
            }
        };

        match time::timeout(timeout, wait).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let timeout_ms = timeout.as_millis() as u64;
                warn!(task_id = %id, timeout_ms, "Gave up waiting for task");
                Err(HiveError::TaskTimeout {
                    task_id: id.clone(),
                    timeout_ms,
                })
            }
        }
    }

    /// [`await_result`](Self::await_result) with the configured default timeout.
    pub async fn await_result_default(&self, id: &TaskId) -> HiveResult<TaskOutcome> {
        self.await_result(id, self.config.default_timeout()).await
    }

    pub async fn metrics(&self) -> CoordinatorMetrics {
        let queue = self.queue.read().await;
        self.metrics
            .snapshot(queue.pending_count(), queue.active_count())
    }

    /// Run one health cycle now instead of waiting for the next tick.
    pub async fn check_health(&self) -> HealthReport {
        self.monitor.run_cycle().await
    }

    /// Receive every [`CoordinatorEvent`] published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }
}

/// Map a stored failure to the error `await_result` raises.
fn reraise(failure: TaskFailure) -> HiveError {
    match failure.kind {
        FailureKind::NoSuitableWorker => HiveError::NoSuitableWorker(failure.reason),
        _ => HiveError::from(failure),
    }
}

/// Move pending tasks to active up to the concurrency ceiling and dispatch
/// each on its own tokio task.
async fn drain_loop(
    queue: Arc<RwLock<TaskQueue>>,
    registry: Arc<RwLock<WorkerRegistry>>,
    engine: Arc<ExecutionEngine>,
    events: EventBus,
    max_concurrent: usize,
    idle: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(max_concurrent, "Drain loop started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        // Capacity check and activation share one write lock so the ceiling
        // holds under concurrent completions.
        let batch = {
            let mut queue = queue.write().await;
            let capacity = max_concurrent.saturating_sub(queue.active_count());
            if capacity == 0 {
                Vec::new()
            } else {
                queue.activate_next(capacity)
            }
        };

        if batch.is_empty() {
            tokio::select! {
                _ = time::sleep(idle) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            continue;
        }

        let candidates = registry.read().await.healthy_candidates();
        for task in batch {
            debug!(task_id = %task.id, candidates = candidates.len(), "Task activated");
            events.publish(CoordinatorEvent::TaskStarted {
                task_id: task.id.clone(),
            });
            tokio::spawn(Arc::clone(&engine).dispatch(task, candidates.clone()));
        }
    }
    debug!("Drain loop stopped");
}

/// Re-publish worker notifications on the coordinator's event bus.
async fn forward_worker_events(
    mut rx: mpsc::Receiver<WorkerEvent>,
    events: EventBus,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(event) => events.publish(CoordinatorEvent::Worker(event)),
                None => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    while let Ok(event) = rx.try_recv() {
        events.publish(CoordinatorEvent::Worker(event));
    }
}
