use crate::config::CoordinatorConfig;
use crate::events::{CoordinatorEvent, EventBus};
use crate::metrics::MetricsTracker;
use crate::registry::Candidate;
use crate::selection::SelectionEngine;
use crate::task_queue::TaskQueue;
use crate::worker::Worker;
use chrono::Utc;
use hive_core::{
    Consensus, FailureKind, Task, TaskFailure, TaskId, TaskOutcome, TaskResult, TaskStatus,
    WorkerOutput,
};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Runs active tasks against workers and records the outcome.
///
/// Worker calls run on their own tokio task, and [`dispatch`](Self::dispatch)
/// runs selection on one too, so a panicking worker fails the task instead of
/// leaving it active forever.
pub struct ExecutionEngine {
    queue: Arc<RwLock<TaskQueue>>,
    metrics: Arc<MetricsTracker>,
    events: EventBus,
    selection: SelectionEngine,
    consensus_threshold: f64,
    consensus_size: usize,
    consensus_by_default: bool,
}

impl ExecutionEngine {
    pub fn new(
        config: &CoordinatorConfig,
        queue: Arc<RwLock<TaskQueue>>,
        metrics: Arc<MetricsTracker>,
        events: EventBus,
    ) -> Self {
        Self {
            queue,
            metrics,
            events,
            selection: SelectionEngine::new(config.enable_load_balancing),
            consensus_threshold: config.consensus_threshold,
            consensus_size: config.consensus_size,
            consensus_by_default: config.enable_consensus,
        }
    }

    pub fn selection(&self) -> &SelectionEngine {
        &self.selection
    }

    /// Execute an active task in the mode it asks for. Returns the terminal
    /// status it was recorded with.
    pub async fn execute(&self, task: Task, candidates: Vec<Candidate>) -> TaskStatus {
        if task.require_consensus.unwrap_or(self.consensus_by_default) {
            self.execute_consensus(task, candidates).await
        } else {
            self.execute_direct(task, candidates).await
        }
    }

    /// [`execute`](Self::execute) on a separate tokio task. A panic anywhere in
    /// it, including a worker's `can_accept_task` or `workload` during
    /// selection, fails the task with kind `worker_panicked`.
    pub async fn dispatch(self: Arc<Self>, task: Task, candidates: Vec<Candidate>) -> TaskStatus {
        let task_id = task.id.clone();
        let engine = Arc::clone(&self);
        match tokio::spawn(async move { engine.execute(task, candidates).await }).await {
            Ok(status) => status,
            Err(join_err) => self.dispatch_aborted(task_id, join_err.to_string()).await,
        }
    }

    async fn dispatch_aborted(&self, task_id: TaskId, reason: String) -> TaskStatus {
        let failure = TaskFailure::new(
            task_id,
            FailureKind::WorkerPanicked,
            format!("dispatch aborted: {reason}"),
        );
        self.fail(failure).await
    }

    /// Run the task on the single best eligible worker.
    pub async fn execute_direct(&self, task: Task, candidates: Vec<Candidate>) -> TaskStatus {
        let Some(chosen) = self.selection.select(&task, &candidates) else {
            return self.no_suitable_worker(&task, candidates.len()).await;
        };

        debug!(task_id = %task.id, worker = %chosen.name, "Dispatching task (direct)");
        self.queue
            .write()
            .await
            .assign(&task.id, vec![chosen.name.clone()]);

        let start = Instant::now();
        let worker = Arc::clone(&chosen.worker);
        let owned = task.clone();
        let joined = tokio::spawn(async move { worker.process(&owned).await }).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match joined {
            Ok(Ok(output)) => {
                let output = WorkerOutput {
                    worker: chosen.name.clone(),
                    ..output
                };
                let result = TaskResult {
                    task_id: task.id.clone(),
                    output,
                    duration_ms,
                    completed_at: Utc::now(),
                };
                self.complete(TaskOutcome::Direct(result)).await
            }
            Ok(Err(e)) => {
                let failure =
                    TaskFailure::new(task.id.clone(), FailureKind::ProcessingError, e.to_string())
                        .with_worker(&chosen.name);
                self.fail(failure).await
            }
            Err(join_err) => {
                let failure = TaskFailure::new(
                    task.id.clone(),
                    FailureKind::WorkerPanicked,
                    format!("worker task aborted: {join_err}"),
                )
                .with_worker(&chosen.name);
                self.fail(failure).await
            }
        }
    }

    /// Run a collaboration round across the best `consensus_size` workers.
    /// Degrades to direct mode when fewer than two are eligible.
    pub async fn execute_consensus(&self, task: Task, candidates: Vec<Candidate>) -> TaskStatus {
        let chosen = self
            .selection
            .select_many(&task, &candidates, self.consensus_size);

        if chosen.len() < 2 {
            warn!(
                task_id = %task.id,
                eligible = chosen.len(),
                "Not enough eligible workers for consensus, falling back to direct mode"
            );
            self.events.publish(CoordinatorEvent::ConsensusDegraded {
                task_id: task.id.clone(),
                eligible: chosen.len(),
            });
            return self.execute_direct(task, candidates).await;
        }

        let names: Vec<String> = chosen.iter().map(|c| c.name.clone()).collect();
        debug!(task_id = %task.id, workers = ?names, "Dispatching task (consensus)");
        self.queue.write().await.assign(&task.id, names);

        let primary_name = chosen[0].name.clone();
        let primary = Arc::clone(&chosen[0].worker);
        let peers: Vec<Arc<dyn Worker>> = chosen[1..]
            .iter()
            .map(|c| Arc::clone(&c.worker))
            .collect();

        let start = Instant::now();
        let owned = task.clone();
        let joined =
            tokio::spawn(async move { primary.collaborate(&owned, &peers).await }).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match joined {
            Ok(Ok(consensus)) => {
                let consensus = Consensus {
                    task_id: task.id.clone(),
                    primary: primary_name,
                    confidence: consensus.confidence.clamp(0.0, 1.0),
                    duration_ms,
                    ..consensus
                };
                self.judge(consensus).await
            }
            Ok(Err(e)) => {
                self.metrics.record_consensus(false);
                let failure = TaskFailure::new(
                    task.id.clone(),
                    FailureKind::CollaborationError,
                    e.to_string(),
                )
                .with_worker(primary_name);
                self.fail(failure).await
            }
            Err(join_err) => {
                self.metrics.record_consensus(false);
                let failure = TaskFailure::new(
                    task.id.clone(),
                    FailureKind::WorkerPanicked,
                    format!("collaboration aborted: {join_err}"),
                )
                .with_worker(primary_name);
                self.fail(failure).await
            }
        }
    }

    /// Accept or reject a consensus against the threshold.
    async fn judge(&self, consensus: Consensus) -> TaskStatus {
        let accepted = consensus.is_accepted(self.consensus_threshold);
        self.metrics.record_consensus(accepted);

        if accepted {
            info!(
                task_id = %consensus.task_id,
                confidence = consensus.confidence,
                participants = consensus.contributions.len(),
                "Consensus reached"
            );
            self.events.publish(CoordinatorEvent::ConsensusReached {
                task_id: consensus.task_id.clone(),
                confidence: consensus.confidence,
                participants: consensus
                    .participants()
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
            });
            return self.complete(TaskOutcome::Consensus(consensus)).await;
        }

        warn!(
            task_id = %consensus.task_id,
            confidence = consensus.confidence,
            threshold = self.consensus_threshold,
            "Consensus below threshold"
        );
        self.events.publish(CoordinatorEvent::ConsensusRejected {
            task_id: consensus.task_id.clone(),
            confidence: consensus.confidence,
            threshold: self.consensus_threshold,
        });
        let failure = TaskFailure::new(
            consensus.task_id.clone(),
            FailureKind::ConsensusRejected,
            format!(
                "consensus confidence {:.2} below threshold {:.2}",
                consensus.confidence, self.consensus_threshold
            ),
        )
        .with_worker(consensus.primary.clone())
        .with_consensus(consensus);
        self.fail(failure).await
    }

    async fn no_suitable_worker(&self, task: &Task, healthy: usize) -> TaskStatus {
        warn!(
            task_id = %task.id,
            task_type = %task.task_type,
            healthy,
            "No suitable worker for task"
        );
        let failure = TaskFailure::new(
            task.id.clone(),
            FailureKind::NoSuitableWorker,
            format!(
                "no eligible worker for task type '{}' among {healthy} healthy worker(s)",
                task.task_type
            ),
        );
        self.fail(failure).await
    }

    async fn complete(&self, outcome: TaskOutcome) -> TaskStatus {
        let task_id = outcome.task_id().clone();
        let confidence = outcome.confidence();
        let duration_ms = outcome.duration_ms();

        if !self.queue.write().await.complete(outcome) {
            warn!(task_id = %task_id, "Completed task was not active; result dropped");
            return TaskStatus::NotFound;
        }
        self.metrics.record_completed(duration_ms);
        self.events.publish(CoordinatorEvent::TaskCompleted {
            task_id: task_id.clone(),
            confidence,
            duration_ms,
        });
        info!(task_id = %task_id, duration_ms, confidence, "Task completed");
        TaskStatus::Completed
    }

    async fn fail(&self, failure: TaskFailure) -> TaskStatus {
        let task_id = failure.task_id.clone();
        let kind = failure.kind;
        let reason = failure.reason.clone();

        if !self.queue.write().await.fail(failure) {
            warn!(task_id = %task_id, "Failed task was not active; failure dropped");
            return TaskStatus::NotFound;
        }
        self.metrics.record_failed();
        self.events.publish(CoordinatorEvent::TaskFailed {
            task_id: task_id.clone(),
            kind,
            reason: reason.clone(),
        });
        error!(task_id = %task_id, kind = %kind, reason = %reason, "Task failed");
        TaskStatus::Failed
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hive_core::{HiveError, HiveResult, TaskId, TaskOptions};

    enum Behavior {
        Succeed(f64),
        Fail,
        Panic,
        PanicOnSelect,
        Collaborate(f64),
    }

    struct MockWorker {
        specialty: &'static str,
        behavior: Behavior,
    }

    #[async_trait]
    impl Worker for MockWorker {
        fn specialty(&self) -> &str {
            self.specialty
        }

        fn workload(&self) -> f64 {
            0.0
        }

        fn can_accept_task(&self, _task: &Task) -> bool {
            if matches!(self.behavior, Behavior::PanicOnSelect) {
                panic!("eligibility check exploded");
            }
            true
        }

        async fn process(&self, _task: &Task) -> HiveResult<WorkerOutput> {
            match self.behavior {
                Behavior::Succeed(c) | Behavior::Collaborate(c) => Ok(WorkerOutput::new(
                    "ignored",
                    serde_json::json!("out"),
                    c,
                )),
                Behavior::Fail => Err(HiveError::Worker("model unavailable".to_string())),
                Behavior::Panic | Behavior::PanicOnSelect => panic!("worker exploded"),
            }
        }

        async fn collaborate(
            &self,
            task: &Task,
            peers: &[Arc<dyn Worker>],
        ) -> HiveResult<Consensus> {
            match self.behavior {
                Behavior::Collaborate(c) => {
                    let mut contributions = vec![WorkerOutput::new("me", serde_json::json!(1), c)];
                    for _ in peers {
                        contributions.push(WorkerOutput::new("peer", serde_json::json!(2), c));
                    }
                    Ok(Consensus::from_contributions(task.id.clone(), "me", contributions))
                }
                Behavior::Fail => Err(HiveError::Worker("round failed".to_string())),
                _ => unreachable!("collaborate not expected"),
            }
        }

        async fn is_healthy(&self) -> bool {
            true
        }

        async fn shutdown(&self) {}
    }

    fn candidate(name: &str, behavior: Behavior) -> Candidate {
        Candidate {
            name: name.to_string(),
            specialty: "general".to_string(),
            worker: Arc::new(MockWorker {
                specialty: "general",
                behavior,
            }),
        }
    }

    struct Harness {
        engine: ExecutionEngine,
        queue: Arc<RwLock<TaskQueue>>,
        metrics: Arc<MetricsTracker>,
    }

    fn harness(threshold: f64) -> Harness {
        let config = CoordinatorConfig {
            consensus_threshold: threshold,
            ..Default::default()
        };
        let queue = Arc::new(RwLock::new(TaskQueue::new()));
        let metrics = Arc::new(MetricsTracker::new());
        let engine = ExecutionEngine::new(
            &config,
            Arc::clone(&queue),
            Arc::clone(&metrics),
            EventBus::new(16),
        );
        Harness {
            engine,
            queue,
            metrics,
        }
    }

    async fn activate(queue: &Arc<RwLock<TaskQueue>>, consensus: bool) -> Task {
        let task = Task::new(
            TaskId::from("task-1-1"),
            "prompt",
            TaskOptions::new().with_consensus(consensus),
        );
        let mut q = queue.write().await;
        q.enqueue(task);
        q.activate_next(1).remove(0)
    }

    #[tokio::test]
    async fn test_direct_success() {
        let h = harness(0.7);
        let task = activate(&h.queue, false).await;
        let status = h
            .engine
            .execute(task.clone(), vec![candidate("coder", Behavior::Succeed(0.9))])
            .await;
        assert_eq!(status, TaskStatus::Completed);

        let q = h.queue.read().await;
        let outcome = q.result(&task.id).unwrap();
        match outcome {
            TaskOutcome::Direct(result) => assert_eq!(result.output.worker, "coder"),
            TaskOutcome::Consensus(_) => panic!("expected direct outcome"),
        }
        assert_eq!(h.metrics.snapshot(0, 0).completed_tasks, 1);
    }

    #[tokio::test]
    async fn test_direct_processing_error() {
        let h = harness(0.7);
        let task = activate(&h.queue, false).await;
        let status = h
            .engine
            .execute(task.clone(), vec![candidate("coder", Behavior::Fail)])
            .await;
        assert_eq!(status, TaskStatus::Failed);

        let q = h.queue.read().await;
        let failure = q.error(&task.id).unwrap();
        assert_eq!(failure.kind, FailureKind::ProcessingError);
        assert!(failure.reason.contains("model unavailable"));
        assert_eq!(failure.worker.as_deref(), Some("coder"));
        assert_eq!(h.metrics.snapshot(0, 0).failed_tasks, 1);
    }

    #[tokio::test]
    async fn test_panicking_worker_fails_task() {
        let h = harness(0.7);
        let task = activate(&h.queue, false).await;
        let status = h
            .engine
            .execute(task.clone(), vec![candidate("boom", Behavior::Panic)])
            .await;
        assert_eq!(status, TaskStatus::Failed);
        let q = h.queue.read().await;
        assert_eq!(q.error(&task.id).unwrap().kind, FailureKind::WorkerPanicked);
        assert_eq!(q.active_count(), 0);
    }

    #[tokio::test]
    async fn test_panic_during_selection_fails_task() {
        let h = harness(0.7);
        let task = activate(&h.queue, false).await;
        let engine = Arc::new(h.engine);
        let status = engine
            .dispatch(task.clone(), vec![candidate("boom", Behavior::PanicOnSelect)])
            .await;
        assert_eq!(status, TaskStatus::Failed);

        let q = h.queue.read().await;
        let failure = q.error(&task.id).unwrap();
        assert_eq!(failure.kind, FailureKind::WorkerPanicked);
        assert!(failure.reason.starts_with("dispatch aborted"));
        assert_eq!(q.active_count(), 0);
        assert_eq!(h.metrics.snapshot(0, 0).failed_tasks, 1);
    }

    #[tokio::test]
    async fn test_dispatch_passes_through_status() {
        let h = harness(0.7);
        let task = activate(&h.queue, false).await;
        let engine = Arc::new(h.engine);
        let status = engine
            .dispatch(task, vec![candidate("coder", Behavior::Succeed(0.9))])
            .await;
        assert_eq!(status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_no_candidates() {
        let h = harness(0.7);
        let task = activate(&h.queue, false).await;
        let status = h.engine.execute(task.clone(), vec![]).await;
        assert_eq!(status, TaskStatus::Failed);
        let q = h.queue.read().await;
        assert_eq!(q.error(&task.id).unwrap().kind, FailureKind::NoSuitableWorker);
    }

    #[tokio::test]
    async fn test_consensus_accepted_at_threshold() {
        let h = harness(0.7);
        let task = activate(&h.queue, true).await;
        let status = h
            .engine
            .execute(
                task.clone(),
                vec![
                    candidate("a", Behavior::Collaborate(0.7)),
                    candidate("b", Behavior::Collaborate(0.7)),
                ],
            )
            .await;
        assert_eq!(status, TaskStatus::Completed);

        let q = h.queue.read().await;
        let consensus = q.result(&task.id).unwrap().as_consensus().unwrap();
        assert_eq!(consensus.primary, "a");
        assert_eq!(consensus.contributions.len(), 2);

        let snap = h.metrics.snapshot(0, 0);
        assert_eq!(snap.consensus_attempts, 1);
        assert_eq!(snap.consensus_accepted, 1);
    }

    #[tokio::test]
    async fn test_consensus_rejected_keeps_detail() {
        let h = harness(0.7);
        let task = activate(&h.queue, true).await;
        let status = h
            .engine
            .execute(
                task.clone(),
                vec![
                    candidate("a", Behavior::Collaborate(0.4)),
                    candidate("b", Behavior::Collaborate(0.4)),
                ],
            )
            .await;
        assert_eq!(status, TaskStatus::Failed);

        let q = h.queue.read().await;
        let failure = q.error(&task.id).unwrap();
        assert_eq!(failure.kind, FailureKind::ConsensusRejected);
        let consensus = failure.consensus.as_ref().unwrap();
        assert!((consensus.confidence - 0.4).abs() < 1e-9);

        let snap = h.metrics.snapshot(0, 0);
        assert_eq!(snap.consensus_attempts, 1);
        assert_eq!(snap.consensus_accepted, 0);
        assert_eq!(snap.failed_tasks, 1);
    }

    #[tokio::test]
    async fn test_collaboration_error() {
        let h = harness(0.7);
        let task = activate(&h.queue, true).await;
        let status = h
            .engine
            .execute(
                task.clone(),
                vec![candidate("a", Behavior::Fail), candidate("b", Behavior::Fail)],
            )
            .await;
        assert_eq!(status, TaskStatus::Failed);
        let q = h.queue.read().await;
        assert_eq!(
            q.error(&task.id).unwrap().kind,
            FailureKind::CollaborationError
        );
    }

    #[tokio::test]
    async fn test_consensus_degrades_to_direct() {
        let h = harness(0.7);
        let task = activate(&h.queue, true).await;
        let status = h
            .engine
            .execute(task.clone(), vec![candidate("solo", Behavior::Succeed(0.3))])
            .await;
        // Direct mode ignores the consensus threshold.
        assert_eq!(status, TaskStatus::Completed);
        let q = h.queue.read().await;
        assert!(matches!(
            q.result(&task.id).unwrap(),
            TaskOutcome::Direct(_)
        ));
        assert_eq!(h.metrics.snapshot(0, 0).consensus_attempts, 0);
    }
}
