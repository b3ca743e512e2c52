use hive_core::{FailureKind, TaskId};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

/// Sending half handed to each worker on start.
pub type WorkerEventSender = mpsc::Sender<WorkerEvent>;

/// Notification emitted by a worker. Delivered through a bounded channel that
/// the coordinator drains on its own loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerEvent {
    TaskCompleted {
        worker: String,
        task_id: TaskId,
        confidence: f64,
    },
    Collaboration {
        worker: String,
        task_id: TaskId,
        peers: Vec<String>,
    },
    Shutdown {
        worker: String,
    },
}

impl WorkerEvent {
    pub fn worker(&self) -> &str {
        match self {
            WorkerEvent::TaskCompleted { worker, .. }
            | WorkerEvent::Collaboration { worker, .. }
            | WorkerEvent::Shutdown { worker } => worker,
        }
    }
}

/// Everything an external observer can see happen inside a coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    Started {
        workers: usize,
    },
    Stopped,
    TaskSubmitted {
        task_id: TaskId,
        task_type: String,
    },
    TaskStarted {
        task_id: TaskId,
    },
    TaskCompleted {
        task_id: TaskId,
        confidence: f64,
        duration_ms: u64,
    },
    TaskFailed {
        task_id: TaskId,
        kind: FailureKind,
        reason: String,
    },
    ConsensusReached {
        task_id: TaskId,
        confidence: f64,
        participants: Vec<String>,
    },
    ConsensusRejected {
        task_id: TaskId,
        confidence: f64,
        threshold: f64,
    },
    /// Fewer than two eligible workers; the task ran in direct mode.
    ConsensusDegraded {
        task_id: TaskId,
        eligible: usize,
    },
    WorkerAdded {
        worker: String,
        specialty: String,
    },
    WorkerRemoved {
        worker: String,
    },
    WorkerHealthChanged {
        worker: String,
        healthy: bool,
    },
    HealthCheck {
        healthy: usize,
        unhealthy: usize,
    },
    Worker(WorkerEvent),
}

/// Fan-out of [`CoordinatorEvent`]s to any number of subscribers.
///
/// Publishing never fails: with no subscriber the event is simply dropped, and
/// a lagging subscriber loses the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoordinatorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: CoordinatorEvent) {
        // An Err only means nobody is listening.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
