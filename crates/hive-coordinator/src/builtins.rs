use crate::events::{WorkerEvent, WorkerEventSender};
use crate::selection::specialty_matches;
use crate::worker::{gather_consensus, Worker};
use async_trait::async_trait;
use hive_core::{Consensus, HiveError, HiveResult, Task, WorkerOutput};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Concurrent tasks a built-in specialist takes before declining.
pub const DEFAULT_CAPACITY: usize = 4;

const CONFIDENCE_ON_SPECIALTY: f64 = 0.85;
const CONFIDENCE_OFF_SPECIALTY: f64 = 0.5;

/// The built-in specialists, in registration order.
pub fn builtin_workers(capacity: usize) -> Vec<(String, Arc<dyn Worker>)> {
    [
        code_generation_queen(capacity),
        bug_detection_queen(capacity),
        architecture_queen(capacity),
    ]
    .into_iter()
    .map(|queen| (queen.name.clone(), Arc::new(queen) as Arc<dyn Worker>))
    .collect()
}

fn code_generation_queen(capacity: usize) -> SpecialistQueen {
    SpecialistQueen::new("code-queen", "code-generation", CODE_GENERATION_FOCUS, capacity)
}

fn bug_detection_queen(capacity: usize) -> SpecialistQueen {
    SpecialistQueen::new("bug-hunter-queen", "bug-detection", BUG_DETECTION_FOCUS, capacity)
}

fn architecture_queen(capacity: usize) -> SpecialistQueen {
    SpecialistQueen::new("architect-queen", "architecture", ARCHITECTURE_FOCUS, capacity)
}

const CODE_GENERATION_FOCUS: &str = "implementation draft";
const BUG_DETECTION_FOCUS: &str = "defect review";
const ARCHITECTURE_FOCUS: &str = "design outline";

/// A bounded-capacity worker with a fixed specialty.
///
/// Its output is a structured echo of the task; real analysis belongs to
/// workers plugged in by the embedding application.
pub struct SpecialistQueen {
    name: String,
    specialty: String,
    focus: &'static str,
    capacity: usize,
    in_flight: AtomicUsize,
    shut_down: AtomicBool,
    events: Mutex<Option<WorkerEventSender>>,
}

/// Decrements the in-flight counter even if processing unwinds.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SpecialistQueen {
    pub fn new(
        name: impl Into<String>,
        specialty: impl Into<String>,
        focus: &'static str,
        capacity: usize,
    ) -> Self {
        Self {
            name: name.into(),
            specialty: specialty.into(),
            focus,
            capacity: capacity.max(1),
            in_flight: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
            events: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn emit(&self, event: WorkerEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            // A full channel drops the notification; it is advisory only.
            if let Err(e) = tx.try_send(event) {
                debug!(worker = %self.name, error = %e, "Worker event not delivered");
            }
        }
    }
}

#[async_trait]
impl Worker for SpecialistQueen {
    fn specialty(&self) -> &str {
        &self.specialty
    }

    fn workload(&self) -> f64 {
        (self.in_flight() as f64 / self.capacity as f64).min(1.0)
    }

    fn can_accept_task(&self, _task: &Task) -> bool {
        !self.shut_down.load(Ordering::SeqCst) && self.in_flight() < self.capacity
    }

    async fn process(&self, task: &Task) -> HiveResult<WorkerOutput> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(HiveError::Worker(format!("{} is shut down", self.name)));
        }
        let _guard = InFlight::enter(&self.in_flight);
        tokio::task::yield_now().await;

        let on_specialty = specialty_matches(&self.specialty, &task.task_type);
        let confidence = if on_specialty {
            CONFIDENCE_ON_SPECIALTY
        } else {
            CONFIDENCE_OFF_SPECIALTY
        };
        let mut context_keys: Vec<&String> = task.context.keys().collect();
        context_keys.sort();

        let output = json!({
            "specialty": self.specialty,
            "focus": self.focus,
            "task_type": task.task_type,
            "on_specialty": on_specialty,
            "summary": format!("{} for: {}", self.focus, task.prompt),
            "context_keys": context_keys,
        });

        self.emit(WorkerEvent::TaskCompleted {
            worker: self.name.clone(),
            task_id: task.id.clone(),
            confidence,
        });
        Ok(WorkerOutput::new(&self.name, output, confidence))
    }

    async fn collaborate(&self, task: &Task, peers: &[Arc<dyn Worker>]) -> HiveResult<Consensus> {
        self.emit(WorkerEvent::Collaboration {
            worker: self.name.clone(),
            task_id: task.id.clone(),
            peers: peers.iter().map(|p| p.specialty().to_string()).collect(),
        });
        gather_consensus(self, task, peers).await
    }

    async fn is_healthy(&self) -> bool {
        !self.shut_down.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(worker = %self.name, "Worker shut down");
        self.emit(WorkerEvent::Shutdown {
            worker: self.name.clone(),
        });
        self.events.lock().take();
    }

    fn subscribe(&self, events: WorkerEventSender) {
        *self.events.lock() = Some(events);
    }
}
