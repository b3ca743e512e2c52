use chrono::{DateTime, Utc};
use hive_core::{Task, TaskFailure, TaskId, TaskOutcome, TaskStatus};
use std::collections::{HashMap, VecDeque};

/// A task that has been dequeued and is being executed.
#[derive(Debug, Clone)]
pub struct ActiveTask {
    pub task: Task,
    pub started_at: DateTime<Utc>,
    /// Workers the task was routed to; empty until selection ran.
    pub workers: Vec<String>,
}

/// FIFO pending list plus active, completed and failed maps.
///
/// Every transition removes the task from its previous collection and inserts
/// it into the next one inside a single `&mut self` call, so a task id is in
/// exactly one collection whenever the queue can be observed.
#[derive(Debug, Default)]
pub struct TaskQueue {
    pending: VecDeque<Task>,
    active: HashMap<TaskId, ActiveTask>,
    completed: HashMap<TaskId, TaskOutcome>,
    failed: HashMap<TaskId, TaskFailure>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task to the back of the pending list.
    pub fn enqueue(&mut self, task: Task) -> TaskId {
        let id = task.id.clone();
        self.pending.push_back(task);
        id
    }

    /// Move up to `limit` tasks from the front of the pending list into the
    /// active map and return them in dispatch order.
    pub fn activate_next(&mut self, limit: usize) -> Vec<Task> {
        let take = limit.min(self.pending.len());
        let now = Utc::now();
        let mut batch = Vec::with_capacity(take);
        for task in self.pending.drain(..take) {
            self.active.insert(
                task.id.clone(),
                ActiveTask {
                    task: task.clone(),
                    started_at: now,
                    workers: Vec::new(),
                },
            );
            batch.push(task);
        }
        batch
    }

    /// Record which workers an active task was routed to.
    pub fn assign(&mut self, id: &TaskId, workers: Vec<String>) -> bool {
        if let Some(active) = self.active.get_mut(id) {
            active.workers = workers;
            true
        } else {
            false
        }
    }

    /// Move an active task to the completed map.
    pub fn complete(&mut self, outcome: TaskOutcome) -> bool {
        let id = outcome.task_id().clone();
        if self.active.remove(&id).is_none() {
            return false;
        }
        self.completed.insert(id, outcome);
        true
    }

    /// Move an active task to the failed map.
    pub fn fail(&mut self, failure: TaskFailure) -> bool {
        if self.active.remove(&failure.task_id).is_none() {
            return false;
        }
        self.failed.insert(failure.task_id.clone(), failure);
        true
    }

    /// Status lookup in pending → active → completed → failed order.
    pub fn status(&self, id: &TaskId) -> TaskStatus {
        if self.pending.iter().any(|t| &t.id == id) {
            TaskStatus::Pending
        } else if self.active.contains_key(id) {
            TaskStatus::Active
        } else if self.completed.contains_key(id) {
            TaskStatus::Completed
        } else if self.failed.contains_key(id) {
            TaskStatus::Failed
        } else {
            TaskStatus::NotFound
        }
    }

    pub fn result(&self, id: &TaskId) -> Option<&TaskOutcome> {
        self.completed.get(id)
    }

    pub fn error(&self, id: &TaskId) -> Option<&TaskFailure> {
        self.failed.get(id)
    }

    pub fn active(&self, id: &TaskId) -> Option<&ActiveTask> {
        self.active.get(id)
    }

    /// Active tasks, oldest dispatch first.
    pub fn active_tasks(&self) -> Vec<&ActiveTask> {
        let mut tasks: Vec<&ActiveTask> = self.active.values().collect();
        tasks.sort_by_key(|a| a.started_at);
        tasks
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn total_count(&self) -> usize {
        self.pending.len() + self.active.len() + self.completed.len() + self.failed.len()
    }

    /// No task is waiting or running.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.active.is_empty()
    }
}
