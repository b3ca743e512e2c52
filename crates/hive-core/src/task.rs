use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Task type used when the submitter does not name one.
pub const DEFAULT_TASK_TYPE: &str = "general";

/// Opaque task identifier: `task-<unix millis>-<sequence>`.
///
/// The millisecond timestamp keeps identifiers distinct across restarts; the
/// per-coordinator sequence keeps them distinct within one millisecond.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Build an identifier from a timestamp and a monotonic sequence number.
    pub fn generate(at: DateTime<Utc>, sequence: u64) -> Self {
        Self(format!("task-{}-{sequence}", at.timestamp_millis()))
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Scheduling hint attached to a task. Workers may read it; dispatch stays FIFO.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Lifecycle status of a task as seen by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    Active,
    Completed,
    Failed,
    /// Only ever returned by a query for an unknown identifier.
    NotFound,
}

impl TaskStatus {
    /// Whether the task can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Active => write!(f, "active"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::NotFound => write!(f, "not-found"),
        }
    }
}

/// Optional knobs accepted by `submit`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskOptions {
    #[serde(default, rename = "type")]
    pub task_type: Option<String>,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    /// `None` defers to the coordinator's `enable_consensus` setting.
    #[serde(default)]
    pub require_consensus: Option<bool>,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_consensus(mut self, required: bool) -> Self {
        self.require_consensus = Some(required);
        self
    }
}

/// A unit of work. Immutable once submitted; status lives in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: String,
    pub prompt: String,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub require_consensus: Option<bool>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: TaskId, prompt: impl Into<String>, options: TaskOptions) -> Self {
        Self {
            id,
            task_type: options
                .task_type
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_TASK_TYPE.to_string()),
            prompt: prompt.into(),
            context: options.context,
            priority: options.priority.unwrap_or_default(),
            require_consensus: options.require_consensus,
            created_at: Utc::now(),
        }
    }
}

/// What a single worker produced for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerOutput {
    pub worker: String,
    pub output: serde_json::Value,
    /// Clamped to `[0, 1]` on construction.
    pub confidence: f64,
}

impl WorkerOutput {
    pub fn new(worker: impl Into<String>, output: serde_json::Value, confidence: f64) -> Self {
        Self {
            worker: worker.into(),
            output,
            confidence: clamp_unit(confidence),
        }
    }
}

/// Result of direct (single-worker) execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    #[serde(flatten)]
    pub output: WorkerOutput,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn confidence(&self) -> f64 {
        self.output.confidence
    }
}

/// Agreement reached by two or more workers in a collaboration round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Consensus {
    pub task_id: TaskId,
    /// The first-selected worker, which drove the round.
    pub primary: String,
    pub contributions: Vec<WorkerOutput>,
    pub confidence: f64,
    #[serde(default)]
    pub duration_ms: u64,
}

impl Consensus {
    /// Aggregate contributions by mean confidence.
    pub fn from_contributions(
        task_id: TaskId,
        primary: impl Into<String>,
        contributions: Vec<WorkerOutput>,
    ) -> Self {
        let confidence = if contributions.is_empty() {
            0.0
        } else {
            contributions.iter().map(|c| c.confidence).sum::<f64>() / contributions.len() as f64
        };
        Self {
            task_id,
            primary: primary.into(),
            contributions,
            confidence: clamp_unit(confidence),
            duration_ms: 0,
        }
    }

    /// Names of every worker that contributed.
    pub fn participants(&self) -> Vec<&str> {
        self.contributions.iter().map(|c| c.worker.as_str()).collect()
    }

    pub fn is_accepted(&self, threshold: f64) -> bool {
        self.confidence >= threshold
    }
}

/// Final value of a completed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TaskOutcome {
    Direct(TaskResult),
    Consensus(Consensus),
}

impl TaskOutcome {
    pub fn task_id(&self) -> &TaskId {
        match self {
            TaskOutcome::Direct(r) => &r.task_id,
            TaskOutcome::Consensus(c) => &c.task_id,
        }
    }

    pub fn confidence(&self) -> f64 {
        match self {
            TaskOutcome::Direct(r) => r.confidence(),
            TaskOutcome::Consensus(c) => c.confidence,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        match self {
            TaskOutcome::Direct(r) => r.duration_ms,
            TaskOutcome::Consensus(c) => c.duration_ms,
        }
    }

    pub fn as_consensus(&self) -> Option<&Consensus> {
        match self {
            TaskOutcome::Consensus(c) => Some(c),
            TaskOutcome::Direct(_) => None,
        }
    }
}

/// Why a task ended in the `failed` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NoSuitableWorker,
    ProcessingError,
    CollaborationError,
    ConsensusRejected,
    WorkerPanicked,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::NoSuitableWorker => write!(f, "no_suitable_worker"),
            FailureKind::ProcessingError => write!(f, "processing_error"),
            FailureKind::CollaborationError => write!(f, "collaboration_error"),
            FailureKind::ConsensusRejected => write!(f, "consensus_rejected"),
            FailureKind::WorkerPanicked => write!(f, "worker_panicked"),
        }
    }
}

/// Diagnostic record stored in the failed map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFailure {
    pub task_id: TaskId,
    pub kind: FailureKind,
    pub reason: String,
    #[serde(default)]
    pub worker: Option<String>,
    /// Low-confidence agreement is kept for observability.
    #[serde(default)]
    pub consensus: Option<Consensus>,
    pub failed_at: DateTime<Utc>,
}

impl TaskFailure {
    pub fn new(task_id: TaskId, kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            task_id,
            kind,
            reason: reason.into(),
            worker: None,
            consensus: None,
            failed_at: Utc::now(),
        }
    }

    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    pub fn with_consensus(mut self, consensus: Consensus) -> Self {
        self.consensus = Some(consensus);
        self
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.task_id, self.kind, self.reason)
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn id(n: u64) -> TaskId {
        TaskId::generate(Utc::now(), n)
    }

    #[test]
    fn test_task_id_format() {
        let at = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        let id = TaskId::generate(at, 7);
        assert_eq!(id.as_str(), "task-1700000000123-7");
        assert_eq!(id.to_string(), "task-1700000000123-7");
    }

    #[test]
    fn test_task_defaults() {
        let task = Task::new(id(1), "do work", TaskOptions::new());
        assert_eq!(task.task_type, DEFAULT_TASK_TYPE);
        assert_eq!(task.priority, TaskPriority::Normal);
        assert!(task.require_consensus.is_none());
        assert!(task.context.is_empty());
    }

    #[test]
    fn test_blank_task_type_falls_back() {
        let task = Task::new(id(1), "x", TaskOptions::new().with_type("   "));
        assert_eq!(task.task_type, DEFAULT_TASK_TYPE);
    }

    #[test]
    fn test_task_options_builder() {
        let opts = TaskOptions::new()
            .with_type("code-generation")
            .with_context("language", serde_json::json!("rust"))
            .with_priority(TaskPriority::High)
            .with_consensus(true);
        let task = Task::new(id(2), "add function foo", opts);
        assert_eq!(task.task_type, "code-generation");
        assert_eq!(task.context["language"], "rust");
        assert_eq!(task.priority, TaskPriority::High);
        assert_eq!(task.require_consensus, Some(true));
    }

    #[test]
    fn test_worker_output_confidence_clamped() {
        assert_eq!(WorkerOutput::new("w", serde_json::Value::Null, 1.7).confidence, 1.0);
        assert_eq!(WorkerOutput::new("w", serde_json::Value::Null, -0.2).confidence, 0.0);
        assert_eq!(WorkerOutput::new("w", serde_json::Value::Null, f64::NAN).confidence, 0.0);
    }

    #[test]
    fn test_consensus_mean_confidence() {
        let consensus = Consensus::from_contributions(
            id(3),
            "a",
            vec![
                WorkerOutput::new("a", serde_json::json!("x"), 0.9),
                WorkerOutput::new("b", serde_json::json!("y"), 0.5),
            ],
        );
        assert!((consensus.confidence - 0.7).abs() < 1e-9);
        assert_eq!(consensus.participants(), vec!["a", "b"]);
        assert!(consensus.is_accepted(0.7));
        assert!(!consensus.is_accepted(0.71));
    }

    #[test]
    fn test_empty_consensus_has_zero_confidence() {
        let consensus = Consensus::from_contributions(id(4), "a", vec![]);
        assert_eq!(consensus.confidence, 0.0);
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::NotFound).unwrap(),
            "\"not-found\""
        );
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Active.is_terminal());
    }

    #[test]
    fn test_outcome_tagged_by_mode() {
        let outcome = TaskOutcome::Consensus(Consensus::from_contributions(
            id(5),
            "a",
            vec![WorkerOutput::new("a", serde_json::json!(1), 0.8)],
        ));
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["mode"], "consensus");
        assert_eq!(json["primary"], "a");
    }

    #[test]
    fn test_failure_display() {
        let failure = TaskFailure::new(
            TaskId::from("task-1-1"),
            FailureKind::ConsensusRejected,
            "confidence 0.40 below threshold 0.70",
        )
        .with_worker("coder");
        assert_eq!(
            failure.to_string(),
            "task-1-1 (consensus_rejected): confidence 0.40 below threshold 0.70"
        );
        assert_eq!(failure.worker.as_deref(), Some("coder"));
    }
}
