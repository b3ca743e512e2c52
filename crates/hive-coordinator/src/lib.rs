//! Multi-worker task coordination: queueing, worker selection, direct and
//! consensus execution, and health monitoring.
//!
//! Callers submit tasks to a [`Coordinator`], which queues them, picks the
//! best-suited registered [`Worker`] (or a group of them for consensus
//! mode), records the outcome, and keeps aggregate metrics. Workers are
//! pluggable trait objects; three built-in specialists are provided.
//!
//! # Main types
//!
//! - [`Coordinator`]: Lifecycle owner and public API (submit, await, metrics).
//! - [`Worker`]: Contract every capability provider implements.
//! - [`TaskQueue`]: Pending/active/completed/failed bookkeeping.
//! - [`SelectionEngine`]: Specialty and workload based worker ranking.
//! - [`ExecutionEngine`]: Runs tasks in direct or consensus mode.
//! - [`HealthMonitor`]: Periodic worker probes and utilization refresh.
//! - [`CoordinatorConfig`]: Tuning knobs, loadable from TOML.

/// Built-in specialist workers.
pub mod builtins;
/// Coordinator configuration.
pub mod config;
/// Coordinator façade and lifecycle.
pub mod coordinator;
/// Worker and coordinator event types.
pub mod events;
/// Direct and consensus execution.
pub mod execution;
/// Worker health monitoring.
pub mod health;
/// Aggregate metrics.
pub mod metrics;
/// Worker registry.
pub mod registry;
/// Worker selection.
pub mod selection;
/// Task lifecycle collections.
pub mod task_queue;
/// The worker trait.
pub mod worker;

pub use builtins::{builtin_workers, SpecialistQueen};
pub use config::CoordinatorConfig;
pub use coordinator::{Coordinator, LifecycleState};
pub use events::{CoordinatorEvent, EventBus, WorkerEvent, WorkerEventSender};
pub use execution::ExecutionEngine;
pub use health::{HealthMonitor, HealthReport};
pub use metrics::{CoordinatorMetrics, MetricsTracker};
pub use registry::{Candidate, WorkerRecord, WorkerRegistry};
pub use selection::{specialty_matches, SelectionEngine, Suitability};
pub use task_queue::{ActiveTask, TaskQueue};
pub use worker::{gather_consensus, Worker};
