use crate::worker::Worker;
use chrono::{DateTime, Utc};
use hive_core::{HiveError, HiveResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

struct WorkerEntry {
    name: String,
    specialty: String,
    worker: Arc<dyn Worker>,
    healthy: bool,
    workload: f64,
    last_checked: Option<DateTime<Utc>>,
}

/// Serializable view of a registered worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub name: String,
    pub specialty: String,
    /// Reading from the last health cycle.
    pub workload: f64,
    pub healthy: bool,
    pub last_checked: Option<DateTime<Utc>>,
}

/// A healthy worker offered to the selection engine.
#[derive(Clone)]
pub struct Candidate {
    pub name: String,
    pub specialty: String,
    pub worker: Arc<dyn Worker>,
}

impl std::fmt::Debug for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Candidate")
            .field("name", &self.name)
            .field("specialty", &self.specialty)
            .finish_non_exhaustive()
    }
}

/// Registered workers in registration order.
///
/// Owned by a single coordinator. Workers start out healthy; the health
/// monitor flips the flag, which only affects selection, never membership.
#[derive(Default)]
pub struct WorkerRegistry {
    entries: Vec<WorkerEntry>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a worker under a unique name.
    pub fn register(&mut self, name: impl Into<String>, worker: Arc<dyn Worker>) -> HiveResult<()> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(HiveError::Registry("worker name must not be empty".to_string()));
        }
        if self.contains(&name) {
            return Err(HiveError::Registry(format!(
                "worker '{name}' is already registered"
            )));
        }
        let specialty = worker.specialty().to_string();
        let workload = worker.workload();
        self.entries.push(WorkerEntry {
            name,
            specialty,
            worker,
            healthy: true,
            workload,
            last_checked: None,
        });
        Ok(())
    }

    /// Remove a worker, handing it back to the caller.
    pub fn remove(&mut self, name: &str) -> HiveResult<Arc<dyn Worker>> {
        let index = self
            .entries
            .iter()
            .position(|e| e.name == name)
            .ok_or_else(|| HiveError::Registry(format!("worker '{name}' is not registered")))?;
        Ok(self.entries.remove(index).worker)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Worker>> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| Arc::clone(&e.worker))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name == name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    /// Every worker handle with its name, in registration order.
    pub fn workers(&self) -> Vec<(String, Arc<dyn Worker>)> {
        self.entries
            .iter()
            .map(|e| (e.name.clone(), Arc::clone(&e.worker)))
            .collect()
    }

    pub fn records(&self) -> Vec<WorkerRecord> {
        self.entries
            .iter()
            .map(|e| WorkerRecord {
                name: e.name.clone(),
                specialty: e.specialty.clone(),
                workload: e.workload,
                healthy: e.healthy,
                last_checked: e.last_checked,
            })
            .collect()
    }

    /// Healthy workers in registration order.
    pub fn healthy_candidates(&self) -> Vec<Candidate> {
        self.entries
            .iter()
            .filter(|e| e.healthy)
            .map(|e| Candidate {
                name: e.name.clone(),
                specialty: e.specialty.clone(),
                worker: Arc::clone(&e.worker),
            })
            .collect()
    }

    /// Store a health-cycle reading. Returns the previous health flag, or
    /// `None` if the worker was removed in the meantime.
    pub fn record_health(&mut self, name: &str, healthy: bool, workload: f64) -> Option<bool> {
        let entry = self.entries.iter_mut().find(|e| e.name == name)?;
        let previous = entry.healthy;
        entry.healthy = healthy;
        entry.workload = workload.clamp(0.0, 1.0);
        entry.last_checked = Some(Utc::now());
        Some(previous)
    }

    pub fn healthy_count(&self) -> usize {
        self.entries.iter().filter(|e| e.healthy).count()
    }
}
