use crate::registry::Candidate;
use hive_core::Task;
use std::cmp::Ordering;

/// Whether a worker specialty covers a task type: the specialty must be a
/// case-insensitive prefix or substring of the type.
pub fn specialty_matches(specialty: &str, task_type: &str) -> bool {
    let specialty = specialty.trim().to_lowercase();
    if specialty.is_empty() {
        return false;
    }
    task_type.to_lowercase().contains(&specialty)
}

/// How well a candidate fits a task. Higher ranks first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Suitability {
    pub specialty_match: bool,
    pub workload: f64,
}

impl Suitability {
    fn rank(&self, other: &Self) -> Ordering {
        other
            .specialty_match
            .cmp(&self.specialty_match)
            .then_with(|| self.workload.total_cmp(&other.workload))
    }
}

/// Picks workers for a task.
///
/// Candidates are assumed healthy and in registration order; workers that
/// decline the task are dropped before ranking.
#[derive(Debug, Clone, Copy)]
pub struct SelectionEngine {
    load_balancing: bool,
}

impl SelectionEngine {
    pub fn new(load_balancing: bool) -> Self {
        Self { load_balancing }
    }

    pub fn load_balancing(&self) -> bool {
        self.load_balancing
    }

    pub fn score(task: &Task, candidate: &Candidate) -> Suitability {
        Suitability {
            specialty_match: specialty_matches(&candidate.specialty, &task.task_type),
            workload: candidate.worker.workload().clamp(0.0, 1.0),
        }
    }

    /// Candidates whose accept predicate passes, in registration order.
    pub fn eligible(task: &Task, candidates: &[Candidate]) -> Vec<Candidate> {
        candidates
            .iter()
            .filter(|c| c.worker.can_accept_task(task))
            .cloned()
            .collect()
    }

    /// Order eligible candidates best first. Ties keep registration order.
    pub fn rank(&self, task: &Task, eligible: Vec<Candidate>) -> Vec<Candidate> {
        if !self.load_balancing {
            return eligible;
        }
        let mut scored: Vec<(Suitability, Candidate)> = eligible
            .into_iter()
            .map(|c| (Self::score(task, &c), c))
            .collect();
        scored.sort_by(|a, b| a.0.rank(&b.0));
        scored.into_iter().map(|(_, c)| c).collect()
    }

    /// The single best eligible worker.
    pub fn select(&self, task: &Task, candidates: &[Candidate]) -> Option<Candidate> {
        let eligible = Self::eligible(task, candidates);
        self.rank(task, eligible).into_iter().next()
    }

    /// The best `min(n, eligible)` workers, best first.
    pub fn select_many(&self, task: &Task, candidates: &[Candidate], n: usize) -> Vec<Candidate> {
        let eligible = Self::eligible(task, candidates);
        let mut ranked = self.rank(task, eligible);
        ranked.truncate(n);
        ranked
    }
}
