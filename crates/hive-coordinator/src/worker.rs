use crate::events::WorkerEventSender;
use async_trait::async_trait;
use futures_util::future::{join, join_all};
use hive_core::{Consensus, HiveResult, Task, WorkerOutput};
use std::sync::Arc;
use tracing::warn;

/// Contract every capability provider ("queen") implements.
///
/// The coordinator only ever holds `Arc<dyn Worker>`; it never sees concrete
/// types. Synchronous methods must be cheap: they are called while ranking.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Tag describing what this worker is good at, e.g. `"code-generation"`.
    fn specialty(&self) -> &str;

    /// Current load in `[0, 1]`; 0 is idle, 1 is saturated.
    fn workload(&self) -> f64;

    /// Whether the worker is willing to take this task right now.
    fn can_accept_task(&self, task: &Task) -> bool;

    /// Produce a single result for the task.
    async fn process(&self, task: &Task) -> HiveResult<WorkerOutput>;

    /// Drive a collaboration round with `peers`, yielding an aggregated
    /// consensus. The default runs `process` on self and every peer
    /// concurrently and averages their confidences; a failing peer is left
    /// out, a failing primary fails the round.
    async fn collaborate(&self, task: &Task, peers: &[Arc<dyn Worker>]) -> HiveResult<Consensus> {
        gather_consensus(self, task, peers).await
    }

    async fn is_healthy(&self) -> bool;

    /// Release resources. Must be safe to call more than once.
    async fn shutdown(&self);

    /// Receive the channel for lifecycle notifications. Workers that emit
    /// nothing can ignore it.
    fn subscribe(&self, _events: WorkerEventSender) {}
}

/// Run `task` on `primary` and every peer concurrently and aggregate the
/// outputs into a [`Consensus`] led by `primary`.
///
/// This is the body of [`Worker::collaborate`]'s default, exposed so workers
/// that override `collaborate` can still reuse it.
pub async fn gather_consensus<W>(
    primary: &W,
    task: &Task,
    peers: &[Arc<dyn Worker>],
) -> HiveResult<Consensus>
where
    W: Worker + ?Sized,
{
    let (own, peer_results) = join(
        primary.process(task),
        join_all(peers.iter().map(|peer| peer.process(task))),
    )
    .await;
    let own = own?;
    let leader = own.worker.clone();

    let mut contributions = vec![own];
    for result in peer_results {
        match result {
            Ok(output) => contributions.push(output),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Peer dropped out of collaboration");
            }
        }
    }

    Ok(Consensus::from_contributions(
        task.id.clone(),
        leader,
        contributions,
    ))
}
