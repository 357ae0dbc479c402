//! Liveness bookkeeping for spawned workers
//!
//! The registry is owned by the acceptor loop. It does not bound concurrency;
//! admission is handled separately. Finished workers are discovered by
//! periodic [`reap`](WorkerRegistry::reap) sweeps, so membership lags worker
//! termination by at most one poll interval.

use crate::events::{WorkerId, WorkerOutcome};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

/// A spawned worker
#[derive(Debug)]
pub struct WorkerHandle {
    pub id: WorkerId,
    pub peer: SocketAddr,
    task: JoinHandle<WorkerOutcome>,
}

/// Workers still running when shutdown began, and what became of them
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Workers that reached a terminal state within the shutdown timeout
    pub completed: Vec<(WorkerId, WorkerOutcome)>,
    /// Workers cancelled when the timeout elapsed
    pub aborted: Vec<WorkerId>,
}

impl ShutdownReport {
    pub fn forwarded(&self) -> usize {
        self.completed
            .iter()
            .filter(|(_, outcome)| outcome.is_forwarded())
            .count()
    }
}

/// Owned collection of live workers
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: Vec<WorkerHandle>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: WorkerId, peer: SocketAddr, task: JoinHandle<WorkerOutcome>) {
        self.workers.push(WorkerHandle { id, peer, task });
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn contains(&self, id: WorkerId) -> bool {
        self.workers.iter().any(|w| w.id == id)
    }

    /// Remove every worker that has terminated and return its outcome
    pub async fn reap(&mut self) -> Vec<(WorkerId, WorkerOutcome)> {
        let (finished, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.workers)
            .into_iter()
            .partition(|w| w.task.is_finished());
        self.workers = live;

        let mut reaped = Vec::with_capacity(finished.len());
        for worker in finished {
            let outcome = join_outcome(worker.id, worker.task.await);
            reaped.push((worker.id, outcome));
        }
        reaped
    }

    /// Wait for all workers to finish, aborting those still running after `timeout`
    pub async fn drain(&mut self, timeout: Duration) -> ShutdownReport {
        let deadline = Instant::now() + timeout;
        let mut report = ShutdownReport::default();

        for mut worker in self.workers.drain(..) {
            match tokio::time::timeout_at(deadline, &mut worker.task).await {
                Ok(joined) => report.completed.push((worker.id, join_outcome(worker.id, joined))),
                Err(_) => {
                    tracing::warn!(id = worker.id, peer = %worker.peer, "Aborting worker at shutdown");
                    worker.task.abort();
                    report.aborted.push(worker.id);
                }
            }
        }

        report
    }
}

fn join_outcome(id: WorkerId, joined: Result<WorkerOutcome, JoinError>) -> WorkerOutcome {
    match joined {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(id, error = %e, "Worker task did not complete");
            WorkerOutcome::Aborted
        }
    }
}
