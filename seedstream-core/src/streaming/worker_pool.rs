//! Parallel fetch workers driving the stream's pieces to completion.
//!
//! Worker `i` of `n` owns the stripe `start + i`, `start + i + n`, ... of the
//! stream. Every worker takes part in every barrier round, including rounds
//! where its stripe is already exhausted, so the barrier always sees the full
//! party count and a short final round cannot deadlock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::Instrument;

use super::completion::wait_for_piece_retrying;
use super::{PieceScheduler, RendezvousBarrier, StreamingError, StreamingResult};
use crate::swarm::{PieceFetchPort, PieceIndex};

/// Pieces owned by worker `worker_id` of `worker_count` over `start..=last`.
pub fn owned_indices(
    start: u32,
    last: u32,
    worker_id: usize,
    worker_count: usize,
) -> Vec<PieceIndex> {
    if worker_count == 0 || start > last {
        return Vec::new();
    }
    (start..=last)
        .skip(worker_id)
        .step_by(worker_count)
        .map(PieceIndex::new)
        .collect()
}

/// Summary of one worker's run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    /// Worker position in the pool
    pub worker_id: usize,
    /// Pieces this worker saw complete
    pub pieces_fetched: usize,
    /// Barrier rounds this worker took part in
    pub rounds: usize,
}

struct FetchWorker<P: PieceFetchPort + ?Sized> {
    id: usize,
    owned: Vec<PieceIndex>,
    rounds: usize,
    port: Arc<P>,
    scheduler: Arc<PieceScheduler<P>>,
    barrier: Arc<RendezvousBarrier>,
    poll_interval: Duration,
}

impl<P: PieceFetchPort + ?Sized> FetchWorker<P> {
    async fn run(self) -> StreamingResult<WorkerReport> {
        let mut events = self.port.subscribe();
        let mut pieces_fetched = 0;

        for round in 0..self.rounds {
            if let Some(&index) = self.owned.get(round) {
                self.scheduler.claim(index)?;
                wait_for_piece_retrying(&*self.port, &mut events, index, self.poll_interval)
                    .await?;
                pieces_fetched += 1;
                tracing::trace!("Worker {} has piece {}", self.id, index);
            }
            self.barrier.wait().await;
        }

        tracing::debug!(
            "Worker {} finished after {} rounds, {} pieces",
            self.id,
            self.rounds,
            pieces_fetched
        );
        Ok(WorkerReport {
            worker_id: self.id,
            pieces_fetched,
            rounds: self.rounds,
        })
    }
}

/// Running set of fetch workers for one stream.
pub struct WorkerPool {
    tasks: JoinSet<StreamingResult<WorkerReport>>,
    worker_ids: HashMap<tokio::task::Id, usize>,
    worker_count: usize,
    rounds: usize,
}

impl WorkerPool {
    /// Spawns one worker per barrier party, each running inside `span`.
    ///
    /// The worker count is the barrier's party count and should equal
    /// `min(window_piece_count, stream piece count)`.
    pub fn spawn<P>(
        port: Arc<P>,
        scheduler: Arc<PieceScheduler<P>>,
        barrier: Arc<RendezvousBarrier>,
        poll_interval: Duration,
        span: tracing::Span,
    ) -> Self
    where
        P: PieceFetchPort + ?Sized + 'static,
    {
        let offset = *scheduler.offset();
        let start = offset.piece_start.as_u32();
        let last = offset.last_piece().as_u32();
        let worker_count = barrier.parties();
        let rounds = (offset.piece_count() as usize).div_ceil(worker_count);

        let mut tasks = JoinSet::new();
        let mut worker_ids = HashMap::with_capacity(worker_count);
        for id in 0..worker_count {
            let worker = FetchWorker {
                id,
                owned: owned_indices(start, last, id, worker_count),
                rounds,
                port: Arc::clone(&port),
                scheduler: Arc::clone(&scheduler),
                barrier: Arc::clone(&barrier),
                poll_interval,
            };
            let handle = tasks.spawn(worker.run().instrument(span.clone()));
            worker_ids.insert(handle.id(), id);
        }

        tracing::info!(
            "Spawned {} fetch workers for pieces {}..={} ({} rounds)",
            worker_count,
            start,
            last,
            rounds
        );

        Self {
            tasks,
            worker_ids,
            worker_count,
            rounds,
        }
    }

    /// Number of workers.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Barrier rounds every worker runs through.
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    /// Resolves with the first worker failure.
    ///
    /// Workers that finish cleanly are reaped silently. If every worker
    /// finishes cleanly this never resolves, so it is meant to be raced
    /// against the assembler.
    pub async fn wait_for_failure(&mut self) -> StreamingError {
        while let Some(joined) = self.tasks.join_next_with_id().await {
            match joined {
                Ok((_, Ok(report))) => {
                    tracing::trace!("Reaped worker {}", report.worker_id);
                }
                Ok((_, Err(e))) => return e,
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    let worker_id = self.worker_ids.get(&e.id()).copied().unwrap_or_default();
                    return StreamingError::WorkerPanicked {
                        worker_id,
                        reason: e.to_string(),
                    };
                }
            }
        }
        std::future::pending().await
    }

    /// Waits for every worker and collects their reports.
    ///
    /// # Errors
    ///
    /// - Any error a worker returned
    /// - `StreamingError::WorkerPanicked` - A worker panicked or was aborted
    pub async fn join(mut self) -> StreamingResult<Vec<WorkerReport>> {
        let mut reports = Vec::with_capacity(self.worker_count);
        while let Some(joined) = self.tasks.join_next_with_id().await {
            match joined {
                Ok((_, report)) => reports.push(report?),
                Err(e) => {
                    let worker_id = self.worker_ids.get(&e.id()).copied().unwrap_or_default();
                    return Err(StreamingError::WorkerPanicked {
                        worker_id,
                        reason: e.to_string(),
                    });
                }
            }
        }
        reports.sort_by_key(|report| report.worker_id);
        Ok(reports)
    }

    /// Aborts every worker still running.
    pub fn shutdown(&mut self) {
        if !self.tasks.is_empty() {
            tracing::debug!("Aborting {} fetch workers", self.tasks.len());
        }
        self.tasks.abort_all();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.tasks.abort_all();
    }
}
