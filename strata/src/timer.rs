// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The persistence round driver.

use std::{
    panic::{self, AssertUnwindSafe},
    pin::pin,
    sync::{Arc, Mutex, PoisonError},
    thread,
    time::{Duration, Instant},
};

use futures::future::{Either, select};
use strata_aggregation::{BatchDao, PersistenceWorker, PrepareRequest};
use tokio::time::MissedTickBehavior;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// What one round did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RoundSummary {
    /// Requests prepared across all workers
    pub requests: usize,
    /// Whether the batch flush succeeded. `true` when there was nothing to flush.
    pub flushed: bool,
    /// Wall time of the round
    pub elapsed: Duration,
}

/// Runs persistence rounds over a set of workers.
///
/// A round prepares requests from every worker, in parallel across workers on up to
/// `prepare_threads` threads, executes all of them in one [`BatchDao::flush`], then ends the
/// round on every worker. Rounds never overlap: a round started while another one is running
/// waits for it.
pub struct PersistenceTimer {
    workers: Vec<Arc<dyn PersistenceWorker>>,
    batch: Arc<dyn BatchDao>,
    prepare_threads: usize,
    running: Mutex<()>,
}

impl std::fmt::Debug for PersistenceTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceTimer")
            .field("workers", &self.workers.iter().map(|w| w.name()).collect::<Vec<_>>())
            .field("prepare_threads", &self.prepare_threads)
            .finish_non_exhaustive()
    }
}

impl PersistenceTimer {
    /// A timer flushing through `batch`, without workers.
    pub fn new(batch: Arc<dyn BatchDao>) -> Self {
        Self {
            workers: vec![],
            batch,
            prepare_threads: 2,
            running: Mutex::new(()),
        }
    }

    /// Threads preparing requests of different workers concurrently. Defaults to 2.
    pub fn prepare_threads(mut self, prepare_threads: usize) -> Self {
        assert!(prepare_threads > 0, "prepare_threads must be positive");
        self.prepare_threads = prepare_threads;
        self
    }

    /// Drive `worker` on every round.
    pub fn register(&mut self, worker: Arc<dyn PersistenceWorker>) {
        self.workers.push(worker);
    }

    /// Registered workers.
    pub fn workers(&self) -> &[Arc<dyn PersistenceWorker>] {
        &self.workers
    }

    /// Run one round now, on the calling thread.
    pub fn run_round(&self) -> RoundSummary {
        let _running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        let start = Instant::now();

        let requests = self.prepare();
        let count = requests.len();
        let flushed = if requests.is_empty() {
            true
        } else {
            match self.batch.flush(requests) {
                Ok(()) => true,
                Err(err) => {
                    metrics_024::counter!("strata_persistence_round_failures").increment(1);
                    strata_carrier::rate_limited!(
                        Duration::from_secs(10),
                        tracing::error!(requests = count, "persistence batch flush failed: {err}")
                    );
                    false
                }
            }
        };
        for worker in &self.workers {
            worker.end_of_round();
        }

        let elapsed = start.elapsed();
        metrics_024::counter!("strata_persistence_prepare_requests").increment(count as u64);
        metrics_024::histogram!("strata_persistence_round_duration_ms").record(elapsed.as_secs_f64() * 1000.0);
        tracing::debug!(requests = count, ?elapsed, flushed, "persistence round finished");
        RoundSummary {
            requests: count,
            flushed,
            elapsed,
        }
    }

    fn prepare(&self) -> Vec<PrepareRequest> {
        if self.prepare_threads == 1 || self.workers.len() <= 1 {
            return self.workers.iter().flat_map(|w| prepare_one(&**w)).collect();
        }
        let per_thread = self.workers.len().div_ceil(self.prepare_threads);
        thread::scope(|s| {
            let tasks: Vec<_> = self
                .workers
                .chunks(per_thread)
                .map(|chunk| s.spawn(move || chunk.iter().flat_map(|w| prepare_one(&**w)).collect::<Vec<_>>()))
                .collect();
            tasks
                .into_iter()
                // prepare_one catches worker panics, so a join never fails
                .flat_map(|task| task.join().unwrap_or_default())
                .collect()
        })
    }

    /// Run rounds every `period` on the current tokio runtime until the handle is shut down.
    ///
    /// The first round runs one `period` after the call. Rounds run on the blocking pool and each
    /// one is awaited before the next tick, so a slow round delays the following ones instead of
    /// overlapping them.
    pub fn start(self: Arc<Self>, period: Duration) -> PersistenceTimerHandle {
        let tracker = TaskTracker::new();
        let cancellation = CancellationToken::new();
        let shutdown_signal = cancellation.clone();
        tracker.spawn(async move {
            let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            while let Either::Left(_tick) = select(pin!(ticks.tick()), pin!(shutdown_signal.cancelled())).await {
                let timer = self.clone();
                if let Err(err) = tokio::task::spawn_blocking(move || timer.run_round()).await {
                    tracing::error!("persistence round panicked: {err}");
                }
            }
            tracing::info!("persistence timer stopped");
        });
        tracker.close();
        PersistenceTimerHandle {
            tracker,
            cancellation,
        }
    }
}

fn prepare_one(worker: &dyn PersistenceWorker) -> Vec<PrepareRequest> {
    match panic::catch_unwind(AssertUnwindSafe(|| worker.build_batch_requests())) {
        Ok(requests) => requests,
        Err(_) => {
            tracing::error!(worker = worker.name(), "preparing persistence requests panicked");
            vec![]
        }
    }
}

/// Stops the rounds started by [`PersistenceTimer::start`].
///
/// Dropping the handle stops the timer without waiting for a running round.
#[derive(Debug)]
pub struct PersistenceTimerHandle {
    tracker: TaskTracker,
    cancellation: CancellationToken,
}

impl PersistenceTimerHandle {
    /// Stop the timer and wait for a running round to finish.
    pub async fn shut_down(self) {
        self.cancellation.cancel();
        self.tracker.wait().await;
    }
}

impl Drop for PersistenceTimerHandle {
    fn drop(&mut self) {
        self.cancellation.cancel();
    }
}
