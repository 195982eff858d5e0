//! Bounded-concurrency reducer pool.

use crate::api::Aggregator;
use crate::stats::Progress;
use crate::sync::Limiter;
use anyhow::{anyhow, Context, Result};
use crossbeam_channel::Receiver;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};
use tracing::error;

/// Runs one aggregation task per batch on a dedicated rayon pool. A
/// [`Limiter`] token is taken before each task is spawned and returned when the
/// task ends, so at most `width` aggregations are ever in flight.
pub struct ReducerPool {
    pool: rayon::ThreadPool,
    limiter: Limiter,
}

impl ReducerPool {
    pub fn new(width: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(width)
            .thread_name(|i| format!("reducer-{}", i))
            .build()
            .context("build reducer pool")?;
        Ok(Self { pool, limiter: Limiter::new(width) })
    }

    pub fn width(&self) -> usize { self.limiter.capacity() }

    /// Aggregate every batch until the queue is closed, then wait for all
    /// tasks. Failed batches are logged and not retried; the first failure is
    /// returned once every task has finished. Returns the number of batches
    /// dispatched.
    pub fn run<A: Aggregator>(&self, batches: Receiver<Vec<A::Posting>>, aggregator: &A, progress: &Progress) -> Result<u64> {
        let failures: Mutex<Vec<anyhow::Error>> = Mutex::new(Vec::new());
        let mut dispatched = 0u64;

        self.pool.in_place_scope(|scope| {
            for batch in batches.iter() {
                let permit = self.limiter.acquire();
                dispatched += 1;
                let failures = &failures;
                scope.spawn(move |_| {
                    let _permit = permit;
                    let postings = batch.len();
                    let res = panic::catch_unwind(AssertUnwindSafe(|| aggregator.aggregate(batch)))
                        .unwrap_or_else(|_| Err(anyhow!("aggregator panicked")));
                    match res {
                        Ok(()) => progress.batch_reduced(),
                        Err(e) => {
                            error!(postings, error = %format!("{:#}", e), "aggregate failed");
                            failures.lock().unwrap_or_else(PoisonError::into_inner).push(e);
                        }
                    }
                });
            }
        });

        let mut failures = failures.into_inner().unwrap_or_else(PoisonError::into_inner);
        if failures.is_empty() {
            return Ok(dispatched);
        }
        let failed = failures.len();
        Err(failures.remove(0)).with_context(|| format!("{} of {} batches failed to aggregate", failed, dispatched))
    }
}
