//! K-way merge of per-run posting streams into one batch per grouping key.

use crate::api::{Merger, Posting};
use crate::stats::Progress;
use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{Receiver, Sender};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

/// Head of one run stream inside the merge heap.
struct HeapEntry<P> {
    posting: P,
    run: usize,
}

impl<P: Posting> HeapEntry<P> {
    fn cmp_key(&self, other: &Self) -> Ordering {
        self.posting.group_key().cmp(other.posting.group_key()).then(self.run.cmp(&other.run))
    }
}

impl<P: Posting> PartialEq for HeapEntry<P> {
    fn eq(&self, other: &Self) -> bool { self.cmp_key(other) == Ordering::Equal }
}

impl<P: Posting> Eq for HeapEntry<P> {}

impl<P: Posting> PartialOrd for HeapEntry<P> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl<P: Posting> Ord for HeapEntry<P> {
    fn cmp(&self, other: &Self) -> Ordering { self.cmp_key(other) }
}

/// Merges key-sorted run streams with a min-heap ordered by
/// `(group_key, run index)`. Each distinct key is emitted as exactly one batch,
/// keys in ascending order; within a batch, postings from lower-numbered runs
/// come first and each run's own order is kept.
#[derive(Clone, Copy, Debug, Default)]
pub struct KWayMerger;

/// Next posting of `run`, `None` once its queue is closed.
fn next_posting<P>(runs: &[Receiver<Result<P>>], run: usize) -> Result<Option<P>> {
    match runs[run].recv() {
        Ok(item) => item.map(Some).with_context(|| format!("run {} failed mid-merge", run)),
        Err(_) => Ok(None),
    }
}

impl<P: Posting> Merger<P> for KWayMerger {
    fn shuffle(&self, runs: Vec<Receiver<Result<P>>>, batches: Sender<Vec<P>>, progress: &Progress) -> Result<()> {
        let mut heap = BinaryHeap::with_capacity(runs.len());
        for run in 0..runs.len() {
            if let Some(posting) = next_posting(&runs, run)? {
                heap.push(Reverse(HeapEntry { posting, run }));
            }
        }

        let emit = |batch: Vec<P>| -> Result<()> {
            let n = batch.len() as u64;
            batches.send(batch).map_err(|_| anyhow!("batch queue closed by the reducers"))?;
            progress.batch_shuffled(n);
            Ok(())
        };

        let mut batch: Vec<P> = Vec::new();
        while let Some(Reverse(HeapEntry { posting, run })) = heap.pop() {
            // The open batch may still be missing postings of a failed run,
            // so an error drops it unsent.
            if let Some(next) = next_posting(&runs, run)? {
                heap.push(Reverse(HeapEntry { posting: next, run }));
            }
            if batch.first().map_or(false, |first| first.group_key() != posting.group_key()) {
                emit(std::mem::take(&mut batch))?;
            }
            batch.push(posting);
        }
        if !batch.is_empty() {
            emit(batch)?;
        }
        Ok(())
    }
}
