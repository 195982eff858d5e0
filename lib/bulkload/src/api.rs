use crate::stats::Progress;
use anyhow::Result;
use crossbeam_channel::{Receiver, Sender};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};

// ========== Data carried between stages ==========

/// A posting candidate: the unit produced by mappers, spilled to runs and
/// grouped by the shuffle. Postings sharing `group_key` end up in one batch.
pub trait Posting: Serialize + DeserializeOwned + Send + 'static {
    fn group_key(&self) -> &[u8];
}

// ========== Map / reduce collaborators ==========

/// Turns one raw record into zero or more postings.
///
/// Whether a malformed record is skipped (emit nothing, return `Ok`) or is
/// fatal (return `Err`) is the transformer's decision; the loader forwards
/// either outcome unchanged.
pub trait RecordTransformer: Send + Sync {
    type Posting: Posting;

    fn transform<F>(&self, record: &str, emit: &mut F) -> Result<()>
    where
        F: FnMut(Self::Posting);
}

/// Consumes one grouped batch. Called concurrently from up to `num_workers`
/// reducer threads.
pub trait Aggregator: Send + Sync {
    type Posting: Posting;

    fn aggregate(&self, batch: Vec<Self::Posting>) -> Result<()>;

    /// Called once after every batch has been aggregated.
    fn finish(&self) -> Result<()> {
        Ok(())
    }
}

// ========== Spill / shuffle stages ==========

/// Drains the posting queue until it is closed and persists it as runs under
/// `dir`. How many runs are produced is up to the implementation.
pub trait SpillWriter<P>: Send + Sync {
    fn write_runs(&self, dir: &Path, postings: Receiver<P>, progress: &Progress) -> Result<Vec<PathBuf>>;
}

/// Streams one run back, in the order it was written, as `Ok` items. Returns
/// the number of postings sent. A read failure is returned; the loader
/// forwards it down the same queue.
pub trait SpillReader<P>: Send + Sync {
    fn read_run(&self, run: &Path, postings: &Sender<Result<P>>) -> Result<u64>;
}

/// Merges per-run streams into batches of postings that share a grouping key.
///
/// A run queue that disconnects is exhausted. An `Err` item means that run
/// could not be read to the end: the merge must stop emitting and return it.
pub trait Merger<P>: Send + Sync {
    fn shuffle(&self, runs: Vec<Receiver<Result<P>>>, batches: Sender<Vec<P>>, progress: &Progress) -> Result<()>;
}
