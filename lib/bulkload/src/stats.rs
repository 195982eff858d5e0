use anyhow::{Context, Result};
use crossbeam_channel as channel;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

/// Live counters shared by every stage of a load.
pub struct Progress {
    start: Instant,
    records_read: AtomicU64,
    postings_mapped: AtomicU64,
    postings_spilled: AtomicU64,
    runs_written: AtomicU64,
    postings_shuffled: AtomicU64,
    batches_shuffled: AtomicU64,
    batches_reduced: AtomicU64,
    keys_written: AtomicU64,
}

#[derive(Default, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub records_read: u64,
    pub postings_mapped: u64,
    pub postings_spilled: u64,
    pub runs_written: u64,
    pub postings_shuffled: u64,
    pub batches_shuffled: u64,
    pub batches_reduced: u64,
    pub keys_written: u64,
    pub elapsed_ms: u64,
}

impl Default for Progress {
    fn default() -> Self { Self::new() }
}

impl Progress {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            records_read: AtomicU64::new(0),
            postings_mapped: AtomicU64::new(0),
            postings_spilled: AtomicU64::new(0),
            runs_written: AtomicU64::new(0),
            postings_shuffled: AtomicU64::new(0),
            batches_shuffled: AtomicU64::new(0),
            batches_reduced: AtomicU64::new(0),
            keys_written: AtomicU64::new(0),
        }
    }

    pub fn record_read(&self) { self.records_read.fetch_add(1, Ordering::Relaxed); }
    pub fn add_mapped(&self, n: u64) { self.postings_mapped.fetch_add(n, Ordering::Relaxed); }
    pub fn add_spilled(&self, n: u64) { self.postings_spilled.fetch_add(n, Ordering::Relaxed); }
    pub fn run_written(&self) { self.runs_written.fetch_add(1, Ordering::Relaxed); }

    pub fn batch_shuffled(&self, postings: u64) {
        self.postings_shuffled.fetch_add(postings, Ordering::Relaxed);
        self.batches_shuffled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn batch_reduced(&self) { self.batches_reduced.fetch_add(1, Ordering::Relaxed); }
    pub fn key_written(&self) { self.keys_written.fetch_add(1, Ordering::Relaxed); }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            records_read: self.records_read.load(Ordering::Relaxed),
            postings_mapped: self.postings_mapped.load(Ordering::Relaxed),
            postings_spilled: self.postings_spilled.load(Ordering::Relaxed),
            runs_written: self.runs_written.load(Ordering::Relaxed),
            postings_shuffled: self.postings_shuffled.load(Ordering::Relaxed),
            batches_shuffled: self.batches_shuffled.load(Ordering::Relaxed),
            batches_reduced: self.batches_reduced.load(Ordering::Relaxed),
            keys_written: self.keys_written.load(Ordering::Relaxed),
            elapsed_ms: self.start.elapsed().as_millis() as u64,
        }
    }

    /// Emit one progress line.
    pub fn report(&self) {
        let s = self.snapshot();
        let secs = (s.elapsed_ms as f64 / 1000.0).max(0.001);
        info!(
            records = s.records_read,
            records_per_sec = (s.records_read as f64 / secs) as u64,
            postings_mapped = s.postings_mapped,
            runs = s.runs_written,
            batches_shuffled = s.batches_shuffled,
            batches_reduced = s.batches_reduced,
            elapsed_ms = s.elapsed_ms,
            "progress"
        );
    }

    pub fn end_summary(&self) {
        let s = self.snapshot();
        info!(
            records = s.records_read,
            postings_mapped = s.postings_mapped,
            postings_spilled = s.postings_spilled,
            runs = s.runs_written,
            postings_shuffled = s.postings_shuffled,
            batches = s.batches_reduced,
            keys = s.keys_written,
            wall_ms = s.elapsed_ms,
            "Load complete"
        );
    }

    /// Start a thread that calls [`Progress::report`] every `every` until the
    /// returned [`Reporter`] is stopped or dropped.
    pub fn start_reporting(self: &Arc<Self>, every: Duration) -> Result<Reporter> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let progress = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("progress".into())
            .spawn(move || {
                let ticker = channel::tick(every);
                loop {
                    channel::select! {
                        recv(ticker) -> _ => progress.report(),
                        // disconnects when the Reporter is stopped
                        recv(stop_rx) -> _ => break,
                    }
                }
            })
            .context("spawn progress reporter")?;
        Ok(Reporter { stop: Some(stop_tx), handle: Some(handle) })
    }
}

pub struct Reporter {
    stop: Option<channel::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Reporter {
    pub fn stop(mut self) { self.shutdown(); }

    fn shutdown(&mut self) {
        drop(self.stop.take());
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for Reporter {
    fn drop(&mut self) { self.shutdown(); }
}
