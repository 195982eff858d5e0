use crate::api::{Aggregator, Merger, Posting, RecordTransformer, SpillReader, SpillWriter};
use crate::constants::RUN_DIR_PREFIX;
use crate::io::ensure_dir;
use crate::reader::RunReader;
use crate::reduce::ReducerPool;
use crate::shuffle::KWayMerger;
use crate::source::{open_records, RecordStream};
use crate::state::SharedState;
use crate::stats::{Progress, Reporter};
use crate::sync::{join_all, queue, spawn_worker, StopFlag};
use crate::utils::fd_soft_limit;
use crate::writer::RunWriter;
use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{Receiver, SendError, Sender};
use std::fs;
use std::io::ErrorKind;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Loader lifecycle. Phases run strictly in this order, each at most once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Mapping,
    Reducing,
    CleaningUp,
    Done,
}

/// The spill side of the pipeline: how postings go to disk, come back, and
/// get grouped.
pub struct SpillStages<P> {
    pub writer: Box<dyn SpillWriter<P>>,
    pub reader: Box<dyn SpillReader<P>>,
    pub merger: Box<dyn Merger<P>>,
}

impl<P: Posting> SpillStages<P> {
    /// Sorted run files with a `spill_bytes` buffer, mmap readers and a k-way merge.
    pub fn new(spill_bytes: usize) -> Self {
        Self { writer: Box::new(RunWriter::new(spill_bytes)), reader: Box::new(RunReader), merger: Box::new(KWayMerger) }
    }
}

/// Drives one load: map phase (source -> mappers -> spill writer), reduce
/// phase (run readers -> merger -> reducer pool) and cleanup of the
/// temporary directory.
pub struct Loader<T: RecordTransformer, A> {
    state: SharedState,
    transformer: T,
    aggregator: A,
    stages: SpillStages<T::Posting>,
    phase: Phase,
    tmp_dir: Option<PathBuf>,
    runs: Option<Vec<PathBuf>>,
    reduced: bool,
    reporter: Option<Reporter>,
}

impl<T, A> Loader<T, A>
where
    T: RecordTransformer,
    A: Aggregator<Posting = T::Posting>,
{
    pub fn new(state: SharedState, transformer: T, aggregator: A) -> Self {
        let stages = SpillStages::new(state.opts.spill_bytes);
        Self::with_stages(state, transformer, aggregator, stages)
    }

    pub fn with_stages(state: SharedState, transformer: T, aggregator: A, stages: SpillStages<T::Posting>) -> Self {
        Self { state, transformer, aggregator, stages, phase: Phase::Idle, tmp_dir: None, runs: None, reduced: false, reporter: None }
    }

    pub fn phase(&self) -> Phase { self.phase }

    /// Runs produced by a completed map phase.
    pub fn runs(&self) -> Option<&[PathBuf]> { self.runs.as_deref() }

    /// The per-load temporary directory, once the map phase has created it.
    pub fn tmp_dir(&self) -> Option<&Path> { self.tmp_dir.as_deref() }

    pub fn state(&self) -> &SharedState { &self.state }

    pub fn transformer(&self) -> &T { &self.transformer }

    pub fn aggregator(&self) -> &A { &self.aggregator }

    /// Whether the periodic progress reporter is running.
    pub fn is_reporting(&self) -> bool { self.reporter.is_some() }

    /// Map, reduce, clean up.
    pub fn run(&mut self) -> Result<()> {
        self.map_phase()?;
        self.reduce_phase()?;
        self.cleanup()
    }

    pub fn map_phase(&mut self) -> Result<&[PathBuf]> {
        if self.phase != Phase::Idle {
            bail!("map phase already started (loader is {:?})", self.phase);
        }
        self.phase = Phase::Mapping;
        self.reporter = Some(self.state.progress.start_reporting(self.state.opts.progress_interval)?);

        let runs = match self.spill_records() {
            Ok(runs) => runs,
            Err(e) => {
                self.stop_reporting();
                return Err(e);
            }
        };
        let runs: &[PathBuf] = self.runs.insert(runs);
        Ok(runs)
    }

    fn spill_records(&mut self) -> Result<Vec<PathBuf>> {
        let opts = &self.state.opts;
        let progress = &*self.state.progress;
        let records = open_records(&opts.rdf_file)?;
        let tmp_dir = create_run_dir(&opts.tmp_dir)?;
        self.tmp_dir = Some(tmp_dir.clone());
        let width = opts.num_workers;
        let caps = opts.queues;
        info!(rdf = %opts.rdf_file.display(), tmp = %tmp_dir.display(), mappers = width, "Starting map phase");

        let start = Instant::now();
        let transformer = &self.transformer;
        let writer = &*self.stages.writer;
        let stop = StopFlag::new();
        let stop = &stop;
        let runs = thread::scope(|s| -> Result<Vec<PathBuf>> {
            let (record_tx, record_rx) = queue::<String>(caps.records);
            let (posting_tx, posting_rx) = queue::<T::Posting>(caps.postings);

            let dir = tmp_dir.as_path();
            let spill = spawn_worker(s, "spill-writer", move || writer.write_runs(dir, posting_rx, progress))?;
            let mut mappers = Vec::with_capacity(width);
            for i in 0..width {
                let (rx, tx) = (record_rx.clone(), posting_tx.clone());
                mappers.push(spawn_worker(s, format!("mapper-{}", i), move || run_mapper(transformer, rx, tx, progress, stop))?);
            }
            // Only the workers hold these now, so queues close when they exit.
            drop(record_rx);
            drop(posting_tx);

            let fed = feed_records(records, record_tx, progress, stop);
            let mapped = join_all(mappers);
            let written = spill.join();

            let runs = written?;
            mapped?;
            fed?;
            Ok(runs)
        })?;

        info!(
            phase = "map",
            records = progress.snapshot().records_read,
            postings = progress.snapshot().postings_mapped,
            runs = runs.len(),
            wall_ms = start.elapsed().as_millis() as u64,
            "Map phase complete"
        );
        Ok(runs)
    }

    pub fn reduce_phase(&mut self) -> Result<()> {
        let runs = match (self.phase, &self.runs) {
            (Phase::Mapping, Some(runs)) => runs.clone(),
            _ => bail!("reduce phase needs a completed map phase (loader is {:?})", self.phase),
        };
        self.phase = Phase::Reducing;

        let start = Instant::now();
        let batches = match self.merge_runs(&runs) {
            Ok(batches) => batches,
            Err(e) => {
                self.stop_reporting();
                return Err(e);
            }
        };
        self.reduced = true;
        info!(phase = "reduce", runs = runs.len(), batches, wall_ms = start.elapsed().as_millis() as u64, "Reduce phase complete");
        self.stop_reporting();
        self.state.progress.end_summary();
        Ok(())
    }

    fn merge_runs(&self, runs: &[PathBuf]) -> Result<u64> {
        let opts = &self.state.opts;
        let progress = &*self.state.progress;

        let fd_limit = fd_soft_limit();
        info!(runs = runs.len(), fd_soft_limit = fd_limit.unwrap_or(0), reducers = opts.num_workers, "Starting reduce phase");
        if let Some(limit) = fd_limit {
            if runs.len() as u64 >= limit {
                warn!(runs = runs.len(), fd_soft_limit = limit, "more runs than open files allowed; raise the limit or the spill budget");
            }
        }

        let pool = ReducerPool::new(opts.num_workers)?;
        let caps = opts.queues;
        let reader = &*self.stages.reader;
        let merger = &*self.stages.merger;
        let aggregator = &self.aggregator;
        let batches = thread::scope(|s| -> Result<u64> {
            let mut readers = Vec::with_capacity(runs.len());
            let mut inputs = Vec::with_capacity(runs.len());
            for (i, run) in runs.iter().enumerate() {
                let (tx, rx) = queue::<Result<T::Posting>>(caps.runs);
                inputs.push(rx);
                readers.push(spawn_worker(s, format!("run-reader-{}", i), move || read_into(reader, run, tx))?);
            }
            let (batch_tx, batch_rx) = queue::<Vec<T::Posting>>(caps.batches);
            let shuffle = spawn_worker(s, "merger", move || merger.shuffle(inputs, batch_tx, progress))?;

            let reduced = pool.run(batch_rx, aggregator, progress);
            let merged = shuffle.join();
            let read = join_all(readers);

            let batches = reduced?;
            merged?;
            read?;
            Ok(batches)
        })?;

        self.aggregator.finish().context("finish aggregation")?;
        Ok(batches)
    }

    fn stop_reporting(&mut self) {
        if let Some(reporter) = self.reporter.take() {
            reporter.stop();
        }
    }

    /// Remove the temporary directory. Nothing is removed when the map phase
    /// produced no runs.
    pub fn cleanup(&mut self) -> Result<()> {
        if self.phase != Phase::Reducing || !self.reduced {
            bail!("cleanup needs a completed reduce phase (loader is {:?})", self.phase);
        }
        self.phase = Phase::CleaningUp;
        let has_runs = self.runs.as_ref().map_or(false, |r| !r.is_empty());
        if let Some(dir) = self.tmp_dir.as_deref() {
            if !has_runs {
                debug!(tmp = %dir.display(), "no runs written; leaving temp dir");
            } else if self.state.opts.keep_intermediates {
                info!(tmp = %dir.display(), "Keeping intermediates");
            } else {
                fs::remove_dir_all(dir).with_context(|| format!("remove {}", dir.display()))?;
                debug!(tmp = %dir.display(), "temp dir removed");
            }
        }
        self.phase = Phase::Done;
        Ok(())
    }
}

fn feed_records(records: RecordStream, records_tx: Sender<String>, progress: &Progress, stop: &StopFlag) -> Result<u64> {
    let mut fed = 0u64;
    for record in records {
        if stop.is_raised() {
            debug!(fed, "a worker failed; no more records fed");
            break;
        }
        let record = record?;
        progress.record_read();
        records_tx.send(record).map_err(|_| anyhow!("mappers stopped accepting records after {}", fed))?;
        fed += 1;
    }
    Ok(fed)
}

fn run_mapper<T: RecordTransformer>(
    transformer: &T,
    records: Receiver<String>,
    postings: Sender<T::Posting>,
    progress: &Progress,
    stop: &StopFlag,
) -> Result<u64> {
    let guard = stop.arm();
    let mut out = Vec::new();
    let mut mapped = 0u64;
    for record in records.iter() {
        if stop.is_raised() {
            break;
        }
        transformer
            .transform(&record, &mut |p| out.push(p))
            .with_context(|| format!("transform {:?}", record.chars().take(200).collect::<String>()))?;
        progress.add_mapped(out.len() as u64);
        mapped += out.len() as u64;
        for p in out.drain(..) {
            postings.send(p).map_err(|_| anyhow!("spill writer stopped accepting postings"))?;
        }
    }
    guard.disarm();
    Ok(mapped)
}

/// Stream one run into its merge queue. A failure (or panic) is forwarded as
/// the queue's last item before it closes, so the merger never mistakes a
/// broken run for an exhausted one.
fn read_into<P: Posting>(reader: &dyn SpillReader<P>, run: &Path, tx: Sender<Result<P>>) -> Result<u64> {
    let res = panic::catch_unwind(AssertUnwindSafe(|| reader.read_run(run, &tx)))
        .unwrap_or_else(|_| Err(anyhow!("reader panicked on {}", run.display())));
    match res {
        Ok(sent) => Ok(sent),
        Err(e) => match tx.send(Err(e)) {
            Ok(()) => bail!("read of {} aborted", run.display()),
            // merger already gone; the error comes back here
            Err(SendError(item)) => item.map(|_| 0),
        },
    }
}

/// Fresh `bulkload_tmp_posting_<pid>_<nanos>` directory under `root`.
fn create_run_dir(root: &Path) -> Result<PathBuf> {
    ensure_dir(root)?;
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0);
    let base = format!("{}{}_{}", RUN_DIR_PREFIX, std::process::id(), nanos);
    for attempt in 0..100u32 {
        let name = if attempt == 0 { base.clone() } else { format!("{}_{}", base, attempt) };
        let dir = root.join(name);
        match fs::create_dir(&dir) {
            Ok(()) => return Ok(dir),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e).with_context(|| format!("create temp dir {}", dir.display())),
        }
    }
    bail!("could not create a temp dir under {}", root.display())
}
