use crate::constants::*;
use crate::utils::{env_or, env_var_truthy};
use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Capacities of the bounded queues between pipeline stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueCapacities {
    /// Source feeder to mappers.
    pub records: usize,
    /// Mappers to spill writer.
    pub postings: usize,
    /// Each run reader to the merger.
    pub runs: usize,
    /// Merger to reducers.
    pub batches: usize,
}

impl Default for QueueCapacities {
    fn default() -> Self {
        Self {
            records: DEFAULT_RECORD_QUEUE_CAP,
            postings: DEFAULT_POSTING_QUEUE_CAP,
            runs: DEFAULT_RUN_QUEUE_CAP,
            batches: DEFAULT_BATCH_QUEUE_CAP,
        }
    }
}

impl QueueCapacities {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            records: env_or(ENV_RECORD_QUEUE_CAP, d.records),
            postings: env_or(ENV_POSTING_QUEUE_CAP, d.postings),
            runs: env_or(ENV_RUN_QUEUE_CAP, d.runs),
            batches: env_or(ENV_BATCH_QUEUE_CAP, d.batches),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LoaderOptions {
    pub rdf_file: PathBuf,
    pub schema_file: PathBuf,
    /// Where the aggregator persists its output.
    pub out_dir: PathBuf,
    /// Parent of the per-load temporary directory.
    pub tmp_dir: PathBuf,
    /// Mapper pool size and reducer concurrency.
    pub num_workers: usize,
    pub queues: QueueCapacities,
    pub spill_bytes: usize,
    pub progress_interval: Duration,
    pub keep_intermediates: bool,
}

impl LoaderOptions {
    /// Options with tuning taken from the `BULKLOAD_*` environment overrides.
    pub fn new(
        rdf_file: impl Into<PathBuf>,
        schema_file: impl Into<PathBuf>,
        out_dir: impl Into<PathBuf>,
        tmp_dir: impl Into<PathBuf>,
        num_workers: usize,
    ) -> Self {
        Self {
            rdf_file: rdf_file.into(),
            schema_file: schema_file.into(),
            out_dir: out_dir.into(),
            tmp_dir: tmp_dir.into(),
            num_workers,
            queues: QueueCapacities::from_env(),
            spill_bytes: env_or(ENV_SPILL_BYTES, DEFAULT_SPILL_BYTES),
            progress_interval: Duration::from_millis(env_or(ENV_PROGRESS_INTERVAL_MS, DEFAULT_PROGRESS_INTERVAL_MS)),
            keep_intermediates: env_var_truthy(ENV_KEEP_INTERMEDIATES),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            bail!("num_workers must be positive");
        }
        let q = &self.queues;
        for (name, cap) in [("record", q.records), ("posting", q.postings), ("run", q.runs), ("batch", q.batches)] {
            if cap == 0 {
                bail!("{} queue capacity must be positive", name);
            }
        }
        if self.spill_bytes == 0 {
            bail!("spill buffer budget must be positive");
        }
        if self.progress_interval.is_zero() {
            bail!("progress interval must be positive");
        }
        Ok(())
    }
}
