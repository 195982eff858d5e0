use crate::api::{Posting, SpillWriter};
use crate::constants::DEFAULT_SPILL_BYTES;
use crate::io::{ensure_dir, open_writer, write_frame, FRAME_HEADER_LEN};
use crate::sort::{is_sorted_by_key, sort_by_key, SpillEntry};
use crate::stats::Progress;
use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::debug;

/// Spill writer that buffers encoded postings up to a byte budget, sorts the
/// buffer by grouping key and writes it out as one run file.
///
/// Run format: a sequence of `[len u32 LE][bincode posting]` frames in key order.
#[derive(Clone, Debug)]
pub struct RunWriter {
    spill_bytes: usize,
}

impl Default for RunWriter {
    fn default() -> Self { Self::new(DEFAULT_SPILL_BYTES) }
}

impl RunWriter {
    pub fn new(spill_bytes: usize) -> Self { Self { spill_bytes: spill_bytes.max(1) } }

    pub fn run_path(dir: &Path, idx: usize) -> PathBuf { dir.join(format!("run_{:06}.bin", idx)) }

    fn flush(&self, dir: &Path, idx: usize, buffer: &mut Vec<SpillEntry>, progress: &Progress) -> Result<PathBuf> {
        let sort_start = Instant::now();
        sort_by_key(buffer);
        debug_assert!(is_sorted_by_key(buffer));
        let sort_ms = sort_start.elapsed().as_millis() as u64;

        let path = Self::run_path(dir, idx);
        let write_start = Instant::now();
        let mut w = open_writer(&path)?;
        let mut bytes_out = 0u64;
        for e in buffer.iter() {
            write_frame(&mut w, &e.bytes).with_context(|| format!("write run {}", path.display()))?;
            bytes_out += (FRAME_HEADER_LEN + e.bytes.len()) as u64;
        }
        w.flush().with_context(|| format!("flush run {}", path.display()))?;
        let write_ms = write_start.elapsed().as_millis() as u64;

        progress.add_spilled(buffer.len() as u64);
        progress.run_written();
        debug!(run = %path.display(), records = buffer.len(), bytes_out, sort_ms, write_ms, "run spilled");
        buffer.clear();
        Ok(path)
    }
}

impl<P: Posting> SpillWriter<P> for RunWriter {
    fn write_runs(&self, dir: &Path, postings: Receiver<P>, progress: &Progress) -> Result<Vec<PathBuf>> {
        ensure_dir(dir)?;
        let mut runs = Vec::new();
        let mut buffer: Vec<SpillEntry> = Vec::new();
        let mut buffered_bytes = 0usize;

        for posting in postings.iter() {
            let bytes = bincode::serialize(&posting).context("encode posting")?;
            let key = posting.group_key().to_vec();
            buffered_bytes += key.len() + bytes.len();
            buffer.push(SpillEntry { key, bytes });
            if buffered_bytes >= self.spill_bytes {
                runs.push(self.flush(dir, runs.len(), &mut buffer, progress)?);
                buffered_bytes = 0;
            }
        }
        if !buffer.is_empty() {
            runs.push(self.flush(dir, runs.len(), &mut buffer, progress)?);
        }
        Ok(runs)
    }
}
