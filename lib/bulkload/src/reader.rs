use crate::api::{Posting, SpillReader};
use crate::io::read_frame;
use anyhow::{anyhow, Context, Result};
use crossbeam_channel::Sender;
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;

/// Streams a run written by [`crate::writer::RunWriter`] back in file order.
#[derive(Clone, Copy, Debug, Default)]
pub struct RunReader;

impl<P: Posting> SpillReader<P> for RunReader {
    fn read_run(&self, run: &Path, postings: &Sender<Result<P>>) -> Result<u64> {
        let file = File::open(run).with_context(|| format!("open run {}", run.display()))?;
        if file.metadata().with_context(|| format!("stat run {}", run.display()))?.len() == 0 {
            return Ok(0);
        }
        // Runs are private to this load and are not modified after the map phase.
        let map = unsafe { Mmap::map(&file) }.with_context(|| format!("mmap {}", run.display()))?;
        let bytes = &map[..];

        let mut off = 0usize;
        let mut sent = 0u64;
        while let Some((frame, next)) = read_frame(bytes, off).with_context(|| format!("corrupt run {}", run.display()))? {
            let posting: P = bincode::deserialize(frame).with_context(|| format!("decode posting in {} at offset {}", run.display(), off))?;
            postings.send(Ok(posting)).map_err(|_| anyhow!("shuffle stopped reading {}", run.display()))?;
            sent += 1;
            off = next;
        }
        Ok(sent)
    }
}
