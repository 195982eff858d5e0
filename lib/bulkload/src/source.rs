//! Line-oriented reading of the input dump, gzip or plain.

use anyhow::{bail, Context, Result};
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::Path;

pub const GZIP_SUFFIX: &str = ".gz";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub fn is_compressed(path: &Path) -> bool {
    path.to_string_lossy().ends_with(GZIP_SUFFIX)
}

/// Forward-only stream of records, one per input line with the line
/// terminator (`\n` or `\r\n`) removed.
pub struct RecordStream {
    lines: Lines<Box<dyn BufRead + Send>>,
    line_no: u64,
}

impl Iterator for RecordStream {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        let line = self.lines.next()?;
        self.line_no += 1;
        let line_no = self.line_no;
        Some(line.with_context(|| format!("read error at record {}", line_no)))
    }
}

pub fn open_records(path: impl AsRef<Path>) -> Result<RecordStream> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("Could not read RDF file {}", path.display()))?;
    let reader: Box<dyn BufRead + Send> = if is_compressed(path) {
        let mut raw = BufReader::new(file);
        // Validate the header up front so a bad archive fails before any worker starts.
        let head = raw.fill_buf().with_context(|| format!("read {}", path.display()))?;
        if head.len() < GZIP_MAGIC.len() || head[..2] != GZIP_MAGIC {
            bail!("Could not create gzip reader for {}: not in gzip format", path.display());
        }
        Box::new(BufReader::new(MultiGzDecoder::new(raw)))
    } else {
        Box::new(BufReader::new(file))
    };
    Ok(RecordStream { lines: reader.lines(), line_no: 0 })
}
