use crate::constants::WRITE_BUFFER_BYTES;
use anyhow::{bail, Context, Result};
use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File};
use std::hash::Hasher;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Bytes of the little-endian length prefix in front of every run record.
pub const FRAME_HEADER_LEN: usize = 4;

pub fn ensure_dir(path: impl AsRef<Path>) -> Result<()> {
    fs::create_dir_all(path.as_ref()).with_context(|| format!("create_dir_all {}", path.as_ref().display()))
}

pub fn open_writer(path: impl AsRef<Path>) -> Result<BufWriter<File>> {
    if let Some(parent) = path.as_ref().parent() {
        ensure_dir(parent)?;
    }
    let file = File::create(path.as_ref()).with_context(|| format!("create {}", path.as_ref().display()))?;
    Ok(BufWriter::with_capacity(WRITE_BUFFER_BYTES, file))
}

pub fn hash_to_shard(bytes: &[u8], num_shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    hasher.write(bytes);
    (hasher.finish() as usize) % num_shards
}

/// Append one record as `[len u32 LE][payload]`.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len()).context("run record larger than 4 GiB")?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(payload)?;
    Ok(())
}

/// Decode the frame starting at `off`. Returns the payload and the offset of the
/// next frame, `None` at a clean end of buffer, and an error on a torn frame.
pub fn read_frame(bytes: &[u8], off: usize) -> Result<Option<(&[u8], usize)>> {
    if off == bytes.len() {
        return Ok(None);
    }
    if off + FRAME_HEADER_LEN > bytes.len() {
        bail!("truncated frame header at offset {}", off);
    }
    let mut len = [0u8; FRAME_HEADER_LEN];
    len.copy_from_slice(&bytes[off..off + FRAME_HEADER_LEN]);
    let start = off + FRAME_HEADER_LEN;
    let end = start + u32::from_le_bytes(len) as usize;
    if end > bytes.len() {
        bail!("truncated frame at offset {}: needs {} bytes, {} left", off, end - start, bytes.len() - start);
    }
    Ok(Some((&bytes[start..end], end)))
}
