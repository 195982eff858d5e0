//! Reducer side: turns each grouped batch into one posting-list line.

use crate::api::Aggregator;
use crate::constants::{POSTINGS_FILE, SCHEMA_FILE};
use crate::io::{ensure_dir, open_writer};
use crate::posting::{parse_key, FlatPosting, KeyKind, PostingValue};
use crate::schema::{SchemaStore, ValueType};
use crate::stats::Progress;
use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

#[derive(Serialize)]
struct PostingListLine<'a> {
    kind: KeyKind,
    predicate: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    uid: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,
    uids: Vec<u64>,
    values: Vec<ValueOut>,
    #[serde(skip_serializing_if = "Option::is_none")]
    count: Option<usize>,
}

#[derive(Serialize)]
struct ValueOut {
    #[serde(rename = "type")]
    value_type: ValueType,
    value: JsonValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    lang: Option<String>,
}

/// Writes `postings.jsonl` (one line per batch, uids sorted and deduplicated)
/// and, on [`Aggregator::finish`], the final `schema.txt`.
///
/// A key delivered in two batches produces two lines.
pub struct PostingListWriter {
    out_dir: PathBuf,
    schema: Arc<SchemaStore>,
    progress: Arc<Progress>,
    out: Mutex<BufWriter<File>>,
}

impl PostingListWriter {
    pub fn create(out_dir: impl AsRef<Path>, schema: Arc<SchemaStore>, progress: Arc<Progress>) -> Result<Self> {
        let out_dir = out_dir.as_ref().to_path_buf();
        ensure_dir(&out_dir)?;
        let out = open_writer(out_dir.join(POSTINGS_FILE))?;
        Ok(Self { out_dir, schema, progress, out: Mutex::new(out) })
    }

    pub fn postings_path(&self) -> PathBuf { self.out_dir.join(POSTINGS_FILE) }

    pub fn schema_path(&self) -> PathBuf { self.out_dir.join(SCHEMA_FILE) }

    fn render_line(&self, batch: Vec<FlatPosting>) -> Result<Option<String>> {
        let Some(first) = batch.first() else { return Ok(None) };
        let key = parse_key(&first.key)?;
        if let Some(other) = batch.iter().find(|p| p.key != first.key) {
            bail!("batch mixes keys {:?} and {:?}", first.key, other.key);
        }

        let mut uids = Vec::new();
        let mut values = Vec::new();
        for p in batch {
            match p.posting {
                PostingValue::Uid(uid) => uids.push(uid),
                PostingValue::Value { value_type, bytes, lang } => values.push((value_type, bytes, lang)),
            }
        }
        uids.sort_unstable();
        uids.dedup();
        values.sort_by(|a, b| (a.0.name(), &a.1, &a.2).cmp(&(b.0.name(), &b.1, &b.2)));
        values.dedup();

        let count = self.schema.get(&key.predicate).filter(|s| s.count).map(|_| uids.len() + values.len());
        let values = values
            .into_iter()
            .map(|(value_type, bytes, lang)| -> Result<ValueOut> {
                Ok(ValueOut { value_type, value: decode_value(value_type, &bytes)?, lang })
            })
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("decode values of {:?}", key.predicate))?;

        let line = PostingListLine {
            kind: key.kind,
            predicate: &key.predicate,
            uid: key.uid,
            token: key.token.as_deref().map(|t| String::from_utf8_lossy(t).into_owned()),
            uids,
            values,
            count,
        };
        Ok(Some(serde_json::to_string(&line)?))
    }
}

impl Aggregator for PostingListWriter {
    type Posting = FlatPosting;

    fn aggregate(&self, batch: Vec<FlatPosting>) -> Result<()> {
        let Some(line) = self.render_line(batch)? else { return Ok(()) };
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(out, "{}", line).with_context(|| format!("write {}", self.postings_path().display()))?;
        self.progress.key_written();
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        self.out
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
            .with_context(|| format!("flush {}", self.postings_path().display()))?;
        let schema_path = self.schema_path();
        std::fs::write(&schema_path, self.schema.render()).with_context(|| format!("write {}", schema_path.display()))?;
        info!(out = %self.out_dir.display(), predicates = self.schema.len(), "Posting lists written");
        Ok(())
    }
}

fn decode_value(value_type: ValueType, bytes: &[u8]) -> Result<JsonValue> {
    Ok(match value_type {
        ValueType::Int => {
            let raw: [u8; 8] = bytes.try_into().context("int value is not 8 bytes")?;
            JsonValue::from(i64::from_le_bytes(raw))
        }
        ValueType::Float => {
            let raw: [u8; 8] = bytes.try_into().context("float value is not 8 bytes")?;
            let f = f64::from_le_bytes(raw);
            // JSON has no NaN or infinities
            serde_json::Number::from_f64(f).map_or_else(|| JsonValue::String(f.to_string()), JsonValue::Number)
        }
        ValueType::Bool => match bytes {
            [b] => JsonValue::Bool(*b != 0),
            _ => bail!("bool value is not 1 byte"),
        },
        ValueType::Uid => bail!("uid stored as a value"),
        ValueType::Default | ValueType::String | ValueType::DateTime => JsonValue::String(String::from_utf8_lossy(bytes).into_owned()),
    })
}
