//! Posting candidates produced by [`crate::rdf::RdfTransformer`] and their keys.
//!
//! Key layout: `[kind u8][predicate len u16 BE][predicate][suffix]`. The suffix
//! is a big-endian uid for data and reverse keys and raw token bytes for index
//! keys, so byte order groups keys by kind, then predicate, then subject.

use crate::api::Posting;
use crate::schema::ValueType;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    Data = 0,
    Reverse = 1,
    Index = 2,
}

impl KeyKind {
    fn from_byte(b: u8) -> Result<Self> {
        Ok(match b {
            0 => KeyKind::Data,
            1 => KeyKind::Reverse,
            2 => KeyKind::Index,
            other => bail!("unknown key kind {}", other),
        })
    }
}

fn key_prefix(kind: KeyKind, predicate: &str, suffix_len: usize) -> Result<Vec<u8>> {
    let pred_len = u16::try_from(predicate.len()).with_context(|| format!("predicate too long ({} bytes)", predicate.len()))?;
    let mut key = Vec::with_capacity(3 + predicate.len() + suffix_len);
    key.push(kind as u8);
    key.extend_from_slice(&pred_len.to_be_bytes());
    key.extend_from_slice(predicate.as_bytes());
    Ok(key)
}

/// Forward edge or value list of `subject` under `predicate`.
pub fn data_key(predicate: &str, subject: u64) -> Result<Vec<u8>> {
    let mut key = key_prefix(KeyKind::Data, predicate, 8)?;
    key.extend_from_slice(&subject.to_be_bytes());
    Ok(key)
}

/// Incoming edges of `object` under `predicate`.
pub fn reverse_key(predicate: &str, object: u64) -> Result<Vec<u8>> {
    let mut key = key_prefix(KeyKind::Reverse, predicate, 8)?;
    key.extend_from_slice(&object.to_be_bytes());
    Ok(key)
}

pub fn index_key(predicate: &str, token: &[u8]) -> Result<Vec<u8>> {
    let mut key = key_prefix(KeyKind::Index, predicate, token.len())?;
    key.extend_from_slice(token);
    Ok(key)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedKey {
    pub kind: KeyKind,
    pub predicate: String,
    /// Subject (data) or object (reverse) uid.
    pub uid: Option<u64>,
    pub token: Option<Vec<u8>>,
}

pub fn parse_key(key: &[u8]) -> Result<ParsedKey> {
    if key.len() < 3 {
        bail!("key too short ({} bytes)", key.len());
    }
    let kind = KeyKind::from_byte(key[0])?;
    let pred_len = u16::from_be_bytes([key[1], key[2]]) as usize;
    let pred_end = 3 + pred_len;
    if key.len() < pred_end {
        bail!("key truncated inside predicate");
    }
    let predicate = std::str::from_utf8(&key[3..pred_end]).context("predicate is not utf-8")?.to_string();
    let suffix = &key[pred_end..];
    let (uid, token) = match kind {
        KeyKind::Data | KeyKind::Reverse => {
            let raw: [u8; 8] = suffix.try_into().with_context(|| format!("expected 8-byte uid suffix, got {} bytes", suffix.len()))?;
            (Some(u64::from_be_bytes(raw)), None)
        }
        KeyKind::Index => (None, Some(suffix.to_vec())),
    };
    Ok(ParsedKey { kind, predicate, uid, token })
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PostingValue {
    Uid(u64),
    Value {
        value_type: ValueType,
        bytes: Vec<u8>,
        lang: Option<String>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatPosting {
    pub key: Vec<u8>,
    pub posting: PostingValue,
}

impl Posting for FlatPosting {
    fn group_key(&self) -> &[u8] { &self.key }
}
