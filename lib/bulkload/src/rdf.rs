//! N-Triples / N-Quads records to [`FlatPosting`]s.

use crate::api::RecordTransformer;
use crate::posting::{data_key, index_key, reverse_key, FlatPosting, PostingValue};
use crate::schema::{SchemaStore, ValueType};
use crate::uid::UidMap;
use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use std::str::Chars;
use std::sync::Arc;

const XSD_PREFIX: &str = "http://www.w3.org/2001/XMLSchema#";

// subject predicate object [label] .
const NQUAD_PATTERN: &str = r#"^(?P<subject><[^>]*>|_:\S+)\s+(?P<predicate><[^>]+>)\s+(?P<object><[^>]*>|_:\S+|"(?P<literal>(?:[^"\\]|\\.)*)"(?:@(?P<lang>[A-Za-z][A-Za-z0-9-]*)|\^\^<(?P<dtype>[^>]+)>)?)(?:\s+(?P<label><[^>]*>|_:\S+))?\s*\.$"#;

/// Maps one N-Triples or N-Quads line to postings:
///
/// * node object: a data posting `subject -> object`, plus a reverse posting
///   `object -> subject` when the predicate is declared `@reverse`;
/// * literal object: a data posting carrying the encoded value, plus one index
///   posting per token for each tokenizer declared on the predicate.
///
/// Blank lines and `#` comments produce nothing. Malformed lines and type
/// conflicts with the schema are errors. Graph labels are accepted and ignored.
pub struct RdfTransformer {
    uids: Arc<UidMap>,
    schema: Arc<SchemaStore>,
    quad: Regex,
}

impl RdfTransformer {
    pub fn new(uids: Arc<UidMap>, schema: Arc<SchemaStore>) -> Result<Self> {
        let quad = Regex::new(NQUAD_PATTERN).context("compile N-Quad pattern")?;
        Ok(Self { uids, schema, quad })
    }
}

impl RecordTransformer for RdfTransformer {
    type Posting = FlatPosting;

    fn transform<F>(&self, record: &str, emit: &mut F) -> Result<()>
    where
        F: FnMut(FlatPosting),
    {
        let line = record.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(());
        }
        let caps = self.quad.captures(line).ok_or_else(|| anyhow!("malformed N-Quad: {:?}", line))?;
        let predicate = node_name(&caps["predicate"]);

        let Some(literal) = caps.name("literal") else {
            let schema = self.schema.resolve(predicate, ValueType::Uid);
            if schema.value_type != ValueType::Uid {
                bail!("predicate {:?} is {} but the object is a node", predicate, schema.value_type);
            }
            let subject = self.uids.assign(node_name(&caps["subject"]));
            let object = self.uids.assign(node_name(&caps["object"]));
            emit(FlatPosting { key: data_key(predicate, subject)?, posting: PostingValue::Uid(object) });
            if schema.reverse {
                emit(FlatPosting { key: reverse_key(predicate, object)?, posting: PostingValue::Uid(subject) });
            }
            return Ok(());
        };

        let text = unescape(literal.as_str()).with_context(|| format!("bad literal in {:?}", line))?;
        let observed = caps.name("dtype").map_or(ValueType::Default, |d| datatype_type(d.as_str()));
        let schema = self.schema.resolve(predicate, observed);
        if schema.value_type == ValueType::Uid {
            bail!("predicate {:?} is uid but the object is a literal", predicate);
        }
        let bytes = schema.value_type.encode(&text).with_context(|| format!("value of {:?}", predicate))?;
        let subject = self.uids.assign(node_name(&caps["subject"]));
        let lang = caps.name("lang").map(|m| m.as_str().to_string());

        emit(FlatPosting {
            key: data_key(predicate, subject)?,
            posting: PostingValue::Value { value_type: schema.value_type, bytes, lang },
        });
        for tokenizer in &schema.tokenizers {
            for token in tokenizer.tokens(&text) {
                emit(FlatPosting { key: index_key(predicate, token.as_bytes())?, posting: PostingValue::Uid(subject) });
            }
        }
        Ok(())
    }
}

fn node_name(term: &str) -> &str {
    term.strip_prefix('<').and_then(|t| t.strip_suffix('>')).unwrap_or(term)
}

fn datatype_type(iri: &str) -> ValueType {
    let local = iri.strip_prefix(XSD_PREFIX).or_else(|| iri.strip_prefix("xs:")).unwrap_or(iri);
    match local {
        "string" => ValueType::String,
        "int" | "integer" | "long" | "short" | "byte" | "nonNegativeInteger" | "positiveInteger" => ValueType::Int,
        "float" | "double" | "decimal" => ValueType::Float,
        "boolean" => ValueType::Bool,
        "dateTime" | "date" => ValueType::DateTime,
        _ => ValueType::Default,
    }
}

fn unescape(raw: &str) -> Result<String> {
    if !raw.contains('\\') {
        return Ok(raw.to_string());
    }
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('b') => out.push('\u{8}'),
            Some('f') => out.push('\u{c}'),
            Some(c @ ('"' | '\'' | '\\')) => out.push(c),
            Some('u') => out.push(read_code_point(&mut chars, 4)?),
            Some('U') => out.push(read_code_point(&mut chars, 8)?),
            Some(other) => bail!("unknown escape \\{}", other),
            None => bail!("dangling escape at end of literal"),
        }
    }
    Ok(out)
}

fn read_code_point(chars: &mut Chars<'_>, digits: usize) -> Result<char> {
    let hex: String = chars.by_ref().take(digits).collect();
    if hex.len() != digits {
        bail!("short unicode escape {:?}", hex);
    }
    let value = u32::from_str_radix(&hex, 16).with_context(|| format!("bad unicode escape {:?}", hex))?;
    char::from_u32(value).ok_or_else(|| anyhow!("invalid code point U+{:X}", value))
}
