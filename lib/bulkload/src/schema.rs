//! Predicate schema: parsed once from the schema file, extended at load time
//! with types inferred for predicates the file does not mention.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Default,
    String,
    Int,
    Float,
    Bool,
    DateTime,
    Uid,
}

impl ValueType {
    pub fn name(self) -> &'static str {
        match self {
            ValueType::Default => "default",
            ValueType::String => "string",
            ValueType::Int => "int",
            ValueType::Float => "float",
            ValueType::Bool => "bool",
            ValueType::DateTime => "datetime",
            ValueType::Uid => "uid",
        }
    }

    /// Encode literal text as this type's storage bytes.
    pub fn encode(self, text: &str) -> Result<Vec<u8>> {
        let bytes = match self {
            ValueType::Int => text.trim().parse::<i64>().with_context(|| format!("{:?} is not an int", text))?.to_le_bytes().to_vec(),
            ValueType::Float => text.trim().parse::<f64>().with_context(|| format!("{:?} is not a float", text))?.to_le_bytes().to_vec(),
            ValueType::Bool => match text.trim() {
                "true" | "1" => vec![1],
                "false" | "0" => vec![0],
                other => bail!("{:?} is not a bool", other),
            },
            ValueType::Uid => bail!("literal {:?} cannot be stored as a uid", text),
            ValueType::Default | ValueType::String | ValueType::DateTime => text.as_bytes().to_vec(),
        };
        Ok(bytes)
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.name()) }
}

impl FromStr for ValueType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "default" => ValueType::Default,
            "string" => ValueType::String,
            "int" => ValueType::Int,
            "float" => ValueType::Float,
            "bool" => ValueType::Bool,
            "datetime" => ValueType::DateTime,
            "uid" => ValueType::Uid,
            other => bail!("unknown type {:?}", other),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tokenizer {
    /// The whole value is the token.
    Exact,
    /// Lowercased alphanumeric words.
    Term,
}

impl Tokenizer {
    pub fn name(self) -> &'static str {
        match self {
            Tokenizer::Exact => "exact",
            Tokenizer::Term => "term",
        }
    }

    pub fn tokens(self, text: &str) -> Vec<String> {
        match self {
            Tokenizer::Exact => vec![text.to_string()],
            Tokenizer::Term => {
                let mut words: Vec<String> = text
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|w| !w.is_empty())
                    .map(|w| w.to_lowercase())
                    .collect();
                words.sort();
                words.dedup();
                words
            }
        }
    }
}

impl FromStr for Tokenizer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "exact" => Ok(Tokenizer::Exact),
            "term" => Ok(Tokenizer::Term),
            other => bail!("unknown tokenizer {:?}", other),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PredicateSchema {
    pub value_type: ValueType,
    pub tokenizers: Vec<Tokenizer>,
    pub reverse: bool,
    pub count: bool,
    /// True when the entry was inferred from data rather than declared.
    pub inferred: bool,
}

impl PredicateSchema {
    pub fn inferred(value_type: ValueType) -> Self {
        Self { value_type, tokenizers: Vec::new(), reverse: false, count: false, inferred: true }
    }
}

#[derive(Debug, Default)]
pub struct SchemaStore {
    entries: RwLock<HashMap<String, PredicateSchema>>,
}

impl SchemaStore {
    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = HashMap::new();
        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let parsed = parse_line(raw).with_context(|| format!("schema line {}: {:?}", line_no, raw.trim()))?;
            if let Some((name, schema)) = parsed {
                if entries.insert(name.clone(), schema).is_some() {
                    bail!("schema line {}: predicate {:?} declared twice", line_no, name);
                }
            }
        }
        Ok(Self { entries: RwLock::new(entries) })
    }

    pub fn get(&self, predicate: &str) -> Option<PredicateSchema> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).get(predicate).cloned()
    }

    /// Schema for `predicate`, registering `observed` as its type on first sight.
    pub fn resolve(&self, predicate: &str, observed: ValueType) -> PredicateSchema {
        if let Some(found) = self.get(predicate) {
            return found;
        }
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries
            .entry(predicate.to_string())
            .or_insert_with(|| PredicateSchema::inferred(observed))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Render every entry in the schema file grammar, sorted by predicate.
    pub fn render(&self) -> String {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<&String> = entries.keys().collect();
        names.sort();
        let mut out = String::new();
        for name in names {
            let s = &entries[name];
            if name.contains(':') {
                out.push_str(&format!("<{}>: ", name));
            } else {
                out.push_str(name);
                out.push_str(": ");
            }
            out.push_str(s.value_type.name());
            if !s.tokenizers.is_empty() {
                let toks: Vec<&str> = s.tokenizers.iter().map(|t| t.name()).collect();
                out.push_str(&format!(" @index({})", toks.join(", ")));
            }
            if s.reverse { out.push_str(" @reverse"); }
            if s.count { out.push_str(" @count"); }
            out.push_str(" .\n");
        }
        out
    }
}

fn parse_line(raw: &str) -> Result<Option<(String, PredicateSchema)>> {
    let line = raw.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let body = line.strip_suffix('.').ok_or_else(|| anyhow!("missing terminating '.'"))?.trim_end();
    let (name, rest) = match body.strip_prefix('<') {
        Some(iri) => {
            let (name, after) = iri.split_once('>').ok_or_else(|| anyhow!("unclosed '<' in predicate"))?;
            let rest = after.trim_start().strip_prefix(':').ok_or_else(|| anyhow!("expected ':' after predicate"))?;
            (name, rest)
        }
        None => body.split_once(':').ok_or_else(|| anyhow!("expected '<predicate>: <type>'"))?,
    };
    let name = name.trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        bail!("invalid predicate name {:?}", name);
    }

    let rest = rest.trim_start();
    let type_end = rest.find(|c: char| c.is_whitespace() || c == '@').unwrap_or(rest.len());
    let value_type: ValueType = rest[..type_end].parse()?;
    let mut schema = PredicateSchema { value_type, tokenizers: Vec::new(), reverse: false, count: false, inferred: false };

    let mut directives = rest[type_end..].trim_start();
    while !directives.is_empty() {
        if let Some(after) = directives.strip_prefix("@index(") {
            let close = after.find(')').ok_or_else(|| anyhow!("unclosed @index("))?;
            for tok in after[..close].split(',').map(str::trim).filter(|t| !t.is_empty()) {
                schema.tokenizers.push(tok.parse()?);
            }
            if schema.tokenizers.is_empty() {
                bail!("@index needs at least one tokenizer");
            }
            directives = after[close + 1..].trim_start();
        } else if let Some(after) = directives.strip_prefix("@reverse") {
            schema.reverse = true;
            directives = after.trim_start();
        } else if let Some(after) = directives.strip_prefix("@count") {
            schema.count = true;
            directives = after.trim_start();
        } else {
            bail!("unexpected directive {:?}", directives);
        }
    }

    if schema.reverse && value_type != ValueType::Uid {
        bail!("@reverse is only allowed on uid predicates");
    }
    if !schema.tokenizers.is_empty() && value_type == ValueType::Uid {
        bail!("@index is not allowed on uid predicates");
    }
    Ok(Some((name.to_string(), schema)))
}
