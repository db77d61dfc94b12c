//! Frontmatter codec for Markdown content files.
//!
//! The header grammar is a deliberately small YAML subset that existing
//! content files are written in:
//!
//! ```text
//! ---
//! title: Hello: world        # split on the first colon only
//! draft: false               # bare true/false become booleans
//! tags: [rust, "cms"]        # inline list, naive comma split
//! categories:                # block list
//!   - Notes
//!   - Travel
//! ---
//! Body text
//! ```
//!
//! Nested mappings are not supported. A key with exactly one block-list item
//! reads back as a scalar string, so a one-element list and a scalar are
//! indistinguishable once written.
//!
//! [`serialize`] never quotes or escapes. Values containing a newline or a
//! leading `---` must be rejected by the caller (see [`check_value`]).

use regex::Regex;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::OnceLock;

/// A single header value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    List(Vec<String>),
    Str(String),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Flattens scalars and lists into a list of strings.
    pub fn strings(&self) -> Vec<&str> {
        match self {
            FieldValue::Str(s) => vec![s.as_str()],
            FieldValue::List(items) => items.iter().map(String::as_str).collect(),
            FieldValue::Bool(_) => Vec::new(),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Str(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Str(s)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(items: Vec<String>) -> Self {
        FieldValue::List(items)
    }
}

/// Insertion-ordered header mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frontmatter {
    fields: Vec<(String, FieldValue)>,
}

impl Frontmatter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(FieldValue::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Replaces an existing value in place, or appends a new field.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        let key = key.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<FieldValue> {
        let pos = self.fields.iter().position(|(k, _)| k == key)?;
        Some(self.fields.remove(pos).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>, V: Into<FieldValue>> FromIterator<(K, V)> for Frontmatter {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut fm = Frontmatter::new();
        for (k, v) in iter {
            fm.insert(k, v);
        }
        fm
    }
}

impl Serialize for Frontmatter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

// Hand-written so that JSON object order survives deserialization.
impl<'de> Deserialize<'de> for Frontmatter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FrontmatterVisitor;

        impl<'de> Visitor<'de> for FrontmatterVisitor {
            type Value = Frontmatter;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of strings, booleans or string lists")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Frontmatter, A::Error> {
                let mut fm = Frontmatter::new();
                while let Some((key, value)) = access.next_entry::<String, FieldValue>()? {
                    fm.insert(key, value);
                }
                Ok(fm)
            }
        }

        deserializer.deserialize_map(FrontmatterVisitor)
    }
}

fn key_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-Za-z0-9_][A-Za-z0-9_-]*):(.*)$").expect("static regex"))
}

/// Split a file into its header block and everything after the closing `---`.
fn split_block(text: &str) -> Option<(&str, &str)> {
    let rest = text
        .strip_prefix("---\n")
        .or_else(|| text.strip_prefix("---\r\n"))?;
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end_matches(['\r', '\n']) == "---" {
            return Some((&rest[..offset], &rest[offset + line.len()..]));
        }
        offset += line.len();
    }
    None
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

fn parse_inline(value: &str) -> FieldValue {
    if let Some(inner) = value.strip_prefix('[').and_then(|v| v.strip_suffix(']')) {
        let items = inner
            .split(',')
            .map(|item| unquote(item.trim()).to_string())
            .filter(|item| !item.is_empty())
            .collect();
        return FieldValue::List(items);
    }
    match value {
        "true" => FieldValue::Bool(true),
        "false" => FieldValue::Bool(false),
        other => FieldValue::Str(unquote(other).to_string()),
    }
}

fn flush(fm: &mut Frontmatter, pending: Option<(String, Vec<String>)>) {
    if let Some((key, mut items)) = pending {
        let value = match items.len() {
            0 => FieldValue::Str(String::new()),
            1 => FieldValue::Str(items.remove(0)),
            _ => FieldValue::List(items),
        };
        fm.insert(key, value);
    }
}

/// Parse a file into `(frontmatter, body)`. Input without a header block is
/// returned untouched as the body.
pub fn parse(text: &str) -> (Frontmatter, String) {
    let Some((block, body)) = split_block(text) else {
        return (Frontmatter::new(), text.to_string());
    };

    let mut fm = Frontmatter::new();
    let mut pending: Option<(String, Vec<String>)> = None;

    for raw in block.lines() {
        let line = raw.trim_end();
        if line.trim().is_empty() {
            continue;
        }
        if let Some(caps) = key_line().captures(line) {
            flush(&mut fm, pending.take());
            let key = caps[1].to_string();
            let value = caps[2].trim();
            if value.is_empty() {
                pending = Some((key, Vec::new()));
            } else {
                fm.insert(key, parse_inline(value));
            }
            continue;
        }
        if let Some(item) = line.trim_start().strip_prefix('-') {
            if let Some((_, items)) = pending.as_mut() {
                items.push(unquote(item.trim()).to_string());
            }
        }
        // Anything else (comments, nested mappings) is outside the grammar.
    }
    flush(&mut fm, pending);

    (fm, body.trim().to_string())
}

/// Render the header block, `---` delimited, in field order.
pub fn serialize(fm: &Frontmatter) -> String {
    let mut out = String::from("---\n");
    for (key, value) in fm.iter() {
        match value {
            FieldValue::Str(s) => out.push_str(&format!("{}: {}\n", key, s)),
            FieldValue::Bool(b) => out.push_str(&format!("{}: {}\n", key, b)),
            FieldValue::List(items) if items.is_empty() => {
                out.push_str(&format!("{}: []\n", key))
            }
            FieldValue::List(items) => {
                out.push_str(&format!("{}:\n", key));
                for item in items {
                    out.push_str(&format!("  - {}\n", item));
                }
            }
        }
    }
    out.push_str("---\n");
    out
}

/// Render a full file: header, blank line, body.
pub fn compose(fm: &Frontmatter, body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        serialize(fm)
    } else {
        format!("{}\n{}\n", serialize(fm), body)
    }
}

/// Reject values [`serialize`] cannot write back faithfully.
pub fn check_value(key: &str, value: &FieldValue) -> Result<(), String> {
    for s in value.strings() {
        if s.contains('\n') || s.contains('\r') {
            return Err(format!("field '{}' must not contain a line break", key));
        }
        if s.trim_start().starts_with("---") {
            return Err(format!("field '{}' must not start with '---'", key));
        }
    }
    Ok(())
}
