// src/packages/stanza.rs

//! Debian control-file stanzas (RFC 822-like `Field: value` paragraphs)
//!
//! Used for `.deb` control files, `Packages` indexes and `Release` files.
//! Reading goes through `rfc822_like`; writing is done here since indexes
//! need the field order kept. Multi-line values store their continuation
//! lines with the leading space.

use crate::error::{Error, Result};
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Stanza {
    fields: Vec<(String, String)>,
}

impl Stanza {
    pub fn new() -> Self {
        Self::default()
    }

    /// Field names are case-insensitive
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Replace the value of an existing field or append a new one
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .fields
            .iter_mut()
            .find(|(field, _)| field.eq_ignore_ascii_case(name))
        {
            Some((_, existing)) => *existing = value,
            None => self.fields.push((name.to_string(), value)),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let position = self
            .fields
            .iter()
            .position(|(field, _)| field.eq_ignore_ascii_case(name))?;
        Some(self.fields.remove(position).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl fmt::Display for Stanza {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (field, value) in &self.fields {
            if value.starts_with('\n') {
                writeln!(f, "{}:{}", field, value)?;
            } else {
                writeln!(f, "{}: {}", field, value)?;
            }
        }
        Ok(())
    }
}

/// Parse a single paragraph
pub fn parse_stanza(content: &str) -> Result<Stanza> {
    let mut stanzas = parse_stanzas(content)?;
    match stanzas.len() {
        0 => Err(Error::ParseError("empty control stanza".to_string())),
        1 => Ok(stanzas.remove(0)),
        n => Err(Error::ParseError(format!(
            "expected a single stanza, found {}",
            n
        ))),
    }
}

/// Parse blank-line separated paragraphs
pub fn parse_stanzas(content: &str) -> Result<Vec<Stanza>> {
    let paragraphs: Vec<Paragraph> = rfc822_like::from_str(content)
        .map_err(|e| Error::ParseError(format!("Failed to parse control data: {}", e)))?;

    Ok(paragraphs
        .into_iter()
        .map(|paragraph| paragraph.0)
        .filter(|stanza| !stanza.is_empty())
        .collect())
}

/// One paragraph as read by `rfc822_like`, fields kept in file order
struct Paragraph(Stanza);

impl<'de> Deserialize<'de> for Paragraph {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(ParagraphVisitor)
    }
}

struct ParagraphVisitor;

impl<'de> Visitor<'de> for ParagraphVisitor {
    type Value = Paragraph;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a control paragraph")
    }

    fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut stanza = Stanza::new();
        while let Some((field, value)) = map.next_entry::<String, String>()? {
            stanza
                .fields
                .push((field.trim().to_string(), continuation_lines(&value)));
        }
        Ok(Paragraph(stanza))
    }
}

/// Continuation lines are written back with their leading space
fn continuation_lines(value: &str) -> String {
    let mut lines = value.trim_end().split('\n');
    let mut out = lines.next().unwrap_or_default().trim().to_string();
    for line in lines {
        out.push('\n');
        if !line.starts_with(' ') && !line.starts_with('\t') {
            out.push(' ');
        }
        out.push_str(line.trim_end());
    }
    out
}
