//! Filename recovery for hashed XP3 indexes
//!
//! Some titles store entry names as the MD5 of the real lowercase path, or
//! store nothing useful and rely on side records mapping the entry hash to
//! a name. [`FilenameTable`] collects both kinds of mapping. When no side
//! records exist, names can be recovered by enumerating a title's naming
//! convention with a [`CandidateGrammar`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use tracing::debug;

use crate::error::{ArchiveError, ArchiveResult};

/// MD5 key of a name as stored by hashed indexes.
///
/// The name is lowercased and encoded as UTF-16LE before hashing.
pub fn name_md5(name: &str) -> String {
    let bytes: Vec<u8> = name
        .to_lowercase()
        .encode_utf16()
        .flat_map(u16::to_le_bytes)
        .collect();
    hex::encode(md5::compute(&bytes).0)
}

/// Hash and MD5 lookups for real entry names
#[derive(Debug, Clone, Default)]
pub struct FilenameTable {
    by_hash: HashMap<u32, String>,
    by_md5: HashMap<String, String>,
}

impl FilenameTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `name` under `hash` and under its MD5 key.
    ///
    /// The first name seen for a hash is kept.
    pub fn add(&mut self, hash: u32, name: impl Into<String>) {
        let name = name.into();
        self.by_hash.entry(hash).or_insert_with(|| name.clone());
        self.by_md5.insert(name_md5(&name), name);
    }

    /// Record `name` under an explicit lookup key.
    pub fn add_shortcut(&mut self, key: impl Into<String>, name: impl Into<String>) {
        self.by_md5.insert(key.into(), name.into());
    }

    /// Register every name a grammar produces under its MD5 key.
    ///
    /// Returns the number of names added.
    pub fn add_candidates(&mut self, grammar: &CandidateGrammar) -> usize {
        let mut added = 0;
        for name in grammar.names() {
            self.by_md5.insert(name_md5(&name), name);
            added += 1;
        }
        debug!("Added {added} candidate names from {grammar}");
        added
    }

    /// Number of distinct lookup keys
    pub fn len(&self) -> usize {
        self.by_md5.len().max(self.by_hash.len())
    }

    /// Whether the table holds no names
    pub fn is_empty(&self) -> bool {
        self.by_md5.is_empty() && self.by_hash.is_empty()
    }

    /// Real name for an entry, if known.
    ///
    /// `stored` is tried as an MD5 key first, then `hash`.
    pub fn resolve(&self, hash: u32, stored: &str) -> Option<&str> {
        self.by_md5
            .get(stored)
            .or_else(|| self.by_hash.get(&hash))
            .map(String::as_str)
    }
}

/// One piece of a name template
#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Choice(Vec<String>),
    Range {
        start: u32,
        end: u32,
        width: usize,
        radix: Radix,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Radix {
    Decimal,
    HexLower,
    HexUpper,
}

impl Part {
    fn len(&self) -> usize {
        match self {
            Self::Literal(_) => 1,
            Self::Choice(options) => options.len(),
            Self::Range { start, end, .. } => (end - start) as usize + 1,
        }
    }

    fn push_to(&self, index: usize, out: &mut String) {
        match self {
            Self::Literal(text) => out.push_str(text),
            Self::Choice(options) => out.push_str(&options[index]),
            Self::Range {
                start,
                width,
                radix,
                ..
            } => {
                let value = *start as usize + index;
                out.push_str(&match radix {
                    Radix::Decimal => format!("{value:0width$}"),
                    Radix::HexLower => format!("{value:0width$x}"),
                    Radix::HexUpper => format!("{value:0width$X}"),
                });
            }
        }
    }
}

/// A naming convention that enumerates candidate entry names.
///
/// Templates mix literal text with braced groups:
///
/// - `{000..199}` decimal range, zero-padded to the width of the start
/// - `{x00..xFF}` hexadecimal range; letter case follows the bounds
/// - `{a|b|}` alternatives, possibly empty
///
/// ```
/// use resarc_formats::xp3::CandidateGrammar;
///
/// let grammar: CandidateGrammar = "ev/EV_{00..02}{|b}.tlg".parse().unwrap();
/// let names: Vec<String> = grammar.names().collect();
/// assert_eq!(names.len(), 6);
/// assert_eq!(names[0], "ev/EV_00.tlg");
/// assert_eq!(names[1], "ev/EV_00b.tlg");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateGrammar {
    template: String,
    parts: Vec<Part>,
}

impl CandidateGrammar {
    /// Parse a template.
    pub fn parse(template: &str) -> ArchiveResult<Self> {
        let invalid = |reason: &str| ArchiveError::InvalidTemplate {
            template: template.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = Vec::new();
        let mut rest = template;
        while !rest.is_empty() {
            match rest.find(['{', '}']) {
                Some(pos) if rest.as_bytes()[pos] == b'}' => {
                    return Err(invalid("unmatched '}'"));
                }
                Some(pos) => {
                    if pos > 0 {
                        parts.push(Part::Literal(rest[..pos].to_string()));
                    }
                    let close = rest[pos..]
                        .find('}')
                        .ok_or_else(|| invalid("unterminated group"))?;
                    let group = &rest[pos + 1..pos + close];
                    if group.contains('{') {
                        return Err(invalid("nested group"));
                    }
                    parts.push(parse_group(group).map_err(invalid)?);
                    rest = &rest[pos + close + 1..];
                }
                None => {
                    parts.push(Part::Literal(rest.to_string()));
                    rest = "";
                }
            }
        }

        Ok(Self {
            template: template.to_string(),
            parts,
        })
    }

    /// Source template
    pub fn template(&self) -> &str {
        &self.template
    }

    /// Number of names the template produces, saturating at `u64::MAX`
    pub fn count(&self) -> u64 {
        self.parts
            .iter()
            .fold(1u64, |acc, part| acc.saturating_mul(part.len() as u64))
    }

    /// Every name the template produces, last group varying fastest.
    pub fn names(&self) -> Names<'_> {
        Names {
            parts: &self.parts,
            indices: vec![0; self.parts.len()],
            done: self.parts.iter().any(|part| part.len() == 0),
        }
    }
}

fn parse_group(group: &str) -> Result<Part, &'static str> {
    if let Some((start, end)) = group.split_once("..") {
        let hex = start.starts_with(['x', 'X']);
        let start_digits = if hex { &start[1..] } else { start };
        let end_digits = if hex {
            end.strip_prefix(['x', 'X']).unwrap_or(end)
        } else {
            end
        };
        if start_digits.is_empty() || end_digits.is_empty() {
            return Err("empty range bound");
        }
        let radix_num = if hex { 16 } else { 10 };
        let start_value =
            u32::from_str_radix(start_digits, radix_num).map_err(|_| "invalid range start")?;
        let end_value =
            u32::from_str_radix(end_digits, radix_num).map_err(|_| "invalid range end")?;
        if end_value < start_value {
            return Err("range end before start");
        }
        let radix = if !hex {
            Radix::Decimal
        } else if start_digits
            .chars()
            .chain(end_digits.chars())
            .any(|c| c.is_ascii_uppercase())
        {
            Radix::HexUpper
        } else {
            Radix::HexLower
        };
        return Ok(Part::Range {
            start: start_value,
            end: end_value,
            width: start_digits.len(),
            radix,
        });
    }

    Ok(Part::Choice(group.split('|').map(str::to_string).collect()))
}

impl FromStr for CandidateGrammar {
    type Err = ArchiveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CandidateGrammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.template)
    }
}

/// Iterator over the names of a [`CandidateGrammar`]
#[derive(Debug)]
pub struct Names<'a> {
    parts: &'a [Part],
    indices: Vec<usize>,
    done: bool,
}

impl Iterator for Names<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.done {
            return None;
        }

        let mut name = String::new();
        for (part, &index) in self.parts.iter().zip(&self.indices) {
            part.push_to(index, &mut name);
        }

        // Odometer step, last part fastest
        self.done = true;
        for (part, index) in self.parts.iter().zip(self.indices.iter_mut()).rev() {
            *index += 1;
            if *index < part.len() {
                self.done = false;
                break;
            }
            *index = 0;
        }

        Some(name)
    }
}
