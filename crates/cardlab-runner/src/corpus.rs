//! Query corpus parsing.
//!
//! A corpus is one script holding many queries, each introduced by a marker
//! comment such as `-- Query 12/99 | Template: query7.tpl` and closed by a
//! lone `;` line, the next marker, or end of file.

use std::fs;
use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::dialect;
use crate::error::{HarnessError, Result};

const MARKER_PREFIX: &str = "-- Query ";
const FORMATTING_PREFIXES: [&str; 2] = ["-- start query", "-- end query"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryUnit {
    pub id: u64,
    pub text: String,
}

enum Cursor {
    /// Between units; lines are ignored.
    Idle,
    /// Inside a unit with the given id.
    Open(u64),
}

struct UnitBuilder {
    units: Vec<QueryUnit>,
    lines: Vec<String>,
    cursor: Cursor,
}

impl UnitBuilder {
    fn new() -> Self {
        Self {
            units: Vec::new(),
            lines: Vec::new(),
            cursor: Cursor::Idle,
        }
    }

    fn close(&mut self) {
        if let Cursor::Open(id) = self.cursor {
            let text = dialect::normalize(&self.lines.join("\n"));
            self.units.push(QueryUnit { id, text });
        }
        self.lines.clear();
        self.cursor = Cursor::Idle;
    }

    fn open(&mut self, id: u64) {
        self.close();
        self.cursor = Cursor::Open(id);
    }

    fn push(&mut self, line: &str) {
        if matches!(self.cursor, Cursor::Open(_)) {
            self.lines.push(line.to_string());
        }
    }
}

/// Extracts the numeric id from a marker line, `None` if malformed.
fn marker_id(line: &str) -> Option<u64> {
    let rest = line.strip_prefix(MARKER_PREFIX)?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Splits corpus text into ordered query units.
pub fn parse_corpus(text: &str) -> Vec<QueryUnit> {
    let mut builder = UnitBuilder::new();
    for (line_no, raw) in text.lines().enumerate() {
        let line = raw.trim_end();
        if line.starts_with(MARKER_PREFIX) {
            match marker_id(line) {
                Some(id) => builder.open(id),
                None => {
                    debug!(line = line_no + 1, "skipping malformed query marker");
                    builder.close();
                }
            }
        } else if FORMATTING_PREFIXES.iter().any(|p| line.starts_with(p)) {
            continue;
        } else if line.trim() == ";" {
            builder.close();
        } else if !line.trim().is_empty() {
            builder.push(line);
        }
    }
    builder.close();
    builder.units
}

/// Reads and parses a corpus file. Only an unreadable file is an error.
pub fn load_corpus(path: &Path) -> Result<Vec<QueryUnit>> {
    let text = fs::read_to_string(path).map_err(|source| HarnessError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_corpus(&text))
}

#[derive(Debug, Clone, Serialize)]
pub struct CorpusSummary {
    pub units: usize,
    pub first_id: Option<u64>,
    pub last_id: Option<u64>,
    pub empty_ids: Vec<u64>,
    pub duplicate_ids: Vec<u64>,
}

pub fn summarize_corpus(units: &[QueryUnit]) -> CorpusSummary {
    let mut seen = std::collections::BTreeSet::new();
    let mut duplicate_ids = Vec::new();
    for unit in units {
        if !seen.insert(unit.id) && !duplicate_ids.contains(&unit.id) {
            duplicate_ids.push(unit.id);
        }
    }
    CorpusSummary {
        units: units.len(),
        first_id: units.first().map(|u| u.id),
        last_id: units.last().map(|u| u.id),
        empty_ids: units
            .iter()
            .filter(|u| u.text.trim().is_empty())
            .map(|u| u.id)
            .collect(),
        duplicate_ids,
    }
}
