//! Parser for column-aligned console reports such as `docker node ps`.
//!
//! Column boundaries come from where each column name starts in the header
//! line. A column spans from its own offset to the next column's offset; the
//! last column runs to the end of the line.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("column {0:?} not found in header")]
    MissingColumn(String),
    #[error("column {0:?} is out of order in header")]
    ColumnOrder(String),
}

/// One parsed data line, keyed by column name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableRecord {
    fields: HashMap<String, String>,
}

impl TableRecord {
    /// Trimmed value of the column, empty when the line was too short.
    pub fn get(&self, column: &str) -> &str {
        self.fields.get(column).map(String::as_str).unwrap_or("")
    }
}

#[derive(Debug, Clone, Copy)]
struct Span {
    from: usize,
    to: Option<usize>,
}

/// Parses `input` whose first line is a header containing every entry of
/// `columns`, in that order. Blank lines after the header are ignored.
pub fn parse_table(columns: &[&str], input: &str) -> Result<Vec<TableRecord>, TableError> {
    let mut lines = input.lines();
    let Some(header) = lines.next() else {
        return Ok(Vec::new());
    };
    let spans = column_spans(columns, header)?;

    let records = lines
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let fields = columns
                .iter()
                .zip(spans.iter())
                .map(|(name, span)| (name.to_string(), slice_field(line, *span)))
                .collect();
            TableRecord { fields }
        })
        .collect();

    Ok(records)
}

fn column_spans(columns: &[&str], header: &str) -> Result<Vec<Span>, TableError> {
    let header: Vec<char> = header.chars().collect();
    let mut spans: Vec<Span> = Vec::with_capacity(columns.len());
    for name in columns {
        let from = find_chars(&header, name)
            .ok_or_else(|| TableError::MissingColumn(name.to_string()))?;
        if let Some(prev) = spans.last_mut() {
            if from < prev.from {
                return Err(TableError::ColumnOrder(name.to_string()));
            }
            prev.to = Some(from);
        }
        spans.push(Span { from, to: None });
    }
    Ok(spans)
}

// Offsets are in chars so multi-byte names in earlier columns keep later
// columns aligned the way a terminal renders them.
fn find_chars(haystack: &[char], needle: &str) -> Option<usize> {
    let needle: Vec<char> = needle.chars().collect();
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle.as_slice())
}

fn slice_field(line: &str, span: Span) -> String {
    let chars = line.chars().skip(span.from);
    let field: String = match span.to {
        Some(to) => chars.take(to - span.from).collect(),
        None => chars.collect(),
    };
    field.trim().to_string()
}
