#![forbid(unsafe_code)]

//! Line-oriented record protocol carried inside a remote execution `output`.
//!
//! ```text
//! ELEMENT|1f3a-0042||Name|Basic Wall||Category|Walls
//! Level|Level 1
//! ERROR|view is not printable
//! ```
//!
//! A line whose first field is an upper-case marker starts a record (`KIND|id`). Further
//! `Key|Value` pairs follow either on the same line after a `||` segment break, inline as
//! `KIND|id|Key|Value`, or on continuation lines. `ERROR|message` lines are collected
//! separately. `\|`, `\\` and `\n` escape separators inside keys and values.

use serde::{Deserialize, Serialize};

pub const ERROR_MARKER: &str = "ERROR";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub kind: String,
    pub id: String,
    pub fields: Vec<(String, String)>,
}

impl RemoteRecord {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    /// First value stored under `key`.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn to_line(&self) -> String {
        let mut out = String::new();
        push_escaped(&mut out, &self.kind);
        out.push('|');
        push_escaped(&mut out, &self.id);
        for (key, value) in &self.fields {
            out.push_str("||");
            push_escaped(&mut out, key);
            out.push('|');
            push_escaped(&mut out, value);
        }
        out
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoteOutput {
    pub records: Vec<RemoteRecord>,
    pub errors: Vec<String>,
    pub skipped_lines: usize,
}

impl RemoteOutput {
    pub fn records_of<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a RemoteRecord> + 'a {
        self.records.iter().filter(move |r| r.kind == kind)
    }
}

pub fn error_line(message: &str) -> String {
    let mut out = String::from(ERROR_MARKER);
    out.push('|');
    push_escaped(&mut out, message);
    out
}

pub fn parse_output(text: &str) -> RemoteOutput {
    let mut out = RemoteOutput::default();
    let mut current: Option<RemoteRecord> = None;

    for raw in text.lines() {
        let line = raw.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let segments = split_segments(line);
        let Some(head) = segments.first() else {
            out.skipped_lines += 1;
            continue;
        };
        let marker = head.first().map(String::as_str).unwrap_or("");

        if marker == ERROR_MARKER {
            let message = head[1..].join("|");
            out.errors.push(message);
            continue;
        }

        if is_record_marker(marker) {
            if head.len() < 2 || head[1].is_empty() {
                out.skipped_lines += 1;
                continue;
            }
            if let Some(done) = current.take() {
                out.records.push(done);
            }
            let mut record = RemoteRecord::new(marker, head[1].clone());
            push_pairs(&mut record, &head[2..]);
            for segment in &segments[1..] {
                push_pairs(&mut record, segment);
            }
            current = Some(record);
            continue;
        }

        match current.as_mut() {
            Some(record) if segments.iter().all(|s| s.len() >= 2) => {
                for segment in &segments {
                    push_pairs(record, segment);
                }
            }
            _ => out.skipped_lines += 1,
        }
    }

    if let Some(done) = current.take() {
        out.records.push(done);
    }
    out
}

fn is_record_marker(token: &str) -> bool {
    let mut chars = token.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    first.is_ascii_uppercase()
        && chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

fn push_pairs(record: &mut RemoteRecord, fields: &[String]) {
    // An odd trailing key without a value is dropped.
    for pair in fields.chunks_exact(2) {
        if pair[0].is_empty() {
            continue;
        }
        record.fields.push((pair[0].clone(), pair[1].clone()));
    }
}

/// Splits a line on unescaped `||` into segments and each segment on unescaped `|`.
fn split_segments(line: &str) -> Vec<Vec<String>> {
    let mut segments = Vec::new();
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => match chars.next() {
                Some('n') => current.push('\n'),
                Some(other) => current.push(other),
                None => {}
            },
            '|' => {
                fields.push(std::mem::take(&mut current));
                if chars.peek() == Some(&'|') {
                    chars.next();
                    segments.push(std::mem::take(&mut fields));
                }
            }
            _ => current.push(ch),
        }
    }
    fields.push(current);
    segments.push(fields);
    segments
}

fn push_escaped(out: &mut String, value: &str) {
    for ch in value.chars() {
        match ch {
            '|' => out.push_str("\\|"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => {}
            _ => out.push(ch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_segmented_records_and_continuations() {
        let text = "ELEMENT|1f3a-0042||Name|Basic Wall||Category|Walls\n\
                    Level|Level 1\n\
                    ELEMENT|1f3a-0043|Name|Door\n";
        let out = parse_output(text);
        assert_eq!(out.records.len(), 2);
        let wall = &out.records[0];
        assert_eq!(wall.kind, "ELEMENT");
        assert_eq!(wall.id, "1f3a-0042");
        assert_eq!(wall.field("Name"), Some("Basic Wall"));
        assert_eq!(wall.field("Category"), Some("Walls"));
        assert_eq!(wall.field("Level"), Some("Level 1"));
        assert_eq!(out.records[1].field("Name"), Some("Door"));
        assert_eq!(out.skipped_lines, 0);
    }

    #[test]
    fn malformed_lines_are_skipped_not_fatal() {
        let text = "stray text before any record\n\
                    ELEMENT\n\
                    VIEW|12||Title|Level 1\n\
                    no pipes here\n\
                    ERROR|view 13 not found\n";
        let out = parse_output(text);
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].field("Title"), Some("Level 1"));
        assert_eq!(out.errors, vec!["view 13 not found".to_string()]);
        assert_eq!(out.skipped_lines, 3);
    }

    #[test]
    fn escaped_separators_round_trip() {
        let record = RemoteRecord::new("DOCUMENT", "a|b")
            .with_field("Title", "Tower || Podium")
            .with_field("Note", "line one\nline two \\ end");
        let line = record.to_line();
        assert!(!line.contains('\n'));
        let out = parse_output(&line);
        assert_eq!(out.records, vec![record]);
    }

    #[test]
    fn error_lines_escape_pipes() {
        let line = error_line("bad | input");
        assert_eq!(parse_output(&line).errors, vec!["bad | input".to_string()]);
    }
}
