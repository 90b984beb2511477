#![forbid(unsafe_code)]

//! Line-oriented documents file, kept for peers that predate the SQLite registry.
//!
//! ```text
//! # peerlink documents
//! DocumentTitle,DocumentPath,SessionId,Port,Hostname,ProcessId,RegisteredAt,LastHeartbeat,LastSync
//! Proj,C:/work/Proj.rvt,ws01-4120,52011,ws01,4120,2026-01-05T09:00:00Z,2026-01-05T09:01:30Z,
//! ```
//!
//! Timestamps are RFC 3339. Fields containing commas or quotes are quoted. Rows that fail to
//! parse are skipped.

use crate::StoreError;
use peerlink_core::PeerDocument;
use peerlink_core::clock::{rfc3339_to_ts_ms, ts_ms_to_rfc3339};
use peerlink_core::ids::SessionId;
use std::path::Path;

pub const HEADER: [&str; 9] = [
    "DocumentTitle",
    "DocumentPath",
    "SessionId",
    "Port",
    "Hostname",
    "ProcessId",
    "RegisteredAt",
    "LastHeartbeat",
    "LastSync",
];

const BANNER: &str = "# peerlink documents\n";

pub fn parse_documents(text: &str) -> Vec<PeerDocument> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let mut out = Vec::new();
    for record in reader.records() {
        let Ok(record) = record else {
            continue;
        };
        if is_header(&record) {
            continue;
        }
        match parse_record(&record) {
            Some(doc) => out.push(doc),
            None => tracing::debug!(line = ?record.position().map(|p| p.line()), "skipping malformed documents row"),
        }
    }
    out
}

/// The header line is optional and may appear commented out, so it is recognised by content.
fn is_header(record: &csv::StringRecord) -> bool {
    record
        .get(0)
        .is_some_and(|first| first.eq_ignore_ascii_case(HEADER[0]))
}

fn parse_record(record: &csv::StringRecord) -> Option<PeerDocument> {
    if record.len() < 8 {
        return None;
    }
    let last_sync_ms = match record.get(8).map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(rfc3339_to_ts_ms(raw)?),
    };
    let last_heartbeat_ms = rfc3339_to_ts_ms(record.get(7)?)?;
    Some(PeerDocument {
        document_title: record.get(0)?.to_string(),
        document_path: record.get(1)?.to_string(),
        session_id: SessionId::try_new(record.get(2)?).ok()?,
        port: record.get(3)?.parse().ok()?,
        hostname: record.get(4)?.to_string(),
        process_id: record.get(5)?.parse().ok()?,
        registered_at_ms: rfc3339_to_ts_ms(record.get(6)?)?,
        last_heartbeat_ms,
        last_sync_ms,
        last_activity_ms: None,
    })
}

pub fn render_documents(docs: &[PeerDocument]) -> Result<String, StoreError> {
    let mut writer = csv::WriterBuilder::new().from_writer(Vec::<u8>::new());
    writer.write_record(HEADER)?;
    for doc in docs {
        writer.write_record([
            doc.document_title.clone(),
            doc.document_path.clone(),
            doc.session_id.to_string(),
            doc.port.to_string(),
            doc.hostname.clone(),
            doc.process_id.to_string(),
            ts_ms_to_rfc3339(doc.registered_at_ms),
            ts_ms_to_rfc3339(doc.last_heartbeat_ms),
            doc.last_sync_ms.map(ts_ms_to_rfc3339).unwrap_or_default(),
        ])?;
    }
    let body = writer
        .into_inner()
        .map_err(|err| StoreError::Io(err.into_error()))?;
    let mut out = String::from(BANNER);
    out.push_str(&String::from_utf8_lossy(&body));
    Ok(out)
}

/// A missing or unreadable file reads as empty.
pub fn read_documents_file(path: &Path) -> Vec<PeerDocument> {
    match std::fs::read_to_string(path) {
        Ok(text) => parse_documents(&text),
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %err, "documents file unreadable");
            }
            Vec::new()
        }
    }
}

/// Writes through a temp file and rename so readers never see a half-written file.
pub fn write_documents_file(path: &Path, docs: &[PeerDocument]) -> Result<(), StoreError> {
    let text = render_documents(docs)?;
    let dir = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;
    let tmp = path.with_extension("csv.tmp");
    std::fs::write(&tmp, text)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}
