#![forbid(unsafe_code)]

use peerlink_core::PeerDocument;
use peerlink_core::ids::SessionId;
use peerlink_storage::legacy::{
    parse_documents, read_documents_file, render_documents, write_documents_file,
};
use std::path::PathBuf;

fn temp_dir(test_name: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = base.join(format!("peerlink_legacy_{test_name}_{pid}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn sample() -> PeerDocument {
    PeerDocument {
        session_id: SessionId::try_new("ws01-4120").expect("session id"),
        document_path: "C:/work/Tower, Phase 1.rvt".to_string(),
        document_title: "Tower, Phase 1".to_string(),
        port: 52_011,
        hostname: "ws01".to_string(),
        process_id: 4120,
        registered_at_ms: 1_767_603_600_000,
        last_heartbeat_ms: 1_767_603_690_000,
        last_sync_ms: None,
        last_activity_ms: None,
    }
}

#[test]
fn written_file_reads_back() {
    let dir = temp_dir("write_read");
    let path = dir.join("documents.csv");
    let mut synced = sample();
    synced.document_title = "Annex".to_string();
    synced.document_path = String::new();
    synced.last_sync_ms = Some(1_767_603_700_000);

    write_documents_file(&path, &[sample(), synced.clone()]).expect("write");
    let docs = read_documents_file(&path);
    assert_eq!(docs, vec![sample(), synced]);
}

#[test]
fn rendered_text_starts_with_banner_and_header() {
    let text = render_documents(&[sample()]).expect("render");
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("# peerlink documents"));
    assert_eq!(
        lines.next(),
        Some(
            "DocumentTitle,DocumentPath,SessionId,Port,Hostname,ProcessId,RegisteredAt,LastHeartbeat,LastSync"
        )
    );
    let row = lines.next().expect("data row");
    assert!(row.starts_with("\"Tower, Phase 1\","), "row was {row}");
}

#[test]
fn malformed_rows_are_skipped() {
    let text = "\
# peerlink documents
DocumentTitle,DocumentPath,SessionId,Port,Hostname,ProcessId,RegisteredAt,LastHeartbeat,LastSync
Good,C:/good.rvt,ws01-1,52011,ws01,1,2026-01-05T09:00:00Z,2026-01-05T09:01:30Z,
BadPort,C:/bad.rvt,ws01-1,notaport,ws01,1,2026-01-05T09:00:00Z,2026-01-05T09:01:30Z,
Short,C:/short.rvt,ws01-1
BadTime,C:/t.rvt,ws01-1,52011,ws01,1,yesterday,2026-01-05T09:01:30Z,
";
    let docs = parse_documents(text);
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].document_title, "Good");
    assert_eq!(docs[0].last_sync_ms, None);
}

#[test]
fn missing_file_reads_as_empty() {
    let dir = temp_dir("missing");
    assert!(read_documents_file(&dir.join("nope.csv")).is_empty());
}

#[test]
fn commented_or_missing_header_keeps_every_row() {
    let commented = "\
# DocumentTitle,DocumentPath,SessionId,Port,Hostname,ProcessId,RegisteredAt,LastHeartbeat,LastSync
First,C:/first.rvt,ws01-1,52011,ws01,1,2026-01-05T09:00:00Z,2026-01-05T09:01:30Z,
Second,C:/second.rvt,ws01-1,52011,ws01,1,2026-01-05T09:00:00Z,2026-01-05T09:01:30Z,
";
    let titles = parse_documents(commented)
        .into_iter()
        .map(|doc| doc.document_title)
        .collect::<Vec<_>>();
    assert_eq!(titles, vec!["First", "Second"]);

    let headerless = "First,C:/first.rvt,ws01-1,52011,ws01,1,2026-01-05T09:00:00Z,2026-01-05T09:01:30Z,\n";
    assert_eq!(parse_documents(headerless).len(), 1);

    let lower_case_header = "documenttitle,documentpath,sessionid,port,hostname,processid,registeredat,lastheartbeat,lastsync\n\
First,C:/first.rvt,ws01-1,52011,ws01,1,2026-01-05T09:00:00Z,2026-01-05T09:01:30Z,\n";
    assert_eq!(parse_documents(lower_case_header).len(), 1);
}
