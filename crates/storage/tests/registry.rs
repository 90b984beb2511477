#![forbid(unsafe_code)]

use peerlink_core::ids::SessionId;
use peerlink_core::{HeartbeatField, PeerDocument, STALE_AFTER_MS};
use peerlink_storage::{SqliteStore, StoreError};
use std::path::PathBuf;

fn temp_dir(test_name: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = base.join(format!("peerlink_storage_{test_name}_{pid}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn session(raw: &str) -> SessionId {
    SessionId::try_new(raw).expect("session id")
}

fn doc(session_id: &str, title: &str, path: &str, heartbeat_ms: i64) -> PeerDocument {
    PeerDocument {
        session_id: session(session_id),
        document_path: path.to_string(),
        document_title: title.to_string(),
        port: 52_011,
        hostname: "ws01".to_string(),
        process_id: 4120,
        registered_at_ms: heartbeat_ms,
        last_heartbeat_ms: heartbeat_ms,
        last_sync_ms: None,
        last_activity_ms: None,
    }
}

#[test]
fn repeated_upsert_keeps_one_row_per_session_and_document() {
    let dir = temp_dir("repeated_upsert");
    let mut store = SqliteStore::open_in_dir(&dir).expect("open store");

    let first = doc("ws01-4120", "Proj", "C:/work/Proj.rvt", 1_000);
    store.registry_upsert(&first).expect("upsert");
    store.registry_upsert(&first).expect("upsert again");

    let mut later = first.clone();
    later.last_heartbeat_ms = 5_000;
    later.registered_at_ms = 5_000;
    store.registry_upsert(&later).expect("heartbeat upsert");

    let rows = store.registry_all().expect("all");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].last_heartbeat_ms, 5_000);
    assert_eq!(
        rows[0].registered_at_ms, 1_000,
        "registration time must survive heartbeats"
    );
}

#[test]
fn untitled_documents_are_keyed_by_title() {
    let dir = temp_dir("untitled_documents");
    let mut store = SqliteStore::open_in_dir(&dir).expect("open store");

    store
        .registry_upsert_batch(&[
            doc("ws01-4120", "Project1", "", 1_000),
            doc("ws01-4120", "Project2", "", 1_000),
            doc("ws01-4120", "Project1", "", 2_000),
        ])
        .expect("batch");

    let rows = store.registry_all().expect("all");
    let titles = rows.iter().map(|r| r.document_title.as_str()).collect::<Vec<_>>();
    assert_eq!(titles, vec!["Project1", "Project2"]);
}

#[test]
fn stale_rows_leave_active_view_first_then_table() {
    let dir = temp_dir("stale_rows");
    let mut store = SqliteStore::open_in_dir(&dir).expect("open store");
    let now_ms = 10_000_000;

    store
        .registry_upsert_batch(&[
            doc("ws01-1", "Fresh", "C:/fresh.rvt", now_ms - 1_000),
            doc("ws02-2", "Old", "C:/old.rvt", now_ms - 121_000),
        ])
        .expect("batch");

    let active = store.registry_active(now_ms).expect("active");
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].document_title, "Fresh");
    assert_eq!(store.registry_all().expect("all").len(), 2);

    let removed = store.registry_remove_stale(now_ms).expect("remove stale");
    assert_eq!(removed, 1);
    let all = store.registry_all().expect("all");
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].document_title, "Fresh");
}

#[test]
fn row_at_exact_threshold_is_still_active() {
    let dir = temp_dir("threshold");
    let mut store = SqliteStore::open_in_dir(&dir).expect("open store");
    let now_ms = 10_000_000;
    store
        .registry_upsert(&doc("ws01-1", "Edge", "C:/edge.rvt", now_ms - STALE_AFTER_MS))
        .expect("upsert");
    assert_eq!(store.registry_active(now_ms).expect("active").len(), 1);
    assert_eq!(store.registry_remove_stale(now_ms).expect("sweep"), 0);
}

#[test]
fn rows_are_ordered_by_title() {
    let dir = temp_dir("ordering");
    let mut store = SqliteStore::open_in_dir(&dir).expect("open store");
    store
        .registry_upsert_batch(&[
            doc("ws01-1", "tower", "C:/t.rvt", 1),
            doc("ws01-1", "Annex", "C:/a.rvt", 1),
            doc("ws02-2", "Podium", "C:/p.rvt", 1),
        ])
        .expect("batch");
    let titles = store
        .registry_all()
        .expect("all")
        .into_iter()
        .map(|r| r.document_title)
        .collect::<Vec<_>>();
    assert_eq!(titles, vec!["Annex", "Podium", "tower"]);
}

#[test]
fn touch_updates_single_field_only() {
    let dir = temp_dir("touch");
    let mut store = SqliteStore::open_in_dir(&dir).expect("open store");
    let entry = doc("ws01-1", "Proj", "C:/p.rvt", 1_000);
    store.registry_upsert(&entry).expect("upsert");

    let key = entry.document_key();
    assert!(
        store
            .registry_touch(&entry.session_id, &key, HeartbeatField::Activity, 7_777)
            .expect("touch")
    );
    let row = store.registry_all().expect("all").remove(0);
    assert_eq!(row.last_activity_ms, Some(7_777));
    assert_eq!(row.last_heartbeat_ms, 1_000);

    // A later heartbeat without activity must not clear it.
    let mut beat = entry.clone();
    beat.last_heartbeat_ms = 2_000;
    store.registry_upsert(&beat).expect("heartbeat");
    let row = store.registry_all().expect("all").remove(0);
    assert_eq!(row.last_activity_ms, Some(7_777));

    assert!(
        !store
            .registry_touch(&entry.session_id, "C:/missing.rvt", HeartbeatField::Sync, 1)
            .expect("touch missing")
    );
}

#[test]
fn remove_session_and_document() {
    let dir = temp_dir("remove_session");
    let mut store = SqliteStore::open_in_dir(&dir).expect("open store");
    store
        .registry_upsert_batch(&[
            doc("ws01-1", "A", "C:/a.rvt", 1),
            doc("ws01-1", "B", "C:/b.rvt", 1),
            doc("ws02-2", "C", "C:/c.rvt", 1),
        ])
        .expect("batch");

    assert!(
        store
            .registry_remove_document(&session("ws01-1"), "C:/b.rvt")
            .expect("remove doc")
    );
    assert_eq!(store.registry_for_session(&session("ws01-1")).expect("session").len(), 1);

    assert_eq!(store.registry_remove_session(&session("ws01-1")).expect("remove"), 1);
    let rest = store.registry_all().expect("all");
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].session_id.as_str(), "ws02-2");
}

#[test]
fn invalid_batch_writes_nothing() {
    let dir = temp_dir("invalid_batch");
    let mut store = SqliteStore::open_in_dir(&dir).expect("open store");
    let bad = doc("ws01-1", "", "", 1);
    let err = store
        .registry_upsert_batch(&[doc("ws01-1", "Good", "C:/g.rvt", 1), bad])
        .expect_err("expected validation error");
    match err {
        StoreError::InvalidInput(msg) => assert_eq!(msg, "document needs a title or a path"),
        other => panic!("expected InvalidInput, got {other:?}"),
    }
    assert!(store.registry_all().expect("all").is_empty());
}

#[test]
fn two_handles_see_each_others_rows() {
    let dir = temp_dir("two_handles");
    let mut a = SqliteStore::open_in_dir(&dir).expect("open a");
    let b = SqliteStore::open_in_dir(&dir).expect("open b");
    let t0 = 50_000_000;

    a.registry_upsert(&doc("peer-a-1", "Proj.rvt", "C:/Proj.rvt", t0))
        .expect("register");

    let seen = b.registry_active(t0 + 119_000).expect("active at +119s");
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].session_id.as_str(), "peer-a-1");

    let gone = b.registry_active(t0 + 121_000).expect("active at +121s");
    assert!(gone.is_empty());
}

#[test]
fn concurrent_writers_do_not_corrupt_the_table() {
    let dir = temp_dir("concurrent_writers");
    SqliteStore::open_in_dir(&dir).expect("init");

    let handles = (0..4)
        .map(|peer| {
            let dir = dir.clone();
            std::thread::spawn(move || {
                let mut store = SqliteStore::open_in_dir(&dir).expect("open");
                for beat in 0..25 {
                    let docs = (0..3)
                        .map(|n| {
                            doc(
                                &format!("ws0{peer}-{peer}"),
                                &format!("Doc{n}"),
                                &format!("C:/p{peer}/d{n}.rvt"),
                                1_000 + beat,
                            )
                        })
                        .collect::<Vec<_>>();
                    store.registry_upsert_batch(&docs).expect("batch");
                }
            })
        })
        .collect::<Vec<_>>();
    for handle in handles {
        handle.join().expect("writer thread");
    }

    let store = SqliteStore::open_in_dir(&dir).expect("reopen");
    let rows = store.registry_all().expect("all");
    assert_eq!(rows.len(), 12);
    assert!(rows.iter().all(|r| r.last_heartbeat_ms == 1_024));
}
