#![forbid(unsafe_code)]

use peerlink_core::SelectionItem;
use peerlink_core::ids::SessionId;
use peerlink_storage::SqliteStore;
use std::path::PathBuf;

fn temp_dir(test_name: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let dir = base.join(format!("peerlink_selection_{test_name}_{pid}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn session(raw: &str) -> SessionId {
    SessionId::try_new(raw).expect("session id")
}

#[test]
fn save_then_load_returns_the_same_items() {
    let dir = temp_dir("round_trip");
    let mut store = SqliteStore::open_in_dir(&dir).expect("open store");
    let items = vec![
        SelectionItem::new("Tower, Phase 1", "C:/a|b/tower.rvt", "id-1"),
        SelectionItem::new("Tower, Phase 1", "C:/a|b/tower.rvt", "id,2"),
        SelectionItem::new("Annex", "", r"id\3"),
        SelectionItem::new("Tower, Phase 1", "C:/a|b/tower.rvt", "id-4"),
    ];

    let rows = store
        .selection_save(&session("ws01-1"), &items, 1_000)
        .expect("save");
    assert_eq!(rows, 2, "one row per document");

    let loaded = store.selection_load().expect("load");
    assert_eq!(
        loaded,
        vec![
            SelectionItem::new("Tower, Phase 1", "C:/a|b/tower.rvt", "id-1"),
            SelectionItem::new("Tower, Phase 1", "C:/a|b/tower.rvt", "id,2"),
            SelectionItem::new("Tower, Phase 1", "C:/a|b/tower.rvt", "id-4"),
            SelectionItem::new("Annex", "", r"id\3"),
        ]
    );
}

#[test]
fn save_replaces_previous_selection() {
    let dir = temp_dir("replace");
    let mut store = SqliteStore::open_in_dir(&dir).expect("open store");
    let who = session("ws01-1");
    store
        .selection_save(&who, &[SelectionItem::new("A", "", "1")], 1)
        .expect("save a");
    store
        .selection_save(&who, &[SelectionItem::new("B", "", "2")], 2)
        .expect("save b");

    assert_eq!(
        store.selection_load().expect("load"),
        vec![SelectionItem::new("B", "", "2")]
    );

    store.selection_save(&who, &[], 3).expect("save empty");
    assert!(store.selection_load().expect("load").is_empty());
}

#[test]
fn blank_ids_are_not_stored() {
    let dir = temp_dir("blank_ids");
    let mut store = SqliteStore::open_in_dir(&dir).expect("open store");
    let rows = store
        .selection_save(
            &session("ws01-1"),
            &[SelectionItem::new("A", "", "  "), SelectionItem::new("B", "", "")],
            1,
        )
        .expect("save");
    assert_eq!(rows, 0);
    assert!(store.selection_load().expect("load").is_empty());
}

#[test]
fn add_merges_without_duplicates() {
    let dir = temp_dir("add_union");
    let mut store = SqliteStore::open_in_dir(&dir).expect("open store");
    let who = session("ws01-1");
    store
        .selection_save(
            &who,
            &[SelectionItem::new("A", "", "1"), SelectionItem::new("A", "", "2")],
            1,
        )
        .expect("save");

    let added = store
        .selection_add(
            &session("ws02-2"),
            &[
                SelectionItem::new("A", "", "2"),
                SelectionItem::new("A", "", " 2 "),
                SelectionItem::new("A", "", "3"),
                SelectionItem::new("B", "", "2"),
            ],
            2,
        )
        .expect("add");
    assert_eq!(added, 2);

    let loaded = store.selection_load().expect("load");
    let keys = loaded
        .iter()
        .map(|i| (i.document_title.as_str(), i.unique_id.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(keys, vec![("A", "1"), ("A", "2"), ("A", "3"), ("B", "2")]);
}

#[test]
fn load_for_titles_filters_closed_documents() {
    let dir = temp_dir("for_titles");
    let mut store = SqliteStore::open_in_dir(&dir).expect("open store");
    store
        .selection_save(
            &session("ws01-1"),
            &[
                SelectionItem::new("Open", "", "1"),
                SelectionItem::new("Closed", "", "2"),
            ],
            1,
        )
        .expect("save");

    let items = store
        .selection_load_for_titles(&["Open".to_string()])
        .expect("load");
    assert_eq!(items, vec![SelectionItem::new("Open", "", "1")]);
    assert!(store.selection_load_for_titles(&[]).expect("load").is_empty());
}

#[test]
fn clear_empties_the_table() {
    let dir = temp_dir("clear");
    let mut store = SqliteStore::open_in_dir(&dir).expect("open store");
    store
        .selection_save(
            &session("ws01-1"),
            &[SelectionItem::new("A", "", "1"), SelectionItem::new("B", "", "2")],
            1,
        )
        .expect("save");
    assert_eq!(store.selection_clear().expect("clear"), 2);
    assert!(store.selection_load().expect("load").is_empty());
}

#[test]
fn padded_ids_round_trip_exactly() {
    let dir = temp_dir("padded_ids");
    let mut store = SqliteStore::open_in_dir(&dir).expect("open store");
    store
        .selection_save(
            &session("ws01-1"),
            &[
                SelectionItem::new("A", "C:/a.rvt", " id-1 "),
                SelectionItem::new("A", "C:/a.rvt", "  "),
            ],
            1,
        )
        .expect("save");
    let ids = store
        .selection_load()
        .expect("load")
        .into_iter()
        .map(|item| item.unique_id)
        .collect::<Vec<_>>();
    assert_eq!(ids, vec![" id-1 "]);

    let added = store
        .selection_add(
            &session("ws01-1"),
            &[
                SelectionItem::new("A", "C:/a.rvt", "id-1"),
                SelectionItem::new("A", "C:/a.rvt", " id-1 "),
            ],
            2,
        )
        .expect("add");
    assert_eq!(added, 1);
    let ids = store
        .selection_load()
        .expect("load")
        .into_iter()
        .map(|item| item.unique_id)
        .collect::<Vec<_>>();
    assert_eq!(ids, vec![" id-1 ", "id-1"]);
}
