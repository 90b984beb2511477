#![forbid(unsafe_code)]

use super::{SqliteStore, StoreError};
use peerlink_core::SelectionItem;
use peerlink_core::idlist::{join_ids, split_ids};
use peerlink_core::ids::SessionId;
use rusqlite::params;
use std::collections::{HashMap, HashSet};

struct DocumentGroup<'a> {
    document_title: &'a str,
    document_path: &'a str,
    unique_ids: Vec<&'a str>,
}

/// Groups items per `(title, path)` in order of first appearance.
fn group_by_document(items: &[SelectionItem]) -> Vec<DocumentGroup<'_>> {
    let mut index = HashMap::<(&str, &str), usize>::new();
    let mut groups = Vec::<DocumentGroup<'_>>::new();
    for item in items {
        let id = item.unique_id.as_str();
        if id.trim().is_empty() {
            continue;
        }
        let key = (item.document_title.as_str(), item.document_path.as_str());
        let slot = *index.entry(key).or_insert_with(|| {
            groups.push(DocumentGroup {
                document_title: key.0,
                document_path: key.1,
                unique_ids: Vec::new(),
            });
            groups.len() - 1
        });
        groups[slot].unique_ids.push(id);
    }
    groups
}

impl SqliteStore {
    /// Replaces the stored selection with `items` in a single transaction.
    /// Returns the number of document rows written.
    pub fn selection_save(
        &mut self,
        session_id: &SessionId,
        items: &[SelectionItem],
        now_ms: i64,
    ) -> Result<usize, StoreError> {
        let groups = group_by_document(items);
        let tx = self.write_tx()?;
        tx.execute("DELETE FROM selection_entries", [])?;
        for group in &groups {
            tx.execute(
                r#"
                INSERT INTO selection_entries(document_title, document_path, unique_ids, session_id, created_at_ms)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    group.document_title,
                    group.document_path,
                    join_ids(group.unique_ids.iter().copied()),
                    session_id.as_str(),
                    now_ms,
                ],
            )?;
        }
        tx.commit()?;
        Ok(groups.len())
    }

    /// Items in row creation order, then list order within a row.
    pub fn selection_load(&self) -> Result<Vec<SelectionItem>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT document_title, document_path, unique_ids FROM selection_entries ORDER BY id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let document_title: String = row.get(0)?;
            let document_path: String = row.get(1)?;
            let unique_ids: String = row.get(2)?;
            for unique_id in split_ids(&unique_ids) {
                out.push(SelectionItem {
                    document_title: document_title.clone(),
                    document_path: document_path.clone(),
                    unique_id,
                });
            }
        }
        Ok(out)
    }

    pub fn selection_load_for_titles(
        &self,
        open_titles: &[String],
    ) -> Result<Vec<SelectionItem>, StoreError> {
        let open = open_titles.iter().map(String::as_str).collect::<HashSet<_>>();
        let mut items = self.selection_load()?;
        items.retain(|item| open.contains(item.document_title.as_str()));
        Ok(items)
    }

    /// Load, merge by `(document_title, unique_id)`, save.
    ///
    /// These are three separate statements: two processes adding at the same time resolve as
    /// last writer wins. Returns how many items were new.
    pub fn selection_add(
        &mut self,
        session_id: &SessionId,
        items: &[SelectionItem],
        now_ms: i64,
    ) -> Result<usize, StoreError> {
        let mut merged = self.selection_load()?;
        let mut seen = merged
            .iter()
            .map(|item| (item.document_title.clone(), item.unique_id.clone()))
            .collect::<HashSet<_>>();

        let mut added = 0usize;
        for item in items {
            let (title, id) = item.merge_key();
            if id.trim().is_empty() {
                continue;
            }
            if seen.insert((title.to_string(), id.to_string())) {
                merged.push(item.clone());
                added += 1;
            }
        }

        self.selection_save(session_id, &merged, now_ms)?;
        Ok(added)
    }

    pub fn selection_clear(&mut self) -> Result<usize, StoreError> {
        Ok(self.conn.execute("DELETE FROM selection_entries", [])?)
    }
}
