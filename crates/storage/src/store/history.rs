#![forbid(unsafe_code)]

use super::{SqliteStore, StoreError, to_sqlite_i64};
use peerlink_core::ActivationEntry;
use peerlink_core::history::{dedup_keep_latest, dedup_newest_first};
use peerlink_core::ids::SessionId;
use rusqlite::{Params, params};

const ENTRY_COLUMNS: &str = "session_id, document_session_id, document_title, document_path, \
     view_id, view_title, view_type, activated_at_ms";

fn read_entry_row(row: &rusqlite::Row<'_>) -> Result<Option<ActivationEntry>, rusqlite::Error> {
    let Ok(session_id) = SessionId::try_new(row.get::<_, String>(0)?) else {
        return Ok(None);
    };
    Ok(Some(ActivationEntry {
        session_id,
        document_session_id: row.get(1)?,
        document_title: row.get(2)?,
        document_path: row.get(3)?,
        view_id: row.get(4)?,
        view_title: row.get(5)?,
        view_type: row.get(6)?,
        activated_at_ms: row.get(7)?,
    }))
}

impl SqliteStore {
    /// Appends one activation. Repeated views are expected and never rejected.
    pub fn history_log(&mut self, entry: &ActivationEntry) -> Result<i64, StoreError> {
        if entry.document_title.trim().is_empty() {
            return Err(StoreError::InvalidInput(
                "activation.document_title must not be empty",
            ));
        }
        if entry.view_id.trim().is_empty() {
            return Err(StoreError::InvalidInput(
                "activation.view_id must not be empty",
            ));
        }
        self.conn.execute(
            r#"
            INSERT INTO activation_log(
              session_id, document_session_id, document_title, document_path,
              view_id, view_title, view_type, activated_at_ms
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                entry.session_id.as_str(),
                entry.document_session_id.as_str(),
                entry.document_title.as_str(),
                entry.document_path.as_str(),
                entry.view_id.as_str(),
                entry.view_title.as_str(),
                entry.view_type.as_str(),
                entry.activated_at_ms,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Most recent distinct views of a session across all its documents, newest first.
    pub fn history_for_session(
        &self,
        session_id: &SessionId,
        limit: usize,
    ) -> Result<Vec<ActivationEntry>, StoreError> {
        let newest_first = self.query_entries(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM activation_log \
                 WHERE session_id=?1 \
                 ORDER BY activated_at_ms DESC, id DESC"
            ),
            params![session_id.as_str()],
        )?;
        Ok(dedup_newest_first(newest_first, limit, |e| {
            (e.document_title.clone(), e.view_id.clone())
        }))
    }

    /// Distinct views of one document in one session, oldest first; a revisited view sits at
    /// the position of its latest activation.
    pub fn history_recent_views(
        &self,
        session_id: &SessionId,
        document_title: &str,
    ) -> Result<Vec<ActivationEntry>, StoreError> {
        let chronological = self.query_entries(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM activation_log \
                 WHERE session_id=?1 AND document_title=?2 \
                 ORDER BY activated_at_ms ASC, id ASC"
            ),
            params![session_id.as_str(), document_title],
        )?;
        Ok(dedup_keep_latest(chronological, |e| e.view_id.clone()))
    }

    /// Views of `document_title` recorded by any session other than `exclude_session`,
    /// newest first. Used to reopen what was open the last time the document was used.
    pub fn history_previous_session_views(
        &self,
        document_title: &str,
        exclude_session: &SessionId,
        limit: usize,
    ) -> Result<Vec<ActivationEntry>, StoreError> {
        let newest_first = self.query_entries(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM activation_log \
                 WHERE document_title=?1 AND session_id<>?2 \
                 ORDER BY activated_at_ms DESC, id DESC"
            ),
            params![document_title, exclude_session.as_str()],
        )?;
        Ok(dedup_newest_first(newest_first, limit, |e| e.view_id.clone()))
    }

    pub fn history_remove(
        &mut self,
        session_id: &SessionId,
        document_title: &str,
        view_title: &str,
    ) -> Result<usize, StoreError> {
        Ok(self.conn.execute(
            "DELETE FROM activation_log WHERE session_id=?1 AND document_title=?2 AND view_title=?3",
            params![session_id.as_str(), document_title, view_title],
        )?)
    }

    /// Keeps the newest `keep_per_session` rows of every session.
    pub fn history_prune(&mut self, keep_per_session: usize) -> Result<usize, StoreError> {
        let keep = to_sqlite_i64(keep_per_session)?;
        let tx = self.write_tx()?;
        let deleted = tx.execute(
            r#"
            DELETE FROM activation_log WHERE id IN (
              SELECT id FROM (
                SELECT id, ROW_NUMBER() OVER (
                  PARTITION BY session_id ORDER BY activated_at_ms DESC, id DESC
                ) AS recency
                FROM activation_log
              )
              WHERE recency > ?1
            )
            "#,
            params![keep],
        )?;
        tx.commit()?;
        Ok(deleted)
    }

    fn query_entries<P: Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<ActivationEntry>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            if let Some(entry) = read_entry_row(row)? {
                out.push(entry);
            }
        }
        Ok(out)
    }
}
