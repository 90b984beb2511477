#![forbid(unsafe_code)]

use super::{SqliteStore, StoreError};
use peerlink_core::ids::SessionId;
use peerlink_core::model::document_key;
use peerlink_core::{HeartbeatField, PeerDocument, STALE_AFTER_MS};
use rusqlite::{Params, Transaction, params};

const MAX_TITLE_LEN: usize = 1_024;
const MAX_PATH_LEN: usize = 4_096;
const MAX_HOSTNAME_LEN: usize = 255;

const PEER_COLUMNS: &str = "session_id, document_path, document_title, port, hostname, process_id, \
     registered_at_ms, last_heartbeat_ms, last_sync_ms, last_activity_ms";

fn validate_document(doc: &PeerDocument) -> Result<(), StoreError> {
    if doc.document_title.trim().is_empty() && doc.document_path.trim().is_empty() {
        return Err(StoreError::InvalidInput(
            "document needs a title or a path",
        ));
    }
    if doc.document_title.len() > MAX_TITLE_LEN {
        return Err(StoreError::InvalidInput("document_title is too long"));
    }
    if doc.document_path.len() > MAX_PATH_LEN {
        return Err(StoreError::InvalidInput("document_path is too long"));
    }
    if doc.hostname.trim().is_empty() {
        return Err(StoreError::InvalidInput("hostname must not be empty"));
    }
    if doc.hostname.len() > MAX_HOSTNAME_LEN {
        return Err(StoreError::InvalidInput("hostname is too long"));
    }
    Ok(())
}

/// Rows written by a peer with a different id scheme are skipped, not fatal.
fn read_peer_row(row: &rusqlite::Row<'_>) -> Result<Option<PeerDocument>, rusqlite::Error> {
    let Ok(session_id) = SessionId::try_new(row.get::<_, String>(0)?) else {
        return Ok(None);
    };
    let Ok(port) = u16::try_from(row.get::<_, i64>(3)?) else {
        return Ok(None);
    };
    let Ok(process_id) = u32::try_from(row.get::<_, i64>(5)?) else {
        return Ok(None);
    };
    Ok(Some(PeerDocument {
        session_id,
        document_path: row.get(1)?,
        document_title: row.get(2)?,
        port,
        hostname: row.get(4)?,
        process_id,
        registered_at_ms: row.get(6)?,
        last_heartbeat_ms: row.get(7)?,
        last_sync_ms: row.get(8)?,
        last_activity_ms: row.get(9)?,
    }))
}

fn upsert_tx(tx: &Transaction<'_>, doc: &PeerDocument) -> Result<(), StoreError> {
    // registered_at_ms keeps its first value; optional timestamps are never cleared by a
    // heartbeat that does not carry them.
    tx.execute(
        r#"
        INSERT INTO peer_documents(
          session_id, document_key, document_path, document_title, port, hostname,
          process_id, registered_at_ms, last_heartbeat_ms, last_sync_ms, last_activity_ms
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        ON CONFLICT(session_id, document_key) DO UPDATE SET
          document_path=excluded.document_path,
          document_title=excluded.document_title,
          port=excluded.port,
          hostname=excluded.hostname,
          process_id=excluded.process_id,
          last_heartbeat_ms=excluded.last_heartbeat_ms,
          last_sync_ms=COALESCE(excluded.last_sync_ms, peer_documents.last_sync_ms),
          last_activity_ms=COALESCE(excluded.last_activity_ms, peer_documents.last_activity_ms)
        "#,
        params![
            doc.session_id.as_str(),
            document_key(&doc.document_path, &doc.document_title),
            doc.document_path.as_str(),
            doc.document_title.as_str(),
            i64::from(doc.port),
            doc.hostname.as_str(),
            i64::from(doc.process_id),
            doc.registered_at_ms,
            doc.last_heartbeat_ms,
            doc.last_sync_ms,
            doc.last_activity_ms,
        ],
    )?;
    Ok(())
}

impl SqliteStore {
    pub fn registry_upsert(&mut self, doc: &PeerDocument) -> Result<(), StoreError> {
        self.registry_upsert_batch(std::slice::from_ref(doc))?;
        Ok(())
    }

    /// All rows commit together or not at all.
    pub fn registry_upsert_batch(&mut self, docs: &[PeerDocument]) -> Result<usize, StoreError> {
        for doc in docs {
            validate_document(doc)?;
        }
        if docs.is_empty() {
            return Ok(0);
        }

        let tx = self.write_tx()?;
        for doc in docs {
            upsert_tx(&tx, doc)?;
        }
        tx.commit()?;
        Ok(docs.len())
    }

    /// Single-column refresh for high-frequency timestamps. Returns false when the row is gone.
    pub fn registry_touch(
        &mut self,
        session_id: &SessionId,
        document_key: &str,
        field: HeartbeatField,
        ts_ms: i64,
    ) -> Result<bool, StoreError> {
        let sql = format!(
            "UPDATE peer_documents SET {} = ?1 WHERE session_id=?2 AND document_key=?3",
            field.column()
        );
        let updated = self
            .conn
            .execute(&sql, params![ts_ms, session_id.as_str(), document_key])?;
        Ok(updated > 0)
    }

    /// Every row regardless of freshness, ordered by document title.
    pub fn registry_all(&self) -> Result<Vec<PeerDocument>, StoreError> {
        self.query_peers(
            &format!(
                "SELECT {PEER_COLUMNS} FROM peer_documents \
                 ORDER BY document_title COLLATE NOCASE ASC, session_id ASC"
            ),
            [],
        )
    }

    pub fn registry_active(&self, now_ms: i64) -> Result<Vec<PeerDocument>, StoreError> {
        self.query_peers(
            &format!(
                "SELECT {PEER_COLUMNS} FROM peer_documents \
                 WHERE last_heartbeat_ms >= ?1 \
                 ORDER BY document_title COLLATE NOCASE ASC, session_id ASC"
            ),
            params![stale_cutoff(now_ms)],
        )
    }

    pub fn registry_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<PeerDocument>, StoreError> {
        self.query_peers(
            &format!(
                "SELECT {PEER_COLUMNS} FROM peer_documents \
                 WHERE session_id=?1 \
                 ORDER BY document_title COLLATE NOCASE ASC"
            ),
            params![session_id.as_str()],
        )
    }

    pub fn registry_remove_document(
        &mut self,
        session_id: &SessionId,
        document_key: &str,
    ) -> Result<bool, StoreError> {
        let deleted = self.conn.execute(
            "DELETE FROM peer_documents WHERE session_id=?1 AND document_key=?2",
            params![session_id.as_str(), document_key],
        )?;
        Ok(deleted > 0)
    }

    pub fn registry_remove_session(&mut self, session_id: &SessionId) -> Result<usize, StoreError> {
        Ok(self.conn.execute(
            "DELETE FROM peer_documents WHERE session_id=?1",
            params![session_id.as_str()],
        )?)
    }

    pub fn registry_remove_stale(&mut self, now_ms: i64) -> Result<usize, StoreError> {
        Ok(self.conn.execute(
            "DELETE FROM peer_documents WHERE last_heartbeat_ms < ?1",
            params![stale_cutoff(now_ms)],
        )?)
    }

    fn query_peers<P: Params>(&self, sql: &str, params: P) -> Result<Vec<PeerDocument>, StoreError> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            match read_peer_row(row)? {
                Some(doc) => out.push(doc),
                None => tracing::debug!("skipping malformed peer_documents row"),
            }
        }
        Ok(out)
    }
}

fn stale_cutoff(now_ms: i64) -> i64 {
    now_ms.saturating_sub(STALE_AFTER_MS)
}
