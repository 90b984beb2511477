#![forbid(unsafe_code)]

pub(super) const SQL: &str = r#"

        -- One row per (peer session, document). Rows are owned by the writing session and
        -- refreshed by its heartbeat; any peer may delete rows whose heartbeat expired.
        --
        -- document_key is the document path, or `untitled:<title>` for unsaved documents.
        CREATE TABLE IF NOT EXISTS peer_documents (
          session_id TEXT NOT NULL,
          document_key TEXT NOT NULL,
          document_path TEXT NOT NULL,
          document_title TEXT NOT NULL,
          port INTEGER NOT NULL,
          hostname TEXT NOT NULL,
          process_id INTEGER NOT NULL,
          registered_at_ms INTEGER NOT NULL,
          last_heartbeat_ms INTEGER NOT NULL,
          last_sync_ms INTEGER,
          last_activity_ms INTEGER,
          PRIMARY KEY (session_id, document_key)
        );

        CREATE INDEX IF NOT EXISTS peer_documents_by_heartbeat
          ON peer_documents(last_heartbeat_ms);
"#;
