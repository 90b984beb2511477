#![forbid(unsafe_code)]

pub(super) const SQL: &str = r#"

        -- Append-only view activation log. Duplicates are allowed; readers deduplicate.
        CREATE TABLE IF NOT EXISTS activation_log (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          session_id TEXT NOT NULL,
          document_session_id TEXT NOT NULL,
          document_title TEXT NOT NULL,
          document_path TEXT NOT NULL,
          view_id TEXT NOT NULL,
          view_title TEXT NOT NULL,
          view_type TEXT NOT NULL,
          activated_at_ms INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS activation_log_by_session
          ON activation_log(session_id, activated_at_ms);
        CREATE INDEX IF NOT EXISTS activation_log_by_document
          ON activation_log(document_title, activated_at_ms);
"#;
