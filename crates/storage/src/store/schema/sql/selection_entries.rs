#![forbid(unsafe_code)]

pub(super) const SQL: &str = r#"

        -- Cross-peer selection snapshot: one row per document, ids comma-joined.
        -- The whole table is replaced on every save.
        CREATE TABLE IF NOT EXISTS selection_entries (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          document_title TEXT NOT NULL,
          document_path TEXT NOT NULL,
          unique_ids TEXT NOT NULL,
          session_id TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL
        );
"#;
