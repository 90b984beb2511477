#![forbid(unsafe_code)]

use crate::ids::SessionId;
use serde::{Deserialize, Serialize};

/// Rows whose heartbeat is older than this are considered dead.
pub const STALE_AFTER_MS: i64 = 120_000;

const UNTITLED_KEY_PREFIX: &str = "untitled:";

/// One document opened by one peer, as seen by every other peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDocument {
    pub session_id: SessionId,
    pub document_path: String,
    pub document_title: String,
    pub port: u16,
    pub hostname: String,
    pub process_id: u32,
    pub registered_at_ms: i64,
    pub last_heartbeat_ms: i64,
    pub last_sync_ms: Option<i64>,
    pub last_activity_ms: Option<i64>,
}

impl PeerDocument {
    pub fn document_key(&self) -> String {
        document_key(&self.document_path, &self.document_title)
    }

    pub fn is_live_at(&self, now_ms: i64) -> bool {
        now_ms.saturating_sub(self.last_heartbeat_ms) <= STALE_AFTER_MS
    }
}

/// Registry key of a document: its path, or its title when it was never saved.
pub fn document_key(document_path: &str, document_title: &str) -> String {
    let path = document_path.trim();
    if path.is_empty() {
        format!("{UNTITLED_KEY_PREFIX}{}", document_title.trim())
    } else {
        path.to_string()
    }
}

/// Single-column timestamps that can be refreshed without rewriting the row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeartbeatField {
    Heartbeat,
    Sync,
    Activity,
}

impl HeartbeatField {
    pub fn column(self) -> &'static str {
        match self {
            Self::Heartbeat => "last_heartbeat_ms",
            Self::Sync => "last_sync_ms",
            Self::Activity => "last_activity_ms",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SelectionItem {
    pub document_title: String,
    pub document_path: String,
    pub unique_id: String,
}

impl SelectionItem {
    pub fn new(
        document_title: impl Into<String>,
        document_path: impl Into<String>,
        unique_id: impl Into<String>,
    ) -> Self {
        Self {
            document_title: document_title.into(),
            document_path: document_path.into(),
            unique_id: unique_id.into(),
        }
    }

    /// Identity used when merging selections.
    pub fn merge_key(&self) -> (&str, &str) {
        (self.document_title.as_str(), self.unique_id.as_str())
    }
}

/// A view activation inside one document of one peer session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationEntry {
    pub session_id: SessionId,
    pub document_session_id: String,
    pub document_title: String,
    pub document_path: String,
    pub view_id: String,
    pub view_title: String,
    pub view_type: String,
    pub activated_at_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub session_id: SessionId,
    pub hostname: String,
    pub pid: u32,
}

impl PeerIdentity {
    pub fn new(hostname: impl Into<String>, pid: u32) -> Self {
        let hostname = hostname.into();
        Self {
            session_id: SessionId::for_process(&hostname, pid),
            hostname,
            pid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untitled_documents_are_keyed_by_title() {
        assert_eq!(document_key("C:/p/Proj.rvt", "Proj"), "C:/p/Proj.rvt");
        assert_eq!(document_key("  ", "Project1"), "untitled:Project1");
    }

    #[test]
    fn liveness_boundary_is_inclusive() {
        let doc = PeerDocument {
            session_id: SessionId::try_new("a-1").unwrap(),
            document_path: String::new(),
            document_title: "Proj".to_string(),
            port: 0,
            hostname: "a".to_string(),
            process_id: 1,
            registered_at_ms: 0,
            last_heartbeat_ms: 1_000,
            last_sync_ms: None,
            last_activity_ms: None,
        };
        assert!(doc.is_live_at(1_000 + STALE_AFTER_MS));
        assert!(!doc.is_live_at(1_000 + STALE_AFTER_MS + 1));
    }
}
