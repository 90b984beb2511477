#![forbid(unsafe_code)]

use crate::{SqliteStore, StoreError};
use peerlink_core::ids::SessionId;
use peerlink_core::{
    ActivationEntry, Clock, HeartbeatField, PeerDocument, SelectionItem, SystemClock,
};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

/// Process-wide handle on the registry database.
///
/// Writes return their errors: a failed registration leaves the peer invisible and the caller
/// should know. Reads never fail: the registry is a convenience on top of the host's primary
/// workflow, so any backing-store error is logged and reported as "no data".
///
/// The mutex keeps two threads of this process from interleaving a multi-statement write.
#[derive(Clone, Debug)]
pub struct SharedStore {
    store: Arc<Mutex<SqliteStore>>,
    clock: Arc<dyn Clock>,
}

impl SharedStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self::new(SqliteStore::open(db_path)?, Arc::new(SystemClock)))
    }

    pub fn new(store: SqliteStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
            clock,
        }
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn with_store<T>(
        &self,
        f: impl FnOnce(&mut SqliteStore) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    fn read_or_empty<T: Default>(
        &self,
        what: &'static str,
        f: impl FnOnce(&mut SqliteStore) -> Result<T, StoreError>,
    ) -> T {
        match self.with_store(f) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(what, error = %err, "registry read failed; treating as empty");
                T::default()
            }
        }
    }

    // Registry

    pub fn register(&self, docs: &[PeerDocument]) -> Result<usize, StoreError> {
        self.with_store(|store| store.registry_upsert_batch(docs))
    }

    pub fn touch(
        &self,
        session_id: &SessionId,
        document_key: &str,
        field: HeartbeatField,
    ) -> Result<bool, StoreError> {
        let now_ms = self.now_ms();
        self.with_store(|store| store.registry_touch(session_id, document_key, field, now_ms))
    }

    pub fn unregister_document(
        &self,
        session_id: &SessionId,
        document_key: &str,
    ) -> Result<bool, StoreError> {
        self.with_store(|store| store.registry_remove_document(session_id, document_key))
    }

    pub fn remove_session(&self, session_id: &SessionId) -> Result<usize, StoreError> {
        self.with_store(|store| store.registry_remove_session(session_id))
    }

    pub fn sweep_stale(&self) -> Result<usize, StoreError> {
        let now_ms = self.now_ms();
        self.with_store(|store| store.registry_remove_stale(now_ms))
    }

    pub fn all_peers(&self) -> Vec<PeerDocument> {
        self.read_or_empty("registry_all", |store| store.registry_all())
    }

    /// Live rows only. Sweeps expired rows first when the database is writable.
    pub fn active_peers(&self) -> Vec<PeerDocument> {
        if let Err(err) = self.sweep_stale() {
            tracing::debug!(error = %err, "stale sweep skipped");
        }
        let now_ms = self.now_ms();
        self.read_or_empty("registry_active", |store| store.registry_active(now_ms))
    }

    pub fn session_documents(&self, session_id: &SessionId) -> Vec<PeerDocument> {
        self.read_or_empty("registry_for_session", |store| {
            store.registry_for_session(session_id)
        })
    }

    /// Titles of every document some live peer has open, sorted and distinct.
    pub fn open_titles(&self) -> Vec<String> {
        let mut titles = self
            .active_peers()
            .into_iter()
            .map(|doc| doc.document_title)
            .collect::<Vec<_>>();
        titles.sort();
        titles.dedup();
        titles
    }

    /// `(hostname, port)` of a live session that advertises a gateway.
    pub fn peer_endpoint(&self, session_id: &SessionId) -> Option<(String, u16)> {
        let now_ms = self.now_ms();
        self.session_documents(session_id)
            .into_iter()
            .filter(|doc| doc.port != 0 && doc.is_live_at(now_ms))
            .max_by_key(|doc| doc.last_heartbeat_ms)
            .map(|doc| (doc.hostname, doc.port))
    }

    // Selection

    pub fn save_selection(
        &self,
        session_id: &SessionId,
        items: &[SelectionItem],
    ) -> Result<usize, StoreError> {
        let now_ms = self.now_ms();
        self.with_store(|store| store.selection_save(session_id, items, now_ms))
    }

    pub fn add_to_selection(
        &self,
        session_id: &SessionId,
        items: &[SelectionItem],
    ) -> Result<usize, StoreError> {
        let now_ms = self.now_ms();
        self.with_store(|store| store.selection_add(session_id, items, now_ms))
    }

    pub fn selection(&self) -> Vec<SelectionItem> {
        self.read_or_empty("selection_load", |store| store.selection_load())
    }

    /// Stored selection restricted to documents some live peer has open.
    pub fn selection_for_open_peers(&self) -> Vec<SelectionItem> {
        let titles = self.open_titles();
        if titles.is_empty() {
            return Vec::new();
        }
        self.read_or_empty("selection_load_for_titles", |store| {
            store.selection_load_for_titles(&titles)
        })
    }

    pub fn clear_selection(&self) -> Result<usize, StoreError> {
        self.with_store(|store| store.selection_clear())
    }

    // History

    pub fn log_activation(&self, entry: &ActivationEntry) -> Result<i64, StoreError> {
        self.with_store(|store| store.history_log(entry))
    }

    pub fn history_for_session(&self, session_id: &SessionId, limit: usize) -> Vec<ActivationEntry> {
        self.read_or_empty("history_for_session", |store| {
            store.history_for_session(session_id, limit)
        })
    }

    pub fn recent_views(&self, session_id: &SessionId, document_title: &str) -> Vec<ActivationEntry> {
        self.read_or_empty("history_recent_views", |store| {
            store.history_recent_views(session_id, document_title)
        })
    }

    pub fn previous_session_views(
        &self,
        document_title: &str,
        exclude_session: &SessionId,
        limit: usize,
    ) -> Vec<ActivationEntry> {
        self.read_or_empty("history_previous_session_views", |store| {
            store.history_previous_session_views(document_title, exclude_session, limit)
        })
    }

    pub fn remove_from_history(
        &self,
        session_id: &SessionId,
        document_title: &str,
        view_title: &str,
    ) -> Result<usize, StoreError> {
        self.with_store(|store| store.history_remove(session_id, document_title, view_title))
    }

    pub fn prune_history(&self, keep_per_session: usize) -> Result<usize, StoreError> {
        self.with_store(|store| store.history_prune(keep_per_session))
    }
}
