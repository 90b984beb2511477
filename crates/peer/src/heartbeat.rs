#![forbid(unsafe_code)]

use peerlink_core::PeerDocument;
use peerlink_core::ids::SessionId;
use peerlink_storage::{SharedStore, StoreError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Documents this peer currently has open. Shared by the host and the heartbeat.
pub(crate) type OpenDocuments = Arc<Mutex<Vec<PeerDocument>>>;

const STOP_POLL: Duration = Duration::from_millis(100);

/// Keeps this peer's registry rows fresh. Every beat re-upserts all open documents in one
/// transaction and sweeps rows whose owners stopped beating.
pub(crate) struct Heartbeat {
    store: SharedStore,
    session_id: SessionId,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub(crate) fn start(
        store: SharedStore,
        session_id: SessionId,
        documents: OpenDocuments,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let store = store.clone();
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("peerlink-heartbeat".to_string())
                .spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        match beat(&store, &documents) {
                            Ok(rows) => tracing::debug!(rows, "heartbeat written"),
                            Err(err) => tracing::warn!(error = %err, "heartbeat failed"),
                        }
                        let next = Instant::now() + interval;
                        while Instant::now() < next && !stop.load(Ordering::Relaxed) {
                            std::thread::sleep(STOP_POLL.min(interval));
                        }
                    }
                })?
        };
        Ok(Self {
            store,
            session_id,
            stop,
            handle: Some(handle),
        })
    }

    /// Stops beating and removes this session's rows so peers stop seeing it at once.
    pub(crate) fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stop.store(true, Ordering::Relaxed);
        if handle.join().is_err() {
            tracing::warn!("heartbeat thread panicked");
        }
        match self.store.remove_session(&self.session_id) {
            Ok(rows) => tracing::info!(session = %self.session_id, rows, "unregistered"),
            Err(err) => tracing::warn!(error = %err, "failed to unregister; rows will expire"),
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}

pub(crate) fn beat(store: &SharedStore, documents: &OpenDocuments) -> Result<usize, StoreError> {
    let now_ms = store.now_ms();
    let written = {
        // Held across the write: a document closed meanwhile must not be re-registered.
        let mut docs = documents.lock().unwrap_or_else(PoisonError::into_inner);
        for doc in docs.iter_mut() {
            doc.last_heartbeat_ms = now_ms;
        }
        store.register(&docs)?
    };
    let swept = store.sweep_stale()?;
    if swept > 0 {
        tracing::info!(swept, "removed expired registry rows");
    }
    Ok(written)
}
