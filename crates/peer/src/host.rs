#![forbid(unsafe_code)]

use crate::heartbeat::OpenDocuments;
use peerlink_core::wire::RemoteRecord;
use peerlink_core::{ActivationEntry, HeartbeatField, PeerDocument, PeerIdentity, SelectionItem};
use peerlink_gateway::{CommandHost, ExecError, Output, RemoteCommand};
use peerlink_storage::SharedStore;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::PoisonError;

/// A peer without an application behind it. It answers the built-in commands from its
/// list of open documents and records what other peers send it.
pub(crate) struct HeadlessHost {
    identity: PeerIdentity,
    store: SharedStore,
    documents: OpenDocuments,
    port: u16,
}

impl HeadlessHost {
    pub(crate) fn new(
        identity: PeerIdentity,
        store: SharedStore,
        documents: OpenDocuments,
        port: u16,
    ) -> Self {
        Self {
            identity,
            store,
            documents,
            port,
        }
    }

    fn snapshot(&self) -> Vec<PeerDocument> {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn list_documents(&self, out: &mut Output) {
        for doc in self.snapshot() {
            out.record(
                &RemoteRecord::new("DOCUMENT", doc.document_key())
                    .with_field("Title", doc.document_title)
                    .with_field("Path", doc.document_path),
            );
        }
    }

    fn synchronize(&self, out: &mut Output) -> Result<(), ExecError> {
        let docs = self.snapshot();
        if docs.is_empty() {
            return Err(ExecError::Failed("no open documents".to_string()));
        }
        let mut failed = 0usize;
        for doc in docs {
            match self
                .store
                .touch(&self.identity.session_id, &doc.document_key(), HeartbeatField::Sync)
            {
                Ok(_) => out.record(&RemoteRecord::new("SYNCED", doc.document_title)),
                Err(err) => {
                    failed += 1;
                    out.error(&format!("{}: {err}", doc.document_title));
                }
            }
        }
        if failed > 0 {
            return Err(ExecError::Failed(format!("{failed} document(s) not synchronized")));
        }
        Ok(())
    }

    fn apply_selection(&self, items: &[SelectionItem], out: &mut Output) -> Result<(), ExecError> {
        let open = self
            .snapshot()
            .into_iter()
            .map(|doc| doc.document_title)
            .collect::<HashSet<_>>();
        let (applicable, skipped): (Vec<_>, Vec<_>) = items
            .iter()
            .cloned()
            .partition(|item| open.contains(&item.document_title));

        let added = self
            .store
            .add_to_selection(&self.identity.session_id, &applicable)
            .map_err(|err| ExecError::Failed(err.to_string()))?;
        for item in &applicable {
            out.record(
                &RemoteRecord::new("SELECTED", item.unique_id.as_str())
                    .with_field("Document", item.document_title.as_str()),
            );
        }
        out.record(
            &RemoteRecord::new("SELECTION", self.identity.session_id.as_str())
                .with_field("Added", added.to_string())
                .with_field("Skipped", skipped.len().to_string()),
        );
        Ok(())
    }

    fn custom(&self, name: &str, args: &Value, out: &mut Output) -> Result<(), ExecError> {
        match name {
            "echo" => {
                let text = args.get("text").and_then(Value::as_str).unwrap_or_default();
                out.record(&RemoteRecord::new("ECHO", text));
                Ok(())
            }
            "open_document" => {
                let title = required_str(args, "title")?;
                let path = args.get("path").and_then(Value::as_str).unwrap_or_default();
                let doc = self.open_document(title, path)?;
                out.record(&RemoteRecord::new("OPENED", doc.document_key()).with_field("Title", title));
                Ok(())
            }
            "close_document" => {
                let title = required_str(args, "title")?;
                let closed = self.close_document(title)?;
                out.record(&RemoteRecord::new("CLOSED", title).with_field("Rows", closed.to_string()));
                Ok(())
            }
            "log_view" => {
                let entry = self.activation_from_args(args)?;
                let id = self
                    .store
                    .log_activation(&entry)
                    .map_err(|err| ExecError::Failed(err.to_string()))?;
                if let Some(key) = self.document_key_for_title(&entry.document_title) {
                    let touched =
                        self.store
                            .touch(&self.identity.session_id, &key, HeartbeatField::Activity);
                    if let Err(err) = touched {
                        tracing::warn!(error = %err, "activity timestamp not updated");
                    }
                }
                out.record(
                    &RemoteRecord::new("LOGGED", id.to_string())
                        .with_field("View", entry.view_title),
                );
                Ok(())
            }
            "recent_views" => {
                let title = required_str(args, "document_title")?;
                for entry in self.store.recent_views(&self.identity.session_id, title) {
                    out.record(
                        &RemoteRecord::new("VIEW", entry.view_id)
                            .with_field("Title", entry.view_title)
                            .with_field("Type", entry.view_type),
                    );
                }
                Ok(())
            }
            other => Err(ExecError::Unsupported(other.to_string())),
        }
    }

    /// Adds a document (or refreshes the existing one with the same title) and registers it now
    /// instead of waiting for the next heartbeat.
    pub(crate) fn open_document(&self, title: &str, path: &str) -> Result<PeerDocument, ExecError> {
        let now_ms = self.store.now_ms();
        let doc = PeerDocument {
            session_id: self.identity.session_id.clone(),
            document_path: path.to_string(),
            document_title: title.to_string(),
            port: self.port,
            hostname: self.identity.hostname.clone(),
            process_id: self.identity.pid,
            registered_at_ms: now_ms,
            last_heartbeat_ms: now_ms,
            last_sync_ms: None,
            last_activity_ms: None,
        };
        // Held across the store writes. Lock order: documents, then store.
        let mut docs = self.documents.lock().unwrap_or_else(PoisonError::into_inner);
        self.store
            .register(std::slice::from_ref(&doc))
            .map_err(|err| ExecError::Failed(err.to_string()))?;
        let (replaced, kept): (Vec<_>, Vec<_>) = docs
            .drain(..)
            .partition(|existing| existing.document_title == doc.document_title);
        *docs = kept;
        docs.push(doc.clone());
        let key = doc.document_key();
        for old in replaced.iter().filter(|old| old.document_key() != key) {
            if let Err(err) = self
                .store
                .unregister_document(&self.identity.session_id, &old.document_key())
            {
                tracing::warn!(error = %err, "stale document row left to expire");
            }
        }
        Ok(doc)
    }

    fn close_document(&self, title: &str) -> Result<usize, ExecError> {
        let mut docs = self.documents.lock().unwrap_or_else(PoisonError::into_inner);
        let (removed, kept): (Vec<_>, Vec<_>) =
            docs.drain(..).partition(|doc| doc.document_title == title);
        *docs = kept;
        if removed.is_empty() {
            return Err(ExecError::InvalidArgs(format!("document {title:?} is not open")));
        }
        let mut rows = 0;
        for doc in &removed {
            if self
                .store
                .unregister_document(&self.identity.session_id, &doc.document_key())
                .map_err(|err| ExecError::Failed(err.to_string()))?
            {
                rows += 1;
            }
        }
        Ok(rows)
    }

    fn document_key_for_title(&self, title: &str) -> Option<String> {
        self.snapshot()
            .into_iter()
            .find(|doc| doc.document_title == title)
            .map(|doc| doc.document_key())
    }

    fn activation_from_args(&self, args: &Value) -> Result<ActivationEntry, ExecError> {
        let document_title = required_str(args, "document_title")?;
        let document_path = self
            .snapshot()
            .into_iter()
            .find(|doc| doc.document_title == document_title)
            .map(|doc| doc.document_path)
            .unwrap_or_default();
        let optional = |key: &str| {
            args.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let document_session_id = match optional("document_session_id") {
            id if id.is_empty() => self.identity.session_id.to_string(),
            id => id,
        };
        Ok(ActivationEntry {
            session_id: self.identity.session_id.clone(),
            document_session_id,
            document_title: document_title.to_string(),
            document_path,
            view_id: required_str(args, "view_id")?.to_string(),
            view_title: optional("view_title"),
            view_type: optional("view_type"),
            activated_at_ms: self.store.now_ms(),
        })
    }
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, ExecError> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ExecError::InvalidArgs(format!("missing string argument {key:?}")))
}

impl CommandHost for HeadlessHost {
    fn execute(&mut self, command: &RemoteCommand, out: &mut Output) -> Result<(), ExecError> {
        match command {
            RemoteCommand::ListDocuments => {
                self.list_documents(out);
                Ok(())
            }
            RemoteCommand::Synchronize => self.synchronize(out),
            RemoteCommand::ApplySelection { items } => self.apply_selection(items, out),
            RemoteCommand::Custom { name, args } => self.custom(name, args, out),
            RemoteCommand::Ping => Err(ExecError::Unsupported(command.name().to_string())),
        }
    }
}
