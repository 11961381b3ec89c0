// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Per-document synchronization state for one session.
//!
//! A [`DocumentSynchronizer`] turns editor edits into `textDocument/*`
//! notification parameters. It never sends anything itself: the owning
//! session asks it for parameters and writes them to its client, holding
//! [`DocumentSynchronizer::lock_send`] so versions hit the wire in order.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lsp_types::{
    DidChangeTextDocumentParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams,
    DidSaveTextDocumentParams, Range, TextDocumentContentChangeEvent, TextDocumentIdentifier,
    TextDocumentItem, TextDocumentSyncKind, Uri, VersionedTextDocumentIdentifier,
};
use tracing::debug;

use super::capabilities::SyncSettings;
use crate::document::{DocumentEdit, TextBuffer};

/// Version of the `didOpen` notification.
pub const INITIAL_VERSION: i32 = 1;

#[derive(Debug, Clone)]
enum PendingChange {
    Event(TextDocumentContentChangeEvent),
    /// The range could not be computed; the next `after_change` fills in
    /// the whole text.
    FullTextPending,
}

#[derive(Debug)]
struct SyncState {
    version: i32,
    pending: Vec<PendingChange>,
    last_text: String,
}

/// Synchronization state of one document on one session.
#[derive(Debug)]
pub struct DocumentSynchronizer {
    uri: Uri,
    language_id: String,
    settings: SyncSettings,
    state: Mutex<SyncState>,
    send_lock: Arc<tokio::sync::Mutex<()>>,
}

impl DocumentSynchronizer {
    /// Creates the synchronizer for a freshly opened document.
    #[must_use]
    pub fn new(uri: Uri, language_id: String, settings: SyncSettings, text: &TextBuffer) -> Self {
        Self {
            uri,
            language_id,
            settings,
            state: Mutex::new(SyncState {
                version: INITIAL_VERSION,
                pending: Vec::new(),
                last_text: text.text().to_string(),
            }),
            send_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn state(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Document URI.
    #[must_use]
    pub const fn uri(&self) -> &Uri {
        &self.uri
    }

    /// `languageId` sent on open.
    #[must_use]
    pub fn language_id(&self) -> &str {
        &self.language_id
    }

    /// Negotiated sync kind.
    #[must_use]
    pub const fn sync_kind(&self) -> TextDocumentSyncKind {
        self.settings.kind
    }

    /// Version of the last notification produced.
    #[must_use]
    pub fn version(&self) -> i32 {
        self.state().version
    }

    /// Text as of the last `after_change`.
    #[must_use]
    pub fn last_text(&self) -> String {
        self.state().last_text.clone()
    }

    /// Serializes sends for this document.
    pub async fn lock_send(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.send_lock.lock().await
    }

    /// Claims the send lock without waiting; `None` if someone holds it.
    ///
    /// Used to hold back every other send until `didOpen` went out.
    #[must_use]
    pub fn try_lock_send_owned(&self) -> Option<tokio::sync::OwnedMutexGuard<()>> {
        Arc::clone(&self.send_lock).try_lock_owned().ok()
    }

    /// `didOpen` parameters, always at [`INITIAL_VERSION`].
    #[must_use]
    pub fn open_params(&self) -> DidOpenTextDocumentParams {
        DidOpenTextDocumentParams {
            text_document: TextDocumentItem {
                uri: self.uri.clone(),
                language_id: self.language_id.clone(),
                version: INITIAL_VERSION,
                text: self.state().last_text.clone(),
            },
        }
    }

    /// Pre-edit hook. Under incremental sync, records the edit against the
    /// pre-edit coordinates of `buffer`.
    pub fn before_change(&self, buffer: &TextBuffer, edit: &DocumentEdit) {
        if self.settings.kind != TextDocumentSyncKind::INCREMENTAL {
            return;
        }

        let start = buffer.position_at(edit.offset);
        let end = edit
            .offset
            .checked_add(edit.old_len)
            .and_then(|end| buffer.position_at(end));
        let removed_units = buffer
            .text()
            .get(edit.offset..edit.offset.saturating_add(edit.old_len))
            .and_then(|removed| u32::try_from(removed.encode_utf16().count()).ok());

        let change = match (start, end, removed_units) {
            (Some(start), Some(end), Some(range_length)) => {
                PendingChange::Event(TextDocumentContentChangeEvent {
                    range: Some(Range::new(start, end)),
                    range_length: Some(range_length),
                    text: edit.new_text.clone(),
                })
            }
            _ => {
                debug!(
                    "Edit {:?} has no valid range in {}, falling back to full text",
                    edit,
                    self.uri.as_str()
                );
                PendingChange::FullTextPending
            }
        };
        self.state().pending.push(change);
    }

    /// Post-edit hook.
    ///
    /// Full sync replaces the queue with one whole-text event; incremental
    /// sync fills any full-text placeholder. The last known text is always
    /// refreshed.
    pub fn after_change(&self, buffer: &TextBuffer) {
        let mut state = self.state();
        let text = buffer.text();

        if self.settings.kind == TextDocumentSyncKind::FULL {
            state.pending = vec![PendingChange::Event(full_text_event(text))];
        } else if self.settings.kind == TextDocumentSyncKind::INCREMENTAL {
            for change in &mut state.pending {
                if matches!(change, PendingChange::FullTextPending) {
                    *change = PendingChange::Event(full_text_event(text));
                }
            }
        }
        text.clone_into(&mut state.last_text);
    }

    /// Drains the queue into one `didChange`, bumping the version under the
    /// same lock. An empty queue yields `None` and keeps the version.
    #[must_use]
    pub fn take_commit(&self) -> Option<DidChangeTextDocumentParams> {
        let mut state = self.state();
        if state.pending.is_empty() {
            return None;
        }
        state.version += 1;
        let last_text = state.last_text.clone();
        let content_changes = state
            .pending
            .drain(..)
            .map(|change| match change {
                PendingChange::Event(event) => event,
                PendingChange::FullTextPending => full_text_event(&last_text),
            })
            .collect();

        Some(DidChangeTextDocumentParams {
            text_document: VersionedTextDocumentIdentifier {
                uri: self.uri.clone(),
                version: state.version,
            },
            content_changes,
        })
    }

    /// `didSave` parameters, or `None` when the server does not want saves.
    #[must_use]
    pub fn save_params(&self, buffer: &TextBuffer) -> Option<DidSaveTextDocumentParams> {
        let save = self.settings.save?;
        Some(DidSaveTextDocumentParams {
            text_document: TextDocumentIdentifier::new(self.uri.clone()),
            text: save.include_text.then(|| buffer.text().to_string()),
        })
    }

    /// `didClose` parameters.
    #[must_use]
    pub fn close_params(&self) -> DidCloseTextDocumentParams {
        DidCloseTextDocumentParams {
            text_document: TextDocumentIdentifier::new(self.uri.clone()),
        }
    }
}

fn full_text_event(text: &str) -> TextDocumentContentChangeEvent {
    TextDocumentContentChangeEvent {
        range: None,
        range_length: None,
        text: text.to_string(),
    }
}
